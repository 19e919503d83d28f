// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The Software Management object (9).

use super::package::{ForcedError, Package, PackageHeader, MAGIC_SW};
use super::persist::{store_logged, PersistError, RecordReader, RecordWriter, StateStore};
use super::sink::PackageSink;
use super::*;
use crate::lwm2m::exec_args;
use crate::scheduler::Scheduler;
use std::collections::VecDeque;

/// PkgName.
pub const SW_PKG_NAME: u16 = 0;
/// PkgVersion.
pub const SW_PKG_VERSION: u16 = 1;
/// Package.
pub const SW_PACKAGE: u16 = 2;
/// Package URI.
pub const SW_PACKAGE_URI: u16 = 3;
/// Install (executable).
pub const SW_INSTALL: u16 = 4;
/// Uninstall (executable).
pub const SW_UNINSTALL: u16 = 6;
/// Update State.
pub const SW_UPDATE_STATE: u16 = 7;
/// Update Supported Objects.
pub const SW_UPDATE_SUPPORTED_OBJECTS: u16 = 8;
/// Update Result.
pub const SW_UPDATE_RESULT: u16 = 9;
/// Activate (executable).
pub const SW_ACTIVATE: u16 = 10;
/// Deactivate (executable).
pub const SW_DEACTIVATE: u16 = 11;
/// Activation State.
pub const SW_ACTIVATION_STATE: u16 = 12;

const SW_RESOURCES: &[u16] = &[
    SW_PKG_NAME,
    SW_PKG_VERSION,
    SW_PACKAGE,
    SW_PACKAGE_URI,
    SW_INSTALL,
    SW_UNINSTALL,
    SW_UPDATE_STATE,
    SW_UPDATE_SUPPORTED_OBJECTS,
    SW_UPDATE_RESULT,
    SW_ACTIVATE,
    SW_DEACTIVATE,
    SW_ACTIVATION_STATE,
];

const RECORD_FORMAT: u8 = 1;

/// Update state of a software package.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SwState {
    /// No package.
    Initial,
    /// A package is arriving.
    DownloadStarted,
    /// The package arrived and awaits verification.
    Downloaded,
    /// The package is verified.
    Delivered,
    /// The package is installed.
    Installed,
}

impl SwState {
    /// Resource value.
    pub fn as_i64(self) -> i64 {
        match self {
            SwState::Initial => 0,
            SwState::DownloadStarted => 1,
            SwState::Downloaded => 2,
            SwState::Delivered => 3,
            SwState::Installed => 4,
        }
    }

    fn from_u8(x: u8) -> Option<SwState> {
        Some(match x {
            0 => SwState::Initial,
            1 => SwState::DownloadStarted,
            2 => SwState::Downloaded,
            3 => SwState::Delivered,
            4 => SwState::Installed,
            _ => return None,
        })
    }
}

/// Outcome of the last software management operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SwResult {
    /// Nothing to report.
    Initial,
    /// A package is being delivered.
    Downloading,
    /// The package is installed.
    Installed,
    /// The package was delivered and verified.
    DownloadedVerified,
    /// The package did not fit.
    NotEnoughSpace,
    /// Memory ran out during download.
    OutOfMemory,
    /// The download connection broke.
    ConnectionLost,
    /// The package failed verification.
    IntegrityFailure,
    /// The package is not a software package.
    UnsupportedPackageType,
    /// The package URI is invalid.
    InvalidUri,
    /// Updating the installed software failed.
    UpdateError,
    /// Installing failed.
    InstallationFailure,
    /// Uninstalling failed.
    UninstallationFailure,
}

impl SwResult {
    /// Resource value.
    pub fn as_i64(self) -> i64 {
        match self {
            SwResult::Initial => 0,
            SwResult::Downloading => 1,
            SwResult::Installed => 2,
            SwResult::DownloadedVerified => 3,
            SwResult::NotEnoughSpace => 50,
            SwResult::OutOfMemory => 51,
            SwResult::ConnectionLost => 52,
            SwResult::IntegrityFailure => 53,
            SwResult::UnsupportedPackageType => 54,
            SwResult::InvalidUri => 56,
            SwResult::UpdateError => 57,
            SwResult::InstallationFailure => 58,
            SwResult::UninstallationFailure => 59,
        }
    }

    fn from_u8(x: u8) -> Option<SwResult> {
        Some(match x {
            0 => SwResult::Initial,
            1 => SwResult::Downloading,
            2 => SwResult::Installed,
            3 => SwResult::DownloadedVerified,
            50 => SwResult::NotEnoughSpace,
            51 => SwResult::OutOfMemory,
            52 => SwResult::ConnectionLost,
            53 => SwResult::IntegrityFailure,
            54 => SwResult::UnsupportedPackageType,
            56 => SwResult::InvalidUri,
            57 => SwResult::UpdateError,
            58 => SwResult::InstallationFailure,
            59 => SwResult::UninstallationFailure,
            _ => return None,
        })
    }
}

impl From<DownloadFailure> for SwResult {
    fn from(failure: DownloadFailure) -> Self {
        match failure {
            DownloadFailure::ConnectionLost => SwResult::ConnectionLost,
            DownloadFailure::InvalidUri | DownloadFailure::UnsupportedProtocol => {
                SwResult::InvalidUri
            }
            DownloadFailure::NotEnoughSpace => SwResult::NotEnoughSpace,
            DownloadFailure::OutOfMemory => SwResult::OutOfMemory,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SwJob {
    Verify,
    InstallResult(bool),
}

/// The Software Management object, `/9/0`.
#[derive(Debug)]
pub struct SoftwareManagement {
    state: SwState,
    result: SwResult,
    activated: bool,
    supported_objects: bool,
    disable_repeated: bool,
    transfer: Transfer,
    header: Option<PackageHeader>,
    store: Box<dyn StateStore>,
    handler: Box<dyn UpdateHandler>,
    jobs: Scheduler<SwJob>,
    actions: VecDeque<UpdateAction>,
}

fn path() -> Lwm2mPath {
    Lwm2mPath::instance(OID_SOFTWARE_MANAGEMENT, 0)
}

fn resource(rid: u16) -> Lwm2mPath {
    Lwm2mPath::resource(OID_SOFTWARE_MANAGEMENT, 0, rid)
}

impl SoftwareManagement {
    /// Creates the object, restoring persisted state from `store`.
    pub fn new(
        sink: Box<dyn PackageSink>,
        store: Box<dyn StateStore>,
        handler: Box<dyn UpdateHandler>,
    ) -> SoftwareManagement {
        let mut sw = SoftwareManagement {
            state: SwState::Initial,
            result: SwResult::Initial,
            activated: false,
            supported_objects: false,
            disable_repeated: false,
            transfer: Transfer::new(path(), sink),
            header: None,
            store,
            handler,
            jobs: Scheduler::new(),
            actions: VecDeque::new(),
        };
        if let Err(e) = sw.restore() {
            warn!("{}: discarding persisted state: {}", path(), e);
            sw.transfer.abort();
            sw.persist();
        }
        sw
    }

    /// Makes activating active software, or deactivating inactive software,
    /// fail with Method Not Allowed.
    pub fn disable_repeated_activation(mut self, disable: bool) -> Self {
        self.disable_repeated = disable;
        self
    }

    /// Current state.
    pub fn state(&self) -> SwState {
        self.state
    }

    /// Current result.
    pub fn result(&self) -> SwResult {
        self.result
    }

    /// True when the installed software is active.
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    fn set_state(&mut self, state: SwState) {
        if self.state != state {
            info!("{}: state {:?} -> {:?}", path(), self.state, state);
            self.state = state;
            self.actions
                .push_back(UpdateAction::Changed(resource(SW_UPDATE_STATE)));
        }
    }

    fn set_result(&mut self, result: SwResult) {
        if self.result != result {
            info!("{}: result {:?} -> {:?}", path(), self.result, result);
            self.result = result;
            self.actions
                .push_back(UpdateAction::Changed(resource(SW_UPDATE_RESULT)));
            if !matches!(result, SwResult::Initial | SwResult::Downloading) {
                self.actions.push_back(UpdateAction::Report(path()));
            }
        }
    }

    fn set_activated(&mut self, activated: bool) {
        if self.activated != activated {
            self.activated = activated;
            self.actions
                .push_back(UpdateAction::Changed(resource(SW_ACTIVATION_STATE)));
        }
    }

    fn push(&mut self, action: Option<UpdateAction>) {
        if let Some(action) = action {
            self.actions.push_back(action);
        }
    }

    fn persist(&mut self) {
        let etag = self.transfer.etag();
        let header = self.header.as_ref();
        let record = RecordWriter::new(RECORD_FORMAT)
            .u8(self.state.as_i64() as u8)
            .u8(self.result.as_i64() as u8)
            .bool(self.activated)
            .u8(self.transfer.delivery().as_u8())
            .str(self.transfer.uri().unwrap_or(""))
            .u64(self.transfer.offset())
            .opt_bytes(etag.map(|e| e.as_bytes()))
            .bool(etag.map(|e| e.is_weak()).unwrap_or(false))
            .u32(header.map(|h| h.forced_error.as_u16() as u32).unwrap_or(0))
            .opt_bytes(
                header
                    .and_then(|h| h.package_version.as_deref())
                    .map(str::as_bytes),
            )
            .bool(self.supported_objects)
            .bool(self.transfer.is_suspended())
            .finish();
        store_logged(self.store.as_mut(), &record);
    }

    fn restore(&mut self) -> Result<(), PersistError> {
        let record = match self.store.load()? {
            Some(record) => record,
            None => return Ok(()),
        };
        let mut r = RecordReader::new(&record, RECORD_FORMAT)?;
        let state = SwState::from_u8(r.u8()?).ok_or(PersistError::Corrupt)?;
        let result = SwResult::from_u8(r.u8()?).ok_or(PersistError::Corrupt)?;
        let activated = r.bool()?;
        let delivery = Delivery::from_u8(r.u8()?);
        let uri = Some(r.str()?).filter(|u| !u.is_empty());
        let offset = r.u64()?;
        let etag_bytes = r.opt_bytes()?;
        let etag_weak = r.bool()?;
        let forced_error = r.u32()?;
        let package_version = r.or(None, |r| r.opt_bytes())?;
        let supported_objects = r.or(false, |r| r.bool())?;
        let suspended = r.or(false, |r| r.bool())?;

        self.state = state;
        self.result = result;
        self.activated = activated;
        self.supported_objects = supported_objects;
        let header = PackageHeader {
            magic: MAGIC_SW,
            version: if package_version.is_some() { 2 } else { 1 },
            forced_error: ForcedError::from_u16(forced_error as u16).unwrap_or_default(),
            package_version: package_version
                .map(|v| String::from_utf8_lossy(&v).into_owned()),
            ..Default::default()
        };
        info!("{}: restored {:?}/{:?}", path(), state, result);

        match state {
            SwState::Initial => (),
            SwState::DownloadStarted => match (delivery, uri) {
                (Delivery::Pull, Some(uri)) => {
                    let etag = etag_bytes.map(|b| ETag::with_weak(&b, etag_weak));
                    match self.transfer.restore_pull(uri, offset, etag, suspended) {
                        Ok(action) => self.push(action),
                        Err(failure) => self.fail_download(failure),
                    }
                }
                _ => {
                    self.transfer.abort();
                    self.set_state(SwState::Initial);
                    self.set_result(SwResult::ConnectionLost);
                    self.persist();
                }
            },
            SwState::Downloaded => {
                self.transfer.restore_complete(delivery, uri);
                self.jobs.schedule_at(Instant::now(), SwJob::Verify);
            }
            SwState::Delivered | SwState::Installed => {
                self.header = Some(header);
                self.transfer.restore_complete(delivery, uri);
            }
        }
        Ok(())
    }

    fn write_uri(&mut self, uri: &str) -> Result<(), ResponseError> {
        if self.state != SwState::Initial {
            return Err(ResponseError::MethodNotAllowed);
        }
        if uri.is_empty() {
            return Ok(());
        }
        match self.transfer.begin_pull(uri) {
            Ok(action) => {
                self.push(action);
                self.set_state(SwState::DownloadStarted);
                self.set_result(SwResult::Downloading);
            }
            Err(failure) => {
                self.transfer.abort();
                self.set_result(failure.into());
            }
        }
        self.persist();
        Ok(())
    }

    fn push_chunk(
        &mut self,
        now: Instant,
        offset: usize,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), ResponseError> {
        match self.state {
            SwState::Initial if offset == 0 => {
                if let Err(failure) = self.transfer.begin_push() {
                    self.fail_download(failure);
                    return Err(ResponseError::InternalServerError);
                }
                self.set_state(SwState::DownloadStarted);
                self.set_result(SwResult::Downloading);
                self.persist();
            }
            SwState::DownloadStarted
                if self.transfer.delivery() == Delivery::Push
                    && offset as u64 == self.transfer.offset() => {}
            SwState::Initial => return Err(ResponseError::RequestEntityIncomplete),
            _ => return Err(ResponseError::MethodNotAllowed),
        }

        if let Err(failure) = self.transfer.write(chunk) {
            self.fail_download(failure);
            return Err(ResponseError::InternalServerError);
        }
        if last {
            self.finish_download(now);
        }
        Ok(())
    }

    fn fail_download(&mut self, failure: DownloadFailure) {
        warn!("{}: download failed: {:?}", path(), failure);
        let action = self.transfer.abort();
        self.push(action);
        self.header = None;
        self.set_state(SwState::Initial);
        self.set_result(failure.into());
        self.persist();
    }

    fn finish_download(&mut self, now: Instant) {
        let action = self.transfer.settle();
        self.push(action);
        self.set_state(SwState::Downloaded);
        self.persist();
        self.jobs.schedule_at(now, SwJob::Verify);
    }

    fn verify(&mut self) {
        let verified = self
            .transfer
            .package()
            .map_err(SwResult::from)
            .and_then(|bytes| {
                Package::verify(&bytes, &MAGIC_SW).map_err(|e| {
                    warn!("{}: package rejected: {}", path(), e);
                    if e.is_integrity_failure() {
                        SwResult::IntegrityFailure
                    } else {
                        SwResult::UnsupportedPackageType
                    }
                })
            });

        match verified {
            Ok(package) => {
                self.header = Some(package.header);
                self.set_state(SwState::Delivered);
                self.set_result(SwResult::DownloadedVerified);
                self.actions
                    .push_back(UpdateAction::Changed(resource(SW_PKG_VERSION)));
            }
            Err(result) => {
                self.transfer.abort();
                self.header = None;
                self.set_state(SwState::Initial);
                self.set_result(result);
            }
        }
        self.persist();
    }

    fn install(&mut self, now: Instant) -> Result<(), ResponseError> {
        let header = match (&self.header, self.state) {
            (Some(header), SwState::Delivered) => header,
            _ => return Err(ResponseError::MethodNotAllowed),
        };
        if self.jobs.contains(|job| matches!(job, SwJob::InstallResult(_))) {
            return Err(ResponseError::MethodNotAllowed);
        }
        match self.handler.install(header) {
            InstallOutcome::Done(success) => self.install_result(success),
            InstallOutcome::Delayed(success) => {
                self.jobs
                    .schedule_in(now, SCHEDULER_TICK, SwJob::InstallResult(success));
            }
        }
        Ok(())
    }

    fn install_result(&mut self, success: bool) {
        if self.state != SwState::Delivered {
            return;
        }
        if success {
            self.set_state(SwState::Installed);
            self.set_result(SwResult::Installed);
        } else {
            self.set_result(SwResult::InstallationFailure);
        }
        self.persist();
    }

    fn uninstall(&mut self, args: &[u8]) -> Result<(), ResponseError> {
        let args = exec_args::parse(args)?;
        let prepare_for_update = match &args[..] {
            [] => false,
            [arg] if arg.value.is_none() && arg.id == 0 => false,
            [arg] if arg.value.is_none() && arg.id == 1 => true,
            _ => return Err(ResponseError::BadRequest),
        };

        match (self.state, prepare_for_update) {
            (SwState::Delivered, false) | (SwState::Installed, _) => (),
            _ => return Err(ResponseError::MethodNotAllowed),
        }

        let header = self.header.clone().unwrap_or_default();
        if !prepare_for_update && !self.handler.uninstall(&header) {
            self.set_result(SwResult::UninstallationFailure);
            self.persist();
            return Ok(());
        }

        let action = self.transfer.abort();
        self.push(action);
        self.header = None;
        if !prepare_for_update {
            self.set_activated(false);
        }
        self.set_state(SwState::Initial);
        self.set_result(SwResult::Initial);
        self.persist();
        Ok(())
    }

    fn set_activation(&mut self, activate: bool) -> Result<(), ResponseError> {
        let header = match (&self.header, self.state) {
            (Some(header), SwState::Installed) => header,
            _ => return Err(ResponseError::MethodNotAllowed),
        };
        if self.disable_repeated && self.activated == activate {
            return Err(ResponseError::MethodNotAllowed);
        }
        let ok = if activate {
            self.handler.activate(header)
        } else {
            self.handler.deactivate(header)
        };
        if !ok {
            return Err(ResponseError::InternalServerError);
        }
        self.set_activated(activate);
        self.persist();
        Ok(())
    }
}

impl UpdateObject for SoftwareManagement {
    fn oid(&self) -> u16 {
        OID_SOFTWARE_MANAGEMENT
    }

    fn instances(&self) -> Vec<u16> {
        vec![0]
    }

    fn resources(&self, _iid: u16) -> Vec<u16> {
        SW_RESOURCES.to_vec()
    }

    fn kind(&self, rid: u16) -> Result<ValueKind, ResponseError> {
        match rid {
            SW_PACKAGE => Ok(ValueKind::Opaque),
            SW_PACKAGE_URI => Ok(ValueKind::String),
            SW_UPDATE_SUPPORTED_OBJECTS => Ok(ValueKind::Boolean),
            x if SW_RESOURCES.contains(&x) => Err(ResponseError::MethodNotAllowed),
            _ => Err(ResponseError::NotFound),
        }
    }

    fn is_executable(&self, rid: u16) -> bool {
        matches!(rid, SW_INSTALL | SW_UNINSTALL | SW_ACTIVATE | SW_DEACTIVATE)
    }

    fn package_rid(&self) -> u16 {
        SW_PACKAGE
    }

    fn read(&self, iid: u16, rid: u16) -> Result<ResourceValue, ResponseError> {
        if iid != 0 {
            return Err(ResponseError::NotFound);
        }
        let header = self.header.as_ref();
        Ok(match rid {
            SW_PKG_NAME => Value::from(
                header
                    .map(|h| String::from_utf8_lossy(&h.magic).into_owned())
                    .unwrap_or_default(),
            ),
            SW_PKG_VERSION => Value::from(
                header
                    .and_then(|h| h.package_version.clone())
                    .unwrap_or_default(),
            ),
            SW_PACKAGE_URI => Value::from(self.transfer.uri().unwrap_or("")),
            SW_UPDATE_STATE => Value::Integer(self.state.as_i64()),
            SW_UPDATE_SUPPORTED_OBJECTS => Value::Boolean(self.supported_objects),
            SW_UPDATE_RESULT => Value::Integer(self.result.as_i64()),
            SW_ACTIVATION_STATE => Value::Boolean(self.activated),
            x if SW_RESOURCES.contains(&x) => return Err(ResponseError::MethodNotAllowed),
            _ => return Err(ResponseError::NotFound),
        }
        .into())
    }

    fn write(
        &mut self,
        now: Instant,
        iid: u16,
        rid: u16,
        value: &Value,
    ) -> Result<(), ResponseError> {
        if iid != 0 {
            return Err(ResponseError::NotFound);
        }
        match (rid, value) {
            (SW_PACKAGE_URI, Value::String(uri)) => self.write_uri(uri),
            (SW_PACKAGE, Value::Opaque(bytes)) => self.push_chunk(now, 0, bytes, true),
            (SW_UPDATE_SUPPORTED_OBJECTS, Value::Boolean(x)) => {
                self.supported_objects = *x;
                self.actions
                    .push_back(UpdateAction::Changed(resource(SW_UPDATE_SUPPORTED_OBJECTS)));
                self.persist();
                Ok(())
            }
            (SW_PACKAGE_URI, _) | (SW_PACKAGE, _) | (SW_UPDATE_SUPPORTED_OBJECTS, _) => {
                Err(ResponseError::BadRequest)
            }
            _ => self.kind(rid).map(|_| ()),
        }
    }

    fn write_package(
        &mut self,
        now: Instant,
        iid: u16,
        offset: usize,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), ResponseError> {
        if iid != 0 {
            return Err(ResponseError::NotFound);
        }
        self.push_chunk(now, offset, chunk, last)
    }

    fn execute(
        &mut self,
        now: Instant,
        iid: u16,
        rid: u16,
        args: &[u8],
    ) -> Result<(), ResponseError> {
        if iid != 0 {
            return Err(ResponseError::NotFound);
        }
        match rid {
            SW_INSTALL => self.install(now),
            SW_UNINSTALL => self.uninstall(args),
            SW_ACTIVATE => self.set_activation(true),
            SW_DEACTIVATE => self.set_activation(false),
            x if SW_RESOURCES.contains(&x) => Err(ResponseError::MethodNotAllowed),
            _ => Err(ResponseError::NotFound),
        }
    }

    fn download_event(
        &mut self,
        now: Instant,
        iid: u16,
        session: DownloadSession,
        event: DownloadEvent,
    ) {
        if iid != 0
            || self.state != SwState::DownloadStarted
            || !self.transfer.is_current(session)
        {
            debug!("{}: ignoring stale download event", path());
            return;
        }
        match event {
            DownloadEvent::ETag(etag) => {
                self.transfer.set_etag(etag);
                self.persist();
            }
            DownloadEvent::Data(data) => match self.transfer.write(&data) {
                Ok(()) => self.persist(),
                Err(failure) => self.fail_download(failure),
            },
            DownloadEvent::Restarted => match self.transfer.restart() {
                Ok(()) => self.persist(),
                Err(failure) => self.fail_download(failure),
            },
            DownloadEvent::Finished => match self.transfer.finish() {
                Ok(_) => self.finish_download(now),
                Err(failure) => self.fail_download(failure),
            },
            DownloadEvent::Failed(failure) => self.fail_download(failure),
        }
    }

    fn suspend_download(&mut self, iid: u16) -> bool {
        if iid != 0 || self.state != SwState::DownloadStarted {
            return false;
        }
        let (done, action) = self.transfer.suspend();
        self.push(action);
        if done {
            self.persist();
        }
        done
    }

    fn resume_download(&mut self, iid: u16) -> bool {
        if iid != 0 || self.state != SwState::DownloadStarted {
            return false;
        }
        let (done, action) = self.transfer.resume();
        self.push(action);
        if done {
            self.persist();
        }
        done
    }

    fn download_offset(&self, iid: u16) -> Option<u64> {
        if iid == 0 {
            Some(self.transfer.offset())
        } else {
            None
        }
    }

    fn enter_offline(&mut self) {
        let action = self.transfer.enter_offline();
        self.push(action);
    }

    fn exit_offline(&mut self) {
        let action = self.transfer.exit_offline();
        self.push(action);
    }

    fn on_registered(&mut self, _now: Instant) {}

    fn reset(&mut self, _now: Instant) {
        let action = self.transfer.abort();
        self.push(action);
        self.jobs.cancel_where(|_| true);
        self.header = None;
        self.set_activated(false);
        self.set_state(SwState::Initial);
        self.set_result(SwResult::Initial);
        self.persist();
    }

    fn poll_action(&mut self) -> Option<UpdateAction> {
        self.actions.pop_front()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.jobs.next_deadline()
    }

    fn handle_timeout(&mut self, now: Instant) {
        while let Some(job) = self.jobs.pop_due(now) {
            match job {
                SwJob::Verify if self.state == SwState::Downloaded => self.verify(),
                SwJob::Verify => (),
                SwJob::InstallResult(success) => self.install_result(success),
            }
        }
    }
}
