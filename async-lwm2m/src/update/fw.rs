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

//! The Firmware Update object (5), and the per-partition state machine it
//! shares with Advanced Firmware Update.

use super::package::{is_multi, split_multi, ForcedError, Package, PackageHeader, MAGIC_FW};
use super::persist::{store_logged, PersistError, RecordReader, RecordWriter, StateStore};
use super::sink::PackageSink;
use super::*;
use crate::scheduler::Scheduler;
use std::collections::VecDeque;

/// Package.
pub const FW_PACKAGE: u16 = 0;
/// Package URI.
pub const FW_PACKAGE_URI: u16 = 1;
/// Update (executable).
pub const FW_UPDATE: u16 = 2;
/// State.
pub const FW_STATE: u16 = 3;
/// Update Result.
pub const FW_RESULT: u16 = 5;
/// PkgName.
pub const FW_PKG_NAME: u16 = 6;
/// PkgVersion.
pub const FW_PKG_VERSION: u16 = 7;
/// Firmware Update Protocol Support.
pub const FW_PROTOCOL_SUPPORT: u16 = 8;
/// Firmware Update Delivery Method.
pub const FW_DELIVERY_METHOD: u16 = 9;

const RECORD_FORMAT: u8 = 1;

/// State of a firmware partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FwState {
    /// No package.
    Idle,
    /// A package is arriving.
    Downloading,
    /// A verified package is stored.
    Downloaded,
    /// The package is being applied.
    Updating,
}

impl FwState {
    /// Resource value.
    pub fn as_i64(self) -> i64 {
        match self {
            FwState::Idle => 0,
            FwState::Downloading => 1,
            FwState::Downloaded => 2,
            FwState::Updating => 3,
        }
    }

    fn from_u8(x: u8) -> Option<FwState> {
        Some(match x {
            0 => FwState::Idle,
            1 => FwState::Downloading,
            2 => FwState::Downloaded,
            3 => FwState::Updating,
            _ => return None,
        })
    }
}

/// Outcome of the last firmware update attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FwResult {
    /// Nothing to report.
    Initial,
    /// Update applied.
    Success,
    /// The package did not fit.
    NotEnoughSpace,
    /// Memory ran out during download.
    OutOfMemory,
    /// The download connection broke.
    ConnectionLost,
    /// The package failed verification.
    IntegrityFailure,
    /// The package is not meant for this partition.
    UnsupportedPackageType,
    /// The package URI is invalid.
    InvalidUri,
    /// Applying the update failed.
    Failed,
    /// The URI scheme is not supported.
    UnsupportedProtocol,
    /// The update was cancelled.
    Cancelled,
    /// The update was postponed.
    Deferred,
    /// A target partition was not ready.
    ConflictingState,
    /// A linked partition was not ready.
    DependencyError,
}

impl FwResult {
    /// Resource value.
    pub fn as_i64(self) -> i64 {
        match self {
            FwResult::Initial => 0,
            FwResult::Success => 1,
            FwResult::NotEnoughSpace => 2,
            FwResult::OutOfMemory => 3,
            FwResult::ConnectionLost => 4,
            FwResult::IntegrityFailure => 5,
            FwResult::UnsupportedPackageType => 6,
            FwResult::InvalidUri => 7,
            FwResult::Failed => 8,
            FwResult::UnsupportedProtocol => 9,
            FwResult::Cancelled => 10,
            FwResult::Deferred => 11,
            FwResult::ConflictingState => 12,
            FwResult::DependencyError => 13,
        }
    }

    fn from_u8(x: u8) -> Option<FwResult> {
        Some(match x {
            0 => FwResult::Initial,
            1 => FwResult::Success,
            2 => FwResult::NotEnoughSpace,
            3 => FwResult::OutOfMemory,
            4 => FwResult::ConnectionLost,
            5 => FwResult::IntegrityFailure,
            6 => FwResult::UnsupportedPackageType,
            7 => FwResult::InvalidUri,
            8 => FwResult::Failed,
            9 => FwResult::UnsupportedProtocol,
            10 => FwResult::Cancelled,
            11 => FwResult::Deferred,
            12 => FwResult::ConflictingState,
            13 => FwResult::DependencyError,
            _ => return None,
        })
    }
}

impl From<DownloadFailure> for FwResult {
    fn from(failure: DownloadFailure) -> Self {
        match failure {
            DownloadFailure::ConnectionLost => FwResult::ConnectionLost,
            DownloadFailure::InvalidUri => FwResult::InvalidUri,
            DownloadFailure::UnsupportedProtocol => FwResult::UnsupportedProtocol,
            DownloadFailure::NotEnoughSpace => FwResult::NotEnoughSpace,
            DownloadFailure::OutOfMemory => FwResult::OutOfMemory,
        }
    }
}

/// Urgency of an update, as set by the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Must not be deferred.
    Critical,
    /// Should be applied.
    Mandatory,
    /// May be skipped.
    Optional,
}

impl Severity {
    /// Resource value.
    pub fn as_i64(self) -> i64 {
        match self {
            Severity::Critical => 0,
            Severity::Mandatory => 1,
            Severity::Optional => 2,
        }
    }

    /// Parses a resource value.
    pub fn from_i64(x: i64) -> Option<Severity> {
        Some(match x {
            0 => Severity::Critical,
            1 => Severity::Mandatory,
            2 => Severity::Optional,
            _ => return None,
        })
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Mandatory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Pending {
    None,
    Restart,
    Delayed(bool),
    Nothing,
}

impl Pending {
    fn as_u8(self) -> u8 {
        match self {
            Pending::None => 0,
            Pending::Restart => 1,
            Pending::Delayed(true) => 2,
            Pending::Delayed(false) => 3,
            Pending::Nothing => 4,
        }
    }

    fn from_u8(x: u8) -> Pending {
        match x {
            1 => Pending::Restart,
            2 => Pending::Delayed(true),
            3 => Pending::Delayed(false),
            4 => Pending::Nothing,
            _ => Pending::None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FwJob {
    Finalize(bool),
}

/// State machine of one firmware partition.
#[derive(Debug)]
pub struct FwInstance {
    oid: u16,
    iid: u16,
    magic: [u8; 8],
    accept_multi: bool,
    state: FwState,
    result: FwResult,
    transfer: Transfer,
    header: Option<PackageHeader>,
    pending: Pending,
    severity: Severity,
    max_defer_period: u32,
    deferred_until: Option<Instant>,
    last_state_change: i64,
    conflicting: Vec<u16>,
    store: Box<dyn StateStore>,
    jobs: Scheduler<FwJob>,
    actions: VecDeque<UpdateAction>,
    multi: Option<Vec<Vec<u8>>>,
}

impl FwInstance {
    /// Creates the partition `/oid/iid` accepting packages with `magic`, and
    /// picks up where the persisted state in `store` left off.
    pub fn open(
        oid: u16,
        iid: u16,
        magic: [u8; 8],
        sink: Box<dyn PackageSink>,
        store: Box<dyn StateStore>,
    ) -> FwInstance {
        let mut inst = FwInstance {
            oid,
            iid,
            magic,
            accept_multi: false,
            state: FwState::Idle,
            result: FwResult::Initial,
            transfer: Transfer::new(Lwm2mPath::instance(oid, iid), sink),
            header: None,
            pending: Pending::None,
            severity: Severity::default(),
            max_defer_period: 0,
            deferred_until: None,
            last_state_change: unix_now(),
            conflicting: Vec::new(),
            store,
            jobs: Scheduler::new(),
            actions: VecDeque::new(),
            multi: None,
        };

        match inst.restore() {
            Ok(true) => (),
            Ok(false) => debug!("{}: no persisted state", inst.path()),
            Err(e) => {
                warn!("{}: discarding persisted state: {}", inst.path(), e);
                inst.transfer.abort();
                inst.persist();
            }
        }
        inst
    }

    /// Lets the partition split multi-packages; see
    /// [`take_multi`](FwInstance::take_multi).
    pub fn accept_multi(mut self, accept: bool) -> FwInstance {
        self.accept_multi = accept;
        self
    }

    /// Path of the instance.
    pub fn path(&self) -> Lwm2mPath {
        Lwm2mPath::instance(self.oid, self.iid)
    }

    fn resource(&self, rid: u16) -> Lwm2mPath {
        Lwm2mPath::resource(self.oid, self.iid, rid)
    }

    /// Package magic this partition accepts.
    pub fn magic(&self) -> &[u8; 8] {
        &self.magic
    }

    /// Current state.
    pub fn state(&self) -> FwState {
        self.state
    }

    /// Current result.
    pub fn result(&self) -> FwResult {
        self.result
    }

    /// Header of the stored package, once verified.
    pub fn header(&self) -> Option<&PackageHeader> {
        self.header.as_ref()
    }

    /// The part of the stored package's version before the first `.`.
    pub fn version_family(&self) -> Option<&str> {
        self.header
            .as_ref()
            .and_then(|h| h.package_version.as_deref())
            .map(|v| v.split('.').next().unwrap_or(v))
    }

    /// Instances the stored package must be updated together with.
    pub fn linked(&self) -> Vec<u16> {
        self.header
            .as_ref()
            .map(|h| h.linked.iter().map(|x| *x as u16).collect())
            .unwrap_or_default()
    }

    /// Instances blocking the update of this one.
    pub fn conflicting(&self) -> &[u16] {
        &self.conflicting
    }

    /// Replaces the set of blocking instances.
    pub fn set_conflicting(&mut self, conflicting: Vec<u16>) {
        if self.conflicting != conflicting {
            self.conflicting = conflicting;
            self.actions
                .push_back(UpdateAction::Changed(self.resource(17)));
            self.persist();
        }
    }

    /// Update urgency.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Sets the update urgency.
    pub fn set_severity(&mut self, severity: Severity) {
        self.severity = severity;
        self.persist();
    }

    /// Longest time an update may be deferred, in seconds.
    pub fn max_defer_period(&self) -> u32 {
        self.max_defer_period
    }

    /// Sets the longest time an update may be deferred.
    pub fn set_max_defer_period(&mut self, seconds: u32) {
        self.max_defer_period = seconds;
        self.persist();
    }

    /// Unix time of the last state change.
    pub fn last_state_change(&self) -> i64 {
        self.last_state_change
    }

    /// Bytes stored for the package.
    pub fn offset(&self) -> u64 {
        self.transfer.offset()
    }

    /// When a pending result is applied, or a deferral runs out.
    pub fn deadline(&self) -> Option<Instant> {
        self.jobs.next_deadline().or(self.deferred_until)
    }

    /// Stores later packages at `path`. Only possible while idle.
    pub fn relocate_package(&mut self, path: &std::path::Path) -> bool {
        self.state == FwState::Idle && self.transfer.relocate(path)
    }

    /// Sub-packages of a multi-package that just arrived.
    pub fn take_multi(&mut self) -> Option<Vec<Vec<u8>>> {
        self.multi.take()
    }

    fn set_state(&mut self, state: FwState) {
        if self.state == state {
            return;
        }
        info!("{}: state {:?} -> {:?}", self.path(), self.state, state);
        self.state = state;
        self.last_state_change = unix_now();
        self.actions
            .push_back(UpdateAction::Changed(self.resource(FW_STATE)));
        if self.oid == OID_ADVANCED_FIRMWARE_UPDATE {
            self.actions
                .push_back(UpdateAction::Changed(self.resource(12)));
        }
    }

    fn set_result(&mut self, result: FwResult) {
        if self.result == result {
            return;
        }
        info!("{}: result {:?} -> {:?}", self.path(), self.result, result);
        self.result = result;
        self.actions
            .push_back(UpdateAction::Changed(self.resource(FW_RESULT)));
        if result != FwResult::Initial {
            self.actions.push_back(UpdateAction::Report(self.path()));
        }
    }

    fn push(&mut self, action: Option<UpdateAction>) {
        if let Some(action) = action {
            self.actions.push_back(action);
        }
    }

    fn record(&self) -> Vec<u8> {
        let etag = self.transfer.etag();
        let header = self.header.as_ref();
        RecordWriter::new(RECORD_FORMAT)
            .u8(self.state.as_i64() as u8)
            .u8(self.result.as_i64() as u8)
            .u8(self.transfer.delivery().as_u8())
            .str(self.transfer.uri().unwrap_or(""))
            .u64(self.transfer.offset())
            .opt_bytes(etag.map(|e| e.as_bytes()))
            .bool(etag.map(|e| e.is_weak()).unwrap_or(false))
            .u32(header.map(|h| h.forced_error.as_u16() as u32).unwrap_or(0))
            .u8(self.pending.as_u8())
            .opt_bytes(
                header
                    .and_then(|h| h.package_version.as_deref())
                    .map(str::as_bytes),
            )
            .bytes(header.map(|h| &h.linked[..]).unwrap_or(&[]))
            .u8(self.severity.as_i64() as u8)
            .u32(self.max_defer_period)
            .i64(self.last_state_change)
            .u16s(&self.conflicting)
            .bool(self.transfer.is_suspended())
            .finish()
    }

    fn persist(&mut self) {
        let record = self.record();
        store_logged(self.store.as_mut(), &record);
    }

    fn restore(&mut self) -> Result<bool, PersistError> {
        let record = match self.store.load()? {
            Some(record) => record,
            None => return Ok(false),
        };
        let mut r = RecordReader::new(&record, RECORD_FORMAT)?;
        let state = FwState::from_u8(r.u8()?).ok_or(PersistError::Corrupt)?;
        let result = FwResult::from_u8(r.u8()?).ok_or(PersistError::Corrupt)?;
        let delivery = Delivery::from_u8(r.u8()?);
        let uri = Some(r.str()?).filter(|u| !u.is_empty());
        let offset = r.u64()?;
        let etag_bytes = r.opt_bytes()?;
        let etag_weak = r.bool()?;
        let forced_error = r.u32()?;
        let pending = Pending::from_u8(r.u8()?);
        let package_version = r.or(None, |r| r.opt_bytes())?;
        let linked = r.or(Vec::new(), |r| r.bytes())?;
        let severity = r.or(1, |r| r.u8())?;
        let max_defer_period = r.or(0, |r| r.u32())?;
        let last_state_change = r.or(self.last_state_change, |r| r.i64())?;
        let conflicting = r.or(Vec::new(), |r| r.u16s())?;
        let suspended = r.or(false, |r| r.bool())?;

        self.state = state;
        self.result = result;
        self.pending = pending;
        self.severity = Severity::from_i64(severity as i64).unwrap_or_default();
        self.max_defer_period = max_defer_period;
        self.last_state_change = last_state_change;
        self.conflicting = conflicting;
        let header = PackageHeader {
            magic: self.magic,
            version: if package_version.is_some() { 2 } else { 1 },
            forced_error: ForcedError::from_u16(forced_error as u16).unwrap_or_default(),
            crc: 0,
            linked,
            package_version: package_version
                .map(|v| String::from_utf8_lossy(&v).into_owned()),
        };
        let etag = etag_bytes.map(|b| ETag::with_weak(&b, etag_weak));

        info!("{}: restored {:?}/{:?}", self.path(), state, result);

        match state {
            FwState::Idle => (),
            FwState::Downloading => match (delivery, uri) {
                (Delivery::Pull, Some(uri)) => {
                    match self.transfer.restore_pull(uri, offset, etag, suspended) {
                        Ok(action) => self.push(action),
                        Err(failure) => self.fail_download(failure),
                    }
                }
                _ => {
                    // A push cannot continue once the server's transfer is gone.
                    self.transfer.abort();
                    self.set_state(FwState::Idle);
                    self.set_result(FwResult::ConnectionLost);
                    self.persist();
                }
            },
            FwState::Downloaded => {
                self.header = Some(header);
                self.transfer.restore_complete(delivery, uri);
            }
            FwState::Updating => {
                self.header = Some(header);
                self.transfer.restore_complete(delivery, uri);
                match pending {
                    Pending::Restart => self.finish_update(true),
                    Pending::None => self.finish_update(false),
                    Pending::Delayed(_) | Pending::Nothing => (),
                }
            }
        }
        Ok(true)
    }

    /// Writes the package URI. An empty URI drops any package.
    pub fn write_uri(&mut self, uri: &str) -> Result<(), ResponseError> {
        if self.state == FwState::Updating {
            return Err(ResponseError::MethodNotAllowed);
        }
        if uri.is_empty() {
            self.reset_package(FwResult::Initial);
            return Ok(());
        }
        if self.state != FwState::Idle {
            return Err(ResponseError::BadRequest);
        }

        match self.transfer.begin_pull(uri) {
            Ok(action) => {
                self.push(action);
                self.set_result(FwResult::Initial);
                self.set_state(FwState::Downloading);
            }
            Err(failure) => {
                self.transfer.abort();
                self.set_result(failure.into());
            }
        }
        self.actions
            .push_back(UpdateAction::Changed(self.resource(FW_PACKAGE_URI)));
        self.persist();
        Ok(())
    }

    /// Writes the next chunk of a pushed package. An empty package or a
    /// single zero byte drops any package.
    pub fn write_package(
        &mut self,
        offset: usize,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), ResponseError> {
        if self.state == FwState::Updating {
            return Err(ResponseError::MethodNotAllowed);
        }
        if offset == 0 && last && (chunk.is_empty() || chunk == [0u8]) {
            self.reset_package(FwResult::Initial);
            return Ok(());
        }

        match self.state {
            FwState::Idle if offset == 0 => {
                if let Err(failure) = self.transfer.begin_push() {
                    self.fail_download(failure);
                    return Err(ResponseError::InternalServerError);
                }
                self.set_result(FwResult::Initial);
                self.set_state(FwState::Downloading);
                self.persist();
            }
            FwState::Downloading
                if self.transfer.delivery() == Delivery::Push
                    && offset as u64 == self.transfer.offset() => {}
            FwState::Idle => return Err(ResponseError::RequestEntityIncomplete),
            _ => return Err(ResponseError::BadRequest),
        }

        if let Err(failure) = self.transfer.write(chunk) {
            self.fail_download(failure);
            return Err(ResponseError::InternalServerError);
        }
        if last {
            self.finish_download();
        }
        Ok(())
    }

    /// Handles download progress.
    pub fn download_event(&mut self, session: DownloadSession, event: DownloadEvent) {
        if self.state != FwState::Downloading || !self.transfer.is_current(session) {
            debug!("{}: ignoring stale download event", self.path());
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
            DownloadEvent::Restarted => {
                info!("{}: origin changed, restarting download", self.path());
                match self.transfer.restart() {
                    Ok(()) => self.persist(),
                    Err(failure) => self.fail_download(failure),
                }
            }
            DownloadEvent::Finished => self.finish_download(),
            DownloadEvent::Failed(failure) => self.fail_download(failure),
        }
    }

    fn fail_download(&mut self, failure: DownloadFailure) {
        warn!("{}: download failed: {:?}", self.path(), failure);
        let action = self.transfer.abort();
        self.push(action);
        self.header = None;
        self.set_state(FwState::Idle);
        self.set_result(failure.into());
        self.persist();
    }

    fn finish_download(&mut self) {
        let bytes = match self.transfer.finish() {
            Ok(bytes) => bytes,
            Err(failure) => return self.fail_download(failure),
        };

        if self.accept_multi && is_multi(&bytes) {
            match split_multi(&bytes) {
                Ok(parts) => {
                    self.multi = Some(parts.into_iter().map(<[u8]>::to_vec).collect());
                }
                Err(e) => {
                    warn!("{}: {}", self.path(), e);
                    self.reject_package(FwResult::IntegrityFailure);
                }
            }
            return;
        }

        self.verify(&bytes);
    }

    fn verify(&mut self, bytes: &[u8]) {
        match Package::verify(bytes, &self.magic) {
            Ok(package) => {
                info!(
                    "{}: package verified ({} bytes, version {:?})",
                    self.path(),
                    package.payload.len(),
                    package.header.package_version
                );
                self.header = Some(package.header);
                let action = self.transfer.settle();
                self.push(action);
                self.set_state(FwState::Downloaded);
                self.set_result(FwResult::Initial);
                self.actions
                    .push_back(UpdateAction::Changed(self.resource(FW_PKG_VERSION)));
                self.persist();
            }
            Err(e) => {
                warn!("{}: package rejected: {}", self.path(), e);
                self.reject_package(if e.is_integrity_failure() {
                    FwResult::IntegrityFailure
                } else {
                    FwResult::UnsupportedPackageType
                });
            }
        }
    }

    fn reject_package(&mut self, result: FwResult) {
        let action = self.transfer.abort();
        self.push(action);
        self.header = None;
        self.set_state(FwState::Idle);
        self.set_result(result);
        self.persist();
    }

    /// Takes a complete package delivered through another instance, as a
    /// part of a multi-package.
    pub fn accept_package(&mut self, bytes: &[u8]) -> Result<(), ResponseError> {
        if matches!(self.state, FwState::Updating) {
            return Err(ResponseError::MethodNotAllowed);
        }
        if let Err(failure) = self.transfer.store_package(bytes) {
            self.fail_download(failure);
            return Err(ResponseError::InternalServerError);
        }
        self.set_state(FwState::Downloading);
        self.verify(bytes);
        Ok(())
    }

    /// Drops any package and returns to Idle with `result`.
    pub fn reset_package(&mut self, result: FwResult) {
        let action = self.transfer.abort();
        self.push(action);
        self.header = None;
        self.pending = Pending::None;
        self.deferred_until = None;
        self.jobs.cancel_where(|_| true);
        self.set_state(FwState::Idle);
        self.set_result(result);
        self.set_conflicting(Vec::new());
        self.persist();
    }

    /// Asks `handler` to apply the stored package, without changing state.
    /// The caller applies the outcome with
    /// [`apply_upgrade`](FwInstance::apply_upgrade).
    pub fn upgrade(
        &self,
        now: Instant,
        handler: &mut dyn UpdateHandler,
    ) -> Result<UpgradeOutcome, ResponseError> {
        let header = match (&self.header, self.state) {
            (Some(header), FwState::Downloaded) => header,
            _ => return Err(ResponseError::MethodNotAllowed),
        };
        let deferrable = self.severity != Severity::Critical
            && self.deferred_until.map(|t| now < t).unwrap_or(true);
        Ok(handler.perform_upgrade(&self.path(), header, deferrable))
    }

    /// Moves to the state an upgrade outcome calls for.
    pub fn apply_upgrade(&mut self, now: Instant, outcome: UpgradeOutcome) {
        self.set_state(FwState::Updating);
        match outcome {
            UpgradeOutcome::Restart => {
                self.pending = Pending::Restart;
                self.persist();
                self.actions.push_back(UpdateAction::Restart);
            }
            UpgradeOutcome::Delayed(success) => {
                self.pending = Pending::Delayed(success);
                self.persist();
                self.actions.push_back(UpdateAction::Restart);
            }
            UpgradeOutcome::Finished(success) => self.finish_update(success),
            UpgradeOutcome::Failed => self.finish_update(false),
            UpgradeOutcome::Deferred => {
                if self.deferred_until.is_none() && self.max_defer_period > 0 {
                    self.deferred_until =
                        Some(now + std::time::Duration::from_secs(self.max_defer_period.into()));
                }
                self.set_state(FwState::Downloaded);
                self.set_result(FwResult::Deferred);
                self.persist();
            }
            UpgradeOutcome::Pending => {
                self.pending = Pending::Nothing;
                self.persist();
            }
        }
    }

    /// Returns to Downloaded after a failed group update.
    pub fn roll_back(&mut self, result: FwResult) {
        self.set_state(FwState::Downloaded);
        self.set_result(result);
        self.persist();
    }

    /// Latches a result without changing state.
    pub fn latch_result(&mut self, result: FwResult) {
        self.set_result(result);
        self.persist();
    }

    fn finish_update(&mut self, success: bool) {
        info!(
            "{}: update {}",
            self.path(),
            if success { "succeeded" } else { "failed" }
        );
        let action = self.transfer.abort();
        self.push(action);
        self.header = None;
        self.pending = Pending::None;
        self.deferred_until = None;
        self.set_state(FwState::Idle);
        self.set_result(if success {
            FwResult::Success
        } else {
            FwResult::Failed
        });
        self.persist();
    }

    /// Cancels a download or a downloaded package.
    pub fn cancel(&mut self) -> Result<(), ResponseError> {
        match self.state {
            FwState::Downloading | FwState::Downloaded => {
                self.reset_package(FwResult::Cancelled);
                Ok(())
            }
            _ => Err(ResponseError::MethodNotAllowed),
        }
    }

    /// Pauses a pull download.
    pub fn suspend_download(&mut self) -> bool {
        if self.state != FwState::Downloading {
            return false;
        }
        let (done, action) = self.transfer.suspend();
        self.push(action);
        if done {
            info!("{}: download suspended", self.path());
            self.persist();
        }
        done
    }

    /// Resumes a paused pull download.
    pub fn resume_download(&mut self) -> bool {
        if self.state != FwState::Downloading {
            return false;
        }
        let (done, action) = self.transfer.resume();
        self.push(action);
        if done {
            info!("{}: download resumed", self.path());
            self.persist();
        }
        done
    }

    /// Pauses downloads while offline.
    pub fn enter_offline(&mut self) {
        let action = self.transfer.enter_offline();
        self.push(action);
    }

    /// Resumes downloads after going online.
    pub fn exit_offline(&mut self) {
        let action = self.transfer.exit_offline();
        self.push(action);
    }

    /// Schedules a delayed result once the new image has registered.
    pub fn on_registered(&mut self, now: Instant) {
        if let (FwState::Updating, Pending::Delayed(success)) = (self.state, self.pending) {
            if self.jobs.is_empty() {
                self.jobs
                    .schedule_in(now, SCHEDULER_TICK, FwJob::Finalize(success));
            }
        }
    }

    /// Next requested action.
    pub fn poll_action(&mut self) -> Option<UpdateAction> {
        self.actions.pop_front()
    }

    /// Next job deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.jobs.next_deadline()
    }

    /// Runs due jobs.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(job) = self.jobs.pop_due(now) {
            match job {
                FwJob::Finalize(success) if self.state == FwState::Updating => {
                    self.finish_update(success)
                }
                FwJob::Finalize(_) => (),
            }
        }
    }

    /// Reads a resource shared by both firmware objects.
    pub fn read(&self, rid: u16) -> Result<ResourceValue, ResponseError> {
        Ok(match rid {
            FW_PACKAGE_URI => Value::from(self.transfer.uri().unwrap_or("")).into(),
            FW_STATE => Value::Integer(self.state.as_i64()).into(),
            FW_RESULT => Value::Integer(self.result.as_i64()).into(),
            FW_PKG_NAME => Value::from(match &self.header {
                Some(header) => String::from_utf8_lossy(&header.magic).into_owned(),
                None => String::new(),
            })
            .into(),
            FW_PKG_VERSION => Value::from(
                self.header
                    .as_ref()
                    .and_then(|h| h.package_version.clone())
                    .unwrap_or_default(),
            )
            .into(),
            FW_PROTOCOL_SUPPORT => ResourceValue::Multiple(
                PROTOCOL_SUPPORT
                    .iter()
                    .map(|(riid, x)| (*riid, Value::Integer(*x)))
                    .collect(),
            ),
            // Pull and push.
            FW_DELIVERY_METHOD => Value::Integer(2).into(),
            FW_PACKAGE | FW_UPDATE => return Err(ResponseError::MethodNotAllowed),
            _ => return Err(ResponseError::NotFound),
        })
    }
}

/// The Firmware Update object, `/5/0`.
#[derive(Debug)]
pub struct FirmwareUpdate {
    inst: FwInstance,
    handler: Box<dyn UpdateHandler>,
}

const FW_RESOURCES: &[u16] = &[
    FW_PACKAGE,
    FW_PACKAGE_URI,
    FW_UPDATE,
    FW_STATE,
    FW_RESULT,
    FW_PKG_NAME,
    FW_PKG_VERSION,
    FW_PROTOCOL_SUPPORT,
    FW_DELIVERY_METHOD,
];

impl FirmwareUpdate {
    /// Creates the object, restoring persisted state from `store`.
    pub fn new(
        sink: Box<dyn PackageSink>,
        store: Box<dyn StateStore>,
        handler: Box<dyn UpdateHandler>,
    ) -> FirmwareUpdate {
        FirmwareUpdate {
            inst: FwInstance::open(OID_FIRMWARE_UPDATE, 0, MAGIC_FW, sink, store),
            handler,
        }
    }

    /// The state machine.
    pub fn instance(&self) -> &FwInstance {
        &self.inst
    }

    /// Current state.
    pub fn state(&self) -> FwState {
        self.inst.state()
    }

    /// Current result.
    pub fn result(&self) -> FwResult {
        self.inst.result()
    }

    fn check_iid(iid: u16) -> Result<(), ResponseError> {
        if iid == 0 {
            Ok(())
        } else {
            Err(ResponseError::NotFound)
        }
    }
}

impl UpdateObject for FirmwareUpdate {
    fn oid(&self) -> u16 {
        OID_FIRMWARE_UPDATE
    }

    fn instances(&self) -> Vec<u16> {
        vec![0]
    }

    fn resources(&self, _iid: u16) -> Vec<u16> {
        FW_RESOURCES.to_vec()
    }

    fn kind(&self, rid: u16) -> Result<ValueKind, ResponseError> {
        match rid {
            FW_PACKAGE => Ok(ValueKind::Opaque),
            FW_PACKAGE_URI => Ok(ValueKind::String),
            x if FW_RESOURCES.contains(&x) => Err(ResponseError::MethodNotAllowed),
            _ => Err(ResponseError::NotFound),
        }
    }

    fn is_executable(&self, rid: u16) -> bool {
        rid == FW_UPDATE
    }

    fn package_rid(&self) -> u16 {
        FW_PACKAGE
    }

    fn read(&self, iid: u16, rid: u16) -> Result<ResourceValue, ResponseError> {
        Self::check_iid(iid)?;
        self.inst.read(rid)
    }

    fn write(
        &mut self,
        _now: Instant,
        iid: u16,
        rid: u16,
        value: &Value,
    ) -> Result<(), ResponseError> {
        Self::check_iid(iid)?;
        match (rid, value) {
            (FW_PACKAGE_URI, Value::String(uri)) => self.inst.write_uri(uri),
            (FW_PACKAGE, Value::Opaque(bytes)) => self.inst.write_package(0, bytes, true),
            (FW_PACKAGE_URI, _) | (FW_PACKAGE, _) => Err(ResponseError::BadRequest),
            _ => self.kind(rid).map(|_| ()),
        }
    }

    fn write_package(
        &mut self,
        _now: Instant,
        iid: u16,
        offset: usize,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), ResponseError> {
        Self::check_iid(iid)?;
        self.inst.write_package(offset, chunk, last)
    }

    fn execute(
        &mut self,
        now: Instant,
        iid: u16,
        rid: u16,
        _args: &[u8],
    ) -> Result<(), ResponseError> {
        Self::check_iid(iid)?;
        if rid != FW_UPDATE {
            return Err(if FW_RESOURCES.contains(&rid) {
                ResponseError::MethodNotAllowed
            } else {
                ResponseError::NotFound
            });
        }
        let outcome = self.inst.upgrade(now, self.handler.as_mut())?;
        self.inst.apply_upgrade(now, outcome);
        Ok(())
    }

    fn download_event(
        &mut self,
        _now: Instant,
        iid: u16,
        session: DownloadSession,
        event: DownloadEvent,
    ) {
        if iid == 0 {
            self.inst.download_event(session, event);
        }
    }

    fn suspend_download(&mut self, iid: u16) -> bool {
        iid == 0 && self.inst.suspend_download()
    }

    fn resume_download(&mut self, iid: u16) -> bool {
        iid == 0 && self.inst.resume_download()
    }

    fn download_offset(&self, iid: u16) -> Option<u64> {
        if iid == 0 {
            Some(self.inst.offset())
        } else {
            None
        }
    }

    fn update_deadline(&self, iid: u16) -> Option<Instant> {
        if iid == 0 {
            self.inst.deadline()
        } else {
            None
        }
    }

    fn relocate_package(&mut self, iid: u16, path: &std::path::Path) -> bool {
        iid == 0 && self.inst.relocate_package(path)
    }

    fn enter_offline(&mut self) {
        self.inst.enter_offline();
    }

    fn exit_offline(&mut self) {
        self.inst.exit_offline();
    }

    fn on_registered(&mut self, now: Instant) {
        self.inst.on_registered(now);
    }

    fn reset(&mut self, _now: Instant) {
        self.inst.reset_package(FwResult::Initial);
    }

    fn poll_action(&mut self) -> Option<UpdateAction> {
        self.inst.poll_action()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.inst.poll_timeout()
    }

    fn handle_timeout(&mut self, now: Instant) {
        self.inst.handle_timeout(now);
    }
}

#[cfg(test)]
mod tests {
    use super::super::package::build_v1;
    use super::super::persist::MemoryStore;
    use super::super::sink::MemorySink;
    use super::*;
    use std::time::Duration;

    const PAYLOAD: &[u8] = b"#!/bin/sh\necho updated\n";

    struct Rig {
        sink: MemorySink,
        store: MemoryStore,
    }

    impl Rig {
        fn new() -> Rig {
            Rig {
                sink: MemorySink::new(),
                store: MemoryStore::new(),
            }
        }

        fn object(&self) -> FirmwareUpdate {
            FirmwareUpdate::new(
                Box::new(self.sink.clone()),
                Box::new(self.store.clone()),
                Box::new(PackageInstaller::new()),
            )
        }
    }

    fn drain(fw: &mut FirmwareUpdate) -> Vec<UpdateAction> {
        std::iter::from_fn(|| fw.poll_action()).collect()
    }

    fn start_session(actions: &[UpdateAction]) -> (DownloadSession, u64) {
        actions
            .iter()
            .find_map(|a| match a {
                UpdateAction::StartDownload {
                    session, offset, ..
                } => Some((*session, *offset)),
                _ => None,
            })
            .expect("no download started")
    }

    fn int(fw: &FirmwareUpdate, rid: u16) -> i64 {
        match fw.read(0, rid).unwrap() {
            ResourceValue::Single(Value::Integer(x)) => x,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn pull_update_and_restart() {
        let rig = Rig::new();
        let now = Instant::now();
        let mut fw = rig.object();
        let uri = Value::from("http://127.0.0.1:8000/firmware");
        fw.write(now, 0, FW_PACKAGE_URI, &uri).unwrap();
        assert_eq!(FwState::Downloading, fw.state());
        let (session, offset) = start_session(&drain(&mut fw));
        assert_eq!(0, offset);

        let pkg = build_v1(&MAGIC_FW, ForcedError::None, PAYLOAD);
        fw.download_event(now, 0, session, DownloadEvent::Data(pkg[..10].to_vec()));
        fw.download_event(now, 0, session, DownloadEvent::Data(pkg[10..].to_vec()));
        fw.download_event(now, 0, session, DownloadEvent::Finished);
        assert_eq!(FwState::Downloaded, fw.state());
        assert_eq!(FwResult::Initial, fw.result());

        fw.execute(now, 0, FW_UPDATE, b"").unwrap();
        assert_eq!(FwState::Updating, fw.state());
        assert!(drain(&mut fw).contains(&UpdateAction::Restart));

        let mut rebooted = rig.object();
        assert_eq!(FwState::Idle, rebooted.state());
        assert_eq!(FwResult::Success, rebooted.result());
        assert_eq!(1, int(&rebooted, FW_RESULT));
        assert!(drain(&mut rebooted).contains(&UpdateAction::Report(Lwm2mPath::instance(5, 0))));
    }

    #[test]
    fn record_with_unknown_trailing_fields_loads() {
        let store = MemoryStore::new();
        let open = |store: &MemoryStore| {
            FwInstance::open(
                OID_ADVANCED_FIRMWARE_UPDATE,
                1,
                MAGIC_FW,
                Box::new(MemorySink::new()),
                Box::new(store.clone()),
            )
        };
        let mut inst = open(&store);
        inst.set_max_defer_period(90);
        inst.set_conflicting(vec![0, 300]);

        let mut record = store.load().unwrap().unwrap();
        record.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut newer = store.clone();
        newer.store(&record).unwrap();

        let restored = open(&store);
        assert_eq!(FwState::Idle, restored.state());
        assert_eq!(90, restored.max_defer_period());
        assert_eq!(&[0, 300], restored.conflicting());
    }

    #[test]
    fn download_failure_results() {
        let now = Instant::now();
        let mut fw = Rig::new().object();
        fw.write(now, 0, FW_PACKAGE_URI, &Value::from("http://invalidfirmware.exe"))
            .unwrap();
        let (session, _) = start_session(&drain(&mut fw));
        fw.download_event(
            now,
            0,
            session,
            DownloadEvent::Failed(DownloadFailure::from(Error::HostNotFound)),
        );
        assert_eq!(FwState::Idle, fw.state());
        assert_eq!(7, int(&fw, FW_RESULT));
        assert!(drain(&mut fw)
            .contains(&UpdateAction::Changed(Lwm2mPath::resource(5, 0, FW_RESULT))));

        fw.write(now, 0, FW_PACKAGE_URI, &Value::from("gopher://example.com/fw"))
            .unwrap();
        assert_eq!(FwState::Idle, fw.state());
        assert_eq!(FwResult::UnsupportedProtocol, fw.result());
    }

    #[test]
    fn state_guards() {
        let now = Instant::now();
        let mut fw = Rig::new().object();
        assert_eq!(
            Err(ResponseError::MethodNotAllowed),
            fw.execute(now, 0, FW_UPDATE, b"")
        );

        fw.write(now, 0, FW_PACKAGE_URI, &Value::from("coap://127.0.0.1/fw"))
            .unwrap();
        assert_eq!(
            Err(ResponseError::BadRequest),
            fw.write(now, 0, FW_PACKAGE_URI, &Value::from("coap://127.0.0.1/other"))
        );
        assert_eq!(
            Err(ResponseError::BadRequest),
            fw.write_package(now, 0, 0, b"data", true)
        );

        // Writing a single zero byte cancels.
        fw.write_package(now, 0, 0, &[0], true).unwrap();
        assert_eq!(FwState::Idle, fw.state());
        assert_eq!(FwResult::Initial, fw.result());
        assert!(drain(&mut fw).iter().any(|a| matches!(a, UpdateAction::CancelDownload { .. })));
    }

    #[test]
    fn push_and_integrity() {
        let now = Instant::now();
        let mut fw = Rig::new().object();
        let mut pkg = build_v1(&MAGIC_FW, ForcedError::None, PAYLOAD);
        let last = pkg.len() - 1;
        pkg[last] ^= 0xFF;

        fw.write_package(now, 0, 0, &pkg[..16], false).unwrap();
        assert_eq!(FwState::Downloading, fw.state());
        fw.write_package(now, 0, 16, &pkg[16..], true).unwrap();
        assert_eq!(FwState::Idle, fw.state());
        assert_eq!(FwResult::IntegrityFailure, fw.result());

        let other = build_v1(b"ANJAY_SW", ForcedError::None, PAYLOAD);
        fw.write_package(now, 0, 0, &other, true).unwrap();
        assert_eq!(FwResult::UnsupportedPackageType, fw.result());
    }

    #[test]
    fn delayed_success_waits_for_registration() {
        let rig = Rig::new();
        let now = Instant::now();
        let mut fw = rig.object();
        let pkg = build_v1(&MAGIC_FW, ForcedError::DelayedSuccess, PAYLOAD);
        fw.write_package(now, 0, 0, &pkg, true).unwrap();
        fw.execute(now, 0, FW_UPDATE, b"").unwrap();
        assert!(drain(&mut fw).contains(&UpdateAction::Restart));

        let mut rebooted = rig.object();
        assert_eq!(FwState::Updating, rebooted.state());
        rebooted.handle_timeout(now + Duration::from_secs(10));
        assert_eq!(FwState::Updating, rebooted.state());

        rebooted.on_registered(now);
        assert_eq!(Some(now + SCHEDULER_TICK), rebooted.poll_timeout());
        rebooted.handle_timeout(now);
        assert_eq!(FwState::Updating, rebooted.state());
        rebooted.handle_timeout(now + SCHEDULER_TICK);
        assert_eq!(FwState::Idle, rebooted.state());
        assert_eq!(FwResult::Success, rebooted.result());
    }

    #[test]
    fn in_place_and_deferred_outcomes() {
        let now = Instant::now();
        let mut fw = Rig::new().object();

        let pkg = build_v1(&MAGIC_FW, ForcedError::SetFailureInPerformUpgrade, PAYLOAD);
        fw.write_package(now, 0, 0, &pkg, true).unwrap();
        fw.execute(now, 0, FW_UPDATE, b"").unwrap();
        assert_eq!(FwState::Idle, fw.state());
        assert_eq!(FwResult::Failed, fw.result());

        let pkg = build_v1(&MAGIC_FW, ForcedError::Defer, PAYLOAD);
        fw.write_package(now, 0, 0, &pkg, true).unwrap();
        fw.execute(now, 0, FW_UPDATE, b"").unwrap();
        assert_eq!(FwState::Downloaded, fw.state());
        assert_eq!(FwResult::Deferred, fw.result());

        let pkg = build_v1(&MAGIC_FW, ForcedError::DoNothing, PAYLOAD);
        fw.write_package(now, 0, 0, &[0], true).unwrap();
        fw.write_package(now, 0, 0, &pkg, true).unwrap();
        fw.execute(now, 0, FW_UPDATE, b"").unwrap();
        assert_eq!(FwState::Updating, fw.state());
        assert_eq!(
            Err(ResponseError::MethodNotAllowed),
            fw.write(now, 0, FW_PACKAGE_URI, &Value::from(""))
        );
    }

    #[test]
    fn resume_after_restart() {
        let rig = Rig::new();
        let now = Instant::now();
        let mut fw = rig.object();
        fw.write(now, 0, FW_PACKAGE_URI, &Value::from("coap://127.0.0.1/fw"))
            .unwrap();
        let (session, _) = start_session(&drain(&mut fw));
        fw.download_event(now, 0, session, DownloadEvent::ETag(ETag::new(b"v1")));
        fw.download_event(now, 0, session, DownloadEvent::Data(vec![1; 64]));
        drop(fw);

        let mut fw = rig.object();
        assert_eq!(FwState::Downloading, fw.state());
        let actions = drain(&mut fw);
        match &actions[..] {
            [UpdateAction::StartDownload {
                offset, etag, uri, ..
            }] => {
                assert_eq!(64, *offset);
                assert_eq!(Some(ETag::new(b"v1")), *etag);
                assert_eq!("coap://127.0.0.1/fw", uri.as_str());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(Some(64), fw.download_offset(0));
    }

    #[test]
    fn stale_sessions_are_ignored() {
        let now = Instant::now();
        let mut fw = Rig::new().object();
        fw.write(now, 0, FW_PACKAGE_URI, &Value::from("coap://127.0.0.1/fw"))
            .unwrap();
        let (old, _) = start_session(&drain(&mut fw));
        assert!(fw.suspend_download(0));
        assert!(fw.resume_download(0));
        let (new, _) = start_session(&drain(&mut fw));
        assert_ne!(old, new);

        fw.download_event(now, 0, old, DownloadEvent::Data(vec![1; 8]));
        assert_eq!(Some(0), fw.download_offset(0));
        fw.download_event(now, 0, new, DownloadEvent::Data(vec![1; 8]));
        assert_eq!(Some(8), fw.download_offset(0));
    }
}
