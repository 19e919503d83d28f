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

//! Firmware Update, Advanced Firmware Update and Software Management state
//! machines.
//!
//! Each object is a sans-IO state machine implementing [`UpdateObject`].
//! Resource operations come in from the client dispatcher, download progress
//! comes in as [`DownloadEvent`]s, and work the machine needs done outside
//! itself comes out of [`UpdateObject::poll_action`].

use super::*;
use std::time::Instant;

pub mod package;
pub mod persist;
pub mod sink;

mod installer;
pub use installer::*;

mod transfer;
pub use transfer::*;

mod pull;
pub use pull::BlockPull;

mod fw;
pub use fw::*;

mod afu;
pub use afu::*;

mod sw;
pub use sw::*;

use crate::lwm2m::{Value, ValueKind};

/// Why a download stopped short.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum DownloadFailure {
    /// The origin could not be reached or the transfer broke off.
    #[error("connection lost")]
    ConnectionLost,
    /// The URI is malformed or its host does not resolve.
    #[error("invalid URI")]
    InvalidUri,
    /// The URI scheme is not supported.
    #[error("unsupported protocol")]
    UnsupportedProtocol,
    /// The package does not fit.
    #[error("not enough space")]
    NotEnoughSpace,
    /// A buffer for the package could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
}

impl From<Error> for DownloadFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::HostNotFound | Error::InvalidArgument => DownloadFailure::InvalidUri,
            Error::UnsupportedUriScheme => DownloadFailure::UnsupportedProtocol,
            Error::OutOfSpace => DownloadFailure::NotEnoughSpace,
            _ => DownloadFailure::ConnectionLost,
        }
    }
}

impl From<sink::SinkError> for DownloadFailure {
    fn from(err: sink::SinkError) -> Self {
        match err {
            sink::SinkError::OutOfMemory => DownloadFailure::OutOfMemory,
            _ => DownloadFailure::NotEnoughSpace,
        }
    }
}

/// Identifies one run of a download, so events from a cancelled run are
/// ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DownloadSession(pub u32);

/// Progress of a pull download, reported by whoever runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// The origin announced the resource version.
    ETag(ETag),
    /// The next bytes of the package.
    Data(Vec<u8>),
    /// The origin changed the resource; bytes received so far are void and
    /// the download starts over.
    Restarted,
    /// The whole package has been delivered.
    Finished,
    /// The download failed.
    Failed(DownloadFailure),
}

impl DownloadEvent {
    /// True for the last event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadEvent::Finished | DownloadEvent::Failed(_))
    }
}

/// Work requested by an update state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction {
    /// Start or resume pulling `uri` into the instance at `target`.
    StartDownload {
        /// Object instance the package is for.
        target: Lwm2mPath,
        /// Run identifier to report events with.
        session: DownloadSession,
        /// Package origin.
        uri: String,
        /// Bytes already stored.
        offset: u64,
        /// Version of the partially stored resource.
        etag: Option<ETag>,
    },

    /// Stop the download for `target`, keeping what was stored.
    CancelDownload {
        /// Object instance the package was for.
        target: Lwm2mPath,
    },

    /// A readable resource changed value.
    Changed(Lwm2mPath),

    /// The state or result of the instance at the given path settled on a
    /// value worth reporting with a LwM2M Send.
    Report(Lwm2mPath),

    /// The device must restart into the new image.
    Restart,
}

/// Value of a single or multiple-instance resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    /// A single-instance resource.
    Single(Value),
    /// A multiple-instance resource, by resource instance id.
    Multiple(Vec<(u16, Value)>),
}

impl From<Value> for ResourceValue {
    fn from(value: Value) -> Self {
        ResourceValue::Single(value)
    }
}

/// An LwM2M object implemented as an update state machine.
pub trait UpdateObject: std::fmt::Debug + Send {
    /// Object id.
    fn oid(&self) -> u16;

    /// Existing instance ids, ascending.
    fn instances(&self) -> Vec<u16>;

    /// Resource ids present in an instance, ascending.
    fn resources(&self, iid: u16) -> Vec<u16>;

    /// Kind of a writable resource's value. Executable and read-only
    /// resources yield [`ResponseError::MethodNotAllowed`].
    fn kind(&self, rid: u16) -> Result<ValueKind, ResponseError>;

    /// True for executable resources.
    fn is_executable(&self, rid: u16) -> bool;

    /// Resource id of the package, written through
    /// [`write_package`](UpdateObject::write_package).
    fn package_rid(&self) -> u16;

    /// Reads a resource.
    fn read(&self, iid: u16, rid: u16) -> Result<ResourceValue, ResponseError>;

    /// Writes a resource other than the package.
    fn write(&mut self, now: Instant, iid: u16, rid: u16, value: &Value)
        -> Result<(), ResponseError>;

    /// Writes the next chunk of a pushed package, starting at `offset`.
    fn write_package(
        &mut self,
        now: Instant,
        iid: u16,
        offset: usize,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), ResponseError>;

    /// Executes a resource with the raw argument payload.
    fn execute(&mut self, now: Instant, iid: u16, rid: u16, args: &[u8])
        -> Result<(), ResponseError>;

    /// Delivers download progress for an instance.
    fn download_event(
        &mut self,
        now: Instant,
        iid: u16,
        session: DownloadSession,
        event: DownloadEvent,
    );

    /// Pauses a pull download. Returns false when none is running.
    fn suspend_download(&mut self, iid: u16) -> bool;

    /// Resumes a paused pull download. Returns false when none is paused.
    fn resume_download(&mut self, iid: u16) -> bool;

    /// Bytes stored for the instance's package.
    fn download_offset(&self, iid: u16) -> Option<u64>;

    /// When the instance's delayed result is applied, or its update
    /// deferral runs out.
    fn update_deadline(&self, _iid: u16) -> Option<Instant> {
        None
    }

    /// Stores later packages of the instance at `path`. Returns false when
    /// the instance cannot move its storage now.
    fn relocate_package(&mut self, _iid: u16, _path: &std::path::Path) -> bool {
        false
    }

    /// The client went offline; downloads pause.
    fn enter_offline(&mut self);

    /// The client is back online and registered.
    fn exit_offline(&mut self);

    /// The client finished (re-)registering.
    fn on_registered(&mut self, now: Instant);

    /// Returns everything to the initial state, as after re-provisioning.
    fn reset(&mut self, now: Instant);

    /// Next requested action.
    fn poll_action(&mut self) -> Option<UpdateAction>;

    /// When [`handle_timeout`](UpdateObject::handle_timeout) should be
    /// called next.
    fn poll_timeout(&self) -> Option<Instant>;

    /// Runs jobs that are due.
    fn handle_timeout(&mut self, now: Instant);
}

/// Delay between a delayed result becoming due and it being applied.
pub const SCHEDULER_TICK: std::time::Duration = std::time::Duration::from_secs(1);

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_failures() {
        assert_eq!(
            DownloadFailure::InvalidUri,
            DownloadFailure::from(Error::HostNotFound)
        );
        assert_eq!(
            DownloadFailure::UnsupportedProtocol,
            DownloadFailure::from(Error::UnsupportedUriScheme)
        );
        assert_eq!(
            DownloadFailure::ConnectionLost,
            DownloadFailure::from(Error::ResponseTimeout)
        );
        assert_eq!(
            DownloadFailure::NotEnoughSpace,
            DownloadFailure::from(sink::SinkError::NotEnoughSpace)
        );
    }
}
