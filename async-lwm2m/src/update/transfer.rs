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

use super::package::{peek_forced_error, ForcedError};
use super::sink::PackageSink;
use super::*;

/// URI schemes a pull download may use.
pub const SUPPORTED_SCHEMES: &[&str] = &[
    URI_SCHEME_COAP,
    URI_SCHEME_COAPS,
    URI_SCHEME_COAP_TCP,
    URI_SCHEME_COAPS_TCP,
    URI_SCHEME_HTTP,
    URI_SCHEME_HTTPS,
];

/// Instances of the protocol support resource: CoAP, CoAPS, HTTP, HTTPS,
/// then CoAP over TCP and over TLS.
pub const PROTOCOL_SUPPORT: &[(u16, i64)] = &[(0, 0), (1, 1), (2, 2), (3, 3), (4, 4), (5, 5)];

/// Checks a package URI before a download starts.
pub fn check_package_uri(uri: &str) -> Result<(), DownloadFailure> {
    let parsed = url::Url::parse(uri).map_err(|_| DownloadFailure::InvalidUri)?;
    if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(DownloadFailure::UnsupportedProtocol);
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(DownloadFailure::InvalidUri),
    }
}

/// How the package being transferred arrives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing in flight.
    None,
    /// Downloaded by the client from a URI.
    Pull,
    /// Written by the server with BLOCK1.
    Push,
}

impl Delivery {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Delivery::None => 0,
            Delivery::Pull => 1,
            Delivery::Push => 2,
        }
    }

    pub(crate) fn from_u8(x: u8) -> Delivery {
        match x {
            1 => Delivery::Pull,
            2 => Delivery::Push,
            _ => Delivery::None,
        }
    }
}

/// Bookkeeping for one package transfer into a sink: where it comes from,
/// how far it got, and whether it is paused.
#[derive(Debug)]
pub struct Transfer {
    target: Lwm2mPath,
    sink: Box<dyn PackageSink>,
    delivery: Delivery,
    uri: Option<String>,
    etag: Option<ETag>,
    session: DownloadSession,
    running: bool,
    suspended: bool,
    offline: bool,
    forced_checked: bool,
}

impl Transfer {
    /// Creates an idle transfer into `sink` for the instance at `target`.
    pub fn new(target: Lwm2mPath, sink: Box<dyn PackageSink>) -> Transfer {
        Transfer {
            target,
            sink,
            delivery: Delivery::None,
            uri: None,
            etag: None,
            session: DownloadSession::default(),
            running: false,
            suspended: false,
            offline: false,
            forced_checked: false,
        }
    }

    /// How the package arrives.
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// The package URI of a pull download.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Version of the resource being pulled.
    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    /// Bytes stored so far.
    pub fn offset(&self) -> u64 {
        self.sink.len()
    }

    /// Stores later packages at `path`.
    pub fn relocate(&mut self, path: &std::path::Path) -> bool {
        self.sink.relocate(path)
    }

    /// True while paused by the control surface.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Current run of the pull download.
    pub fn session(&self) -> DownloadSession {
        self.session
    }

    /// Starts receiving a pushed package.
    pub fn begin_push(&mut self) -> Result<(), DownloadFailure> {
        self.stop();
        self.sink.open(0)?;
        self.delivery = Delivery::Push;
        self.uri = None;
        self.etag = None;
        self.forced_checked = false;
        Ok(())
    }

    /// Starts pulling `uri`.
    pub fn begin_pull(&mut self, uri: &str) -> Result<Option<UpdateAction>, DownloadFailure> {
        check_package_uri(uri)?;
        self.stop();
        self.sink.open(0)?;
        self.delivery = Delivery::Pull;
        self.uri = Some(uri.to_string());
        self.etag = None;
        self.forced_checked = false;
        Ok(self.start())
    }

    /// Picks up a pull download after a restart, keeping up to `offset`
    /// stored bytes.
    pub fn restore_pull(
        &mut self,
        uri: String,
        offset: u64,
        etag: Option<ETag>,
        suspended: bool,
    ) -> Result<Option<UpdateAction>, DownloadFailure> {
        let kept = self.sink.open(offset)?;
        if kept < offset {
            warn!(
                "{}: stored package shorter than recorded ({} < {}), resuming from {}",
                self.target, kept, offset, kept
            );
        }
        self.delivery = Delivery::Pull;
        self.uri = Some(uri);
        self.etag = if kept == 0 { None } else { etag };
        self.suspended = suspended;
        self.forced_checked = false;
        Ok(self.start())
    }

    /// Marks a stored package as already transferred, as after a restart in
    /// a state past downloading.
    pub fn restore_complete(&mut self, delivery: Delivery, uri: Option<String>) {
        self.delivery = delivery;
        self.uri = uri;
    }

    fn should_run(&self) -> bool {
        self.delivery == Delivery::Pull && !self.suspended && !self.offline
    }

    fn start(&mut self) -> Option<UpdateAction> {
        if self.running || !self.should_run() {
            return None;
        }
        let uri = self.uri.clone()?;
        self.running = true;
        self.session = DownloadSession(self.session.0.wrapping_add(1));
        Some(UpdateAction::StartDownload {
            target: self.target,
            session: self.session,
            uri,
            offset: self.sink.len(),
            etag: self.etag.clone(),
        })
    }

    fn stop(&mut self) -> Option<UpdateAction> {
        if !self.running {
            return None;
        }
        self.running = false;
        self.session = DownloadSession(self.session.0.wrapping_add(1));
        Some(UpdateAction::CancelDownload {
            target: self.target,
        })
    }

    /// True when `session` is the running download.
    pub fn is_current(&self, session: DownloadSession) -> bool {
        self.running && self.session == session
    }

    /// Pauses the pull download.
    pub fn suspend(&mut self) -> (bool, Option<UpdateAction>) {
        if self.delivery != Delivery::Pull || self.suspended {
            return (false, None);
        }
        self.suspended = true;
        (true, self.stop())
    }

    /// Resumes the pull download.
    pub fn resume(&mut self) -> (bool, Option<UpdateAction>) {
        if self.delivery != Delivery::Pull || !self.suspended {
            return (false, None);
        }
        self.suspended = false;
        (true, self.start())
    }

    /// Pauses while offline.
    pub fn enter_offline(&mut self) -> Option<UpdateAction> {
        self.offline = true;
        self.stop()
    }

    /// Resumes after going online, unless suspended meanwhile.
    pub fn exit_offline(&mut self) -> Option<UpdateAction> {
        self.offline = false;
        self.start()
    }

    /// Records the resource version announced by the origin.
    pub fn set_etag(&mut self, etag: ETag) {
        self.etag = Some(etag);
    }

    /// Stores the next chunk. Test packages may ask for a storage failure
    /// through their forced-error field, which is honored as soon as the
    /// header has arrived.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), DownloadFailure> {
        if !self.forced_checked && self.sink.len() + chunk.len() as u64 >= 12 {
            self.forced_checked = true;
            let mut prefix = self.sink.read_all()?;
            prefix.extend_from_slice(chunk);
            match peek_forced_error(&prefix) {
                Some(ForcedError::OutOfMemory) => return Err(DownloadFailure::OutOfMemory),
                Some(ForcedError::NoSpace) => return Err(DownloadFailure::NotEnoughSpace),
                _ => (),
            }
        }
        self.sink.write(chunk)?;
        Ok(())
    }

    /// Drops stored bytes so the download starts over.
    pub fn restart(&mut self) -> Result<(), DownloadFailure> {
        self.sink.open(0)?;
        self.etag = None;
        self.forced_checked = false;
        Ok(())
    }

    /// The download ended; returns the stored package.
    pub fn finish(&mut self) -> Result<Vec<u8>, DownloadFailure> {
        self.running = false;
        self.suspended = false;
        Ok(self.sink.read_all()?)
    }

    /// The stored package.
    pub fn package(&mut self) -> Result<Vec<u8>, DownloadFailure> {
        Ok(self.sink.read_all()?)
    }

    /// Replaces the stored package, as when a multi-package is split.
    pub fn store_package(&mut self, bytes: &[u8]) -> Result<(), DownloadFailure> {
        self.stop();
        self.sink.open(0)?;
        self.sink.write(bytes)?;
        self.delivery = Delivery::Push;
        self.uri = None;
        self.etag = None;
        Ok(())
    }

    /// Abandons the transfer and drops stored bytes.
    pub fn abort(&mut self) -> Option<UpdateAction> {
        let action = self.stop();
        if let Err(e) = self.sink.discard() {
            warn!("{}: unable to discard package: {}", self.target, e);
        }
        self.delivery = Delivery::None;
        self.uri = None;
        self.etag = None;
        self.suspended = false;
        self.forced_checked = false;
        action
    }

    /// Ends the transfer keeping the stored bytes.
    pub fn settle(&mut self) -> Option<UpdateAction> {
        let action = self.stop();
        self.suspended = false;
        action
    }
}
