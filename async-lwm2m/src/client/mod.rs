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

//! The LwM2M client dispatcher.
//!
//! [`Lwm2mClient`] owns one [`ExchangeEngine`] and [`Registration`] per
//! server, the [`ObservationEngine`] and the [`Objects`] it serves. Like the
//! engines it is built from, it performs no I/O: the runtime feeds it
//! received messages, download progress and the time, and polls it for
//! messages to send, [`ClientEvent`]s and its next deadline.

use super::*;
use crate::config::ClientConfig;
use crate::control::TransportFamily;
use crate::exchange::{
    Admission, Block1Outcome, Block1Receiver, ExchangeEngine, ExchangeEvent, ExchangeId, Inbound,
    RequestOptions, Transmit,
};
use crate::lwm2m::link_format::{LinkWriter, LINK_ATTR_DIM, LINK_ATTR_PMAX, LINK_ATTR_PMIN};
use crate::lwm2m::{
    object_links, send_request, RegisterParams, Registration, RegistrationAction,
    RegistrationState, Value, ValueKind,
};
use crate::observe::{AttributeWrite, Attributes, ObservationEngine, ObservationId, ObserverId};
use crate::transport::CoapUri;
use crate::update::{
    unix_now, BlockPull, DownloadEvent, DownloadSession, ResourceValue, UpdateAction, UpdateObject,
    FW_PKG_VERSION, FW_RESULT, FW_STATE, SW_PKG_VERSION, SW_UPDATE_RESULT, SW_UPDATE_STATE,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

mod device;
pub use device::*;

mod model;
pub use model::Objects;

/// Non-confirmable notifications remembered for matching a Reset.
const RECENT_NOTIFICATIONS: usize = 16;

/// Something the runtime has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Registration with a server succeeded.
    Registered(ObserverId),

    /// Registration with a server failed; it is retried later.
    RegistrationFailed(ObserverId),

    /// A server was dropped after deregistering; its transport can close.
    ServerRemoved(ObserverId),

    /// Deregistration from every server finished.
    Deregistered,

    /// Start pulling a package. Packages served by a registered server at
    /// an address literal are pulled by the client itself, through that
    /// server's exchanges, and never show up here.
    StartDownload {
        /// Object instance the package is for.
        target: Lwm2mPath,
        /// Run identifier to report events with.
        session: DownloadSession,
        /// Package origin.
        uri: String,
        /// Bytes already stored, to resume from.
        offset: u64,
        /// Version of the partially stored resource.
        etag: Option<ETag>,
    },

    /// Stop pulling the package for `target`.
    CancelDownload {
        /// Object instance the package was for.
        target: Lwm2mPath,
    },

    /// The device must restart, into a new image or on request.
    Restart,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Pending {
    Register,
    Update,
    Deregister,
    Notification(ObservationId),
    Send,
    Block(Lwm2mPath),
}

/// A package pulled from one of the servers through its exchange engine.
#[derive(Debug)]
struct Pull {
    ssid: ObserverId,
    session: DownloadSession,
    pull: BlockPull,
    exchange: Option<ExchangeId>,
}

#[derive(Debug)]
struct Server {
    ssid: ObserverId,
    remote: SocketAddr,
    kind: TransportKind,
    engine: ExchangeEngine,
    registration: Registration,
    block1: Block1Receiver,
    pending: HashMap<ExchangeId, Pending>,
    recent_non: VecDeque<(ExchangeId, ObservationId)>,
    offline: bool,
    retry_at: Option<Instant>,
    removing: bool,
}

/// Summary of one server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Short server id.
    pub ssid: ObserverId,
    /// Address of the server.
    pub remote: SocketAddr,
    /// Transport in use.
    pub kind: TransportKind,
    /// Registration state.
    pub state: RegistrationState,
    /// True while offline.
    pub offline: bool,
}

/// A LwM2M client serving [`Objects`] to any number of servers.
#[derive(Debug)]
pub struct Lwm2mClient {
    config: ClientConfig,
    objects: Objects,
    servers: Vec<Server>,
    observations: ObservationEngine,
    events: VecDeque<ClientEvent>,
    pulls: HashMap<Lwm2mPath, Pull>,
    next_ssid: u16,
    deregistering: bool,
    objects_offline: bool,
}

fn binding_for(kind: TransportKind) -> &'static str {
    if kind.is_stream() {
        "T"
    } else {
        "U"
    }
}

fn write_link(write: &mut LinkWriter, target: &Lwm2mPath, attrs: &Attributes, dim: Option<usize>) {
    write
        .link(target)
        .value_opt(LINK_ATTR_DIM, dim)
        .value_opt(LINK_ATTR_PMIN, attrs.pmin)
        .value_opt(LINK_ATTR_PMAX, attrs.pmax)
        .value_opt("epmin", attrs.epmin)
        .value_opt("epmax", attrs.epmax)
        .value_opt("gt", attrs.gt)
        .value_opt("lt", attrs.lt)
        .value_opt("st", attrs.st);
}

impl Lwm2mClient {
    /// Creates a client with no servers.
    pub fn new(config: ClientConfig, objects: Objects) -> Lwm2mClient {
        let observations = ObservationEngine::new(config.stored_notification_limit);
        Lwm2mClient {
            config,
            objects,
            servers: Vec::new(),
            observations,
            events: VecDeque::new(),
            pulls: HashMap::new(),
            next_ssid: 1,
            deregistering: false,
            objects_offline: false,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The served objects.
    pub fn objects(&self) -> &Objects {
        &self.objects
    }

    /// The observation engine.
    pub fn observations(&self) -> &ObservationEngine {
        &self.observations
    }

    /// Every server, in the order they were added.
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.servers
            .iter()
            .map(|s| ServerInfo {
                ssid: s.ssid,
                remote: s.remote,
                kind: s.kind,
                state: s.registration.state().clone(),
                offline: s.offline,
            })
            .collect()
    }

    fn index(&self, ssid: ObserverId) -> Option<usize> {
        self.servers.iter().position(|s| s.ssid == ssid)
    }

    /// Adds a server reached at `remote` over `kind` and registers with it.
    pub fn add_server(&mut self, now: Instant, remote: SocketAddr, kind: TransportKind) -> ObserverId {
        let ssid = ObserverId(self.next_ssid);
        self.next_ssid = self.next_ssid.wrapping_add(1).max(1);

        let params = RegisterParams {
            endpoint: self.config.endpoint_name.clone(),
            lifetime: self.config.lifetime,
            binding: Some(
                self.config
                    .binding
                    .clone()
                    .unwrap_or_else(|| binding_for(kind).to_string()),
            ),
            queue_mode: self.config.queue_mode,
            version: self.config.version,
        };

        self.observations
            .set_defaults(ssid, self.config.notification_defaults());
        self.servers.push(Server {
            ssid,
            remote,
            kind,
            engine: ExchangeEngine::new(kind.framing(), self.config.trans_params()),
            registration: Registration::new(params),
            block1: Block1Receiver::new(self.config.block1_cache_budget),
            pending: HashMap::new(),
            recent_non: VecDeque::new(),
            offline: false,
            retry_at: None,
            removing: false,
        });
        info!("{} added at {} over {:?}", ssid, remote, kind);

        let idx = self.servers.len() - 1;
        self.register(now, idx);
        ssid
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions {
            block1_szx: self.config.block_szx(),
            ..RequestOptions::default()
        }
    }

    fn start(&mut self, now: Instant, idx: usize, msg: CoapMessage, kind: Pending) {
        let opts = self.request_options();
        let server = &mut self.servers[idx];
        let id = server.engine.start(now, server.remote, msg, opts);
        server.pending.insert(id, kind);
    }

    fn register(&mut self, now: Instant, idx: usize) {
        let links = object_links(self.config.version, &self.objects.entries());
        let server = &mut self.servers[idx];
        server.retry_at = None;
        self.observations.remove_observer(server.ssid);
        let msg = server.registration.register(&links);
        self.start(now, idx, msg, Pending::Register);
    }

    fn update(&mut self, now: Instant, idx: usize) {
        let server = &mut self.servers[idx];
        match server.registration.state().clone() {
            RegistrationState::Registered => {
                if let Some(msg) = server.registration.update(None) {
                    self.start(now, idx, msg, Pending::Update);
                }
            }
            RegistrationState::Updating => server.registration.force_update(),
            RegistrationState::Unregistered if server.retry_at.is_none() => {
                self.register(now, idx)
            }
            _ => (),
        }
    }

    /// Sends a Registration Update to every online server now.
    pub fn send_update(&mut self, now: Instant) {
        for idx in 0..self.servers.len() {
            if !self.servers[idx].offline {
                self.update(now, idx);
            }
        }
        self.process(now);
    }

    fn remove_server(&mut self, now: Instant, idx: usize) {
        let server = self.servers.remove(idx);
        self.observations.remove_observer(server.ssid);
        let orphaned: Vec<Lwm2mPath> = self
            .pulls
            .iter()
            .filter(|(_, pull)| pull.ssid == server.ssid)
            .map(|(target, _)| *target)
            .collect();
        for target in orphaned {
            self.fail_pull(now, target, Error::ConnectionLost);
        }
        info!("{} removed", server.ssid);
        self.events.push_back(ClientEvent::ServerRemoved(server.ssid));
        if self.servers.is_empty() && self.deregistering {
            self.events.push_back(ClientEvent::Deregistered);
        }
    }

    fn deregister_at(&mut self, now: Instant, idx: usize) {
        self.servers[idx].removing = true;
        match self.servers[idx].registration.deregister() {
            Some(msg) => self.start(now, idx, msg, Pending::Deregister),
            None => self.remove_server(now, idx),
        }
    }

    /// Deregisters from every server. [`ClientEvent::Deregistered`] follows
    /// once all of them answered or timed out.
    pub fn deregister(&mut self, now: Instant) {
        self.deregistering = true;
        if self.servers.is_empty() {
            self.events.push_back(ClientEvent::Deregistered);
            return;
        }
        for idx in (0..self.servers.len()).rev() {
            if !self.servers[idx].removing {
                self.deregister_at(now, idx);
            }
        }
        self.process(now);
    }

    /// Deregisters from every server beyond the first `keep`.
    pub fn trim_servers(&mut self, now: Instant, keep: usize) {
        for idx in (keep..self.servers.len()).rev() {
            if !self.servers[idx].removing {
                self.deregister_at(now, idx);
            }
        }
        self.process(now);
    }

    /// Abandons every exchange and refreshes each registration, after the
    /// runtime reset the transports.
    pub fn reconnect(&mut self, now: Instant) {
        for idx in 0..self.servers.len() {
            let server = &mut self.servers[idx];
            server.pending.clear();
            server.recent_non.clear();
            server.block1.abort();
            server.engine.fail_all(now, Error::ConnectionLost);
            while server.engine.poll_event().is_some() {}

            if server.removing || server.offline {
                continue;
            }
            if *server.registration.state() == RegistrationState::Registered {
                server.registration.force_update();
                self.update(now, idx);
            } else {
                self.register(now, idx);
            }
        }
        for idx in (0..self.servers.len()).rev() {
            if self.servers[idx].removing {
                self.remove_server(now, idx);
            }
        }

        let targets: Vec<Lwm2mPath> = self.pulls.keys().copied().collect();
        for target in targets {
            if let Some(pull) = self.pulls.get_mut(&target) {
                pull.exchange = None;
            }
            self.request_block(now, target);
        }
        self.process(now);
    }

    /// Stops network use on servers of `family`. Their notifications are
    /// stored until they come back; once no server is online, downloads
    /// pause.
    pub fn enter_offline(&mut self, now: Instant, family: TransportFamily) {
        for server in self.servers.iter_mut() {
            if family.matches(server.kind) && !server.offline {
                info!("{} going offline", server.ssid);
                server.offline = true;
                server.engine.set_offline(now, true);
                self.observations.enter_offline(server.ssid);
            }
        }

        if !self.servers.is_empty() && self.servers.iter().all(|s| s.offline) {
            if !self.objects_offline {
                self.objects_offline = true;
                for object in self.objects.updates_mut() {
                    object.enter_offline();
                }
            }
        }
        self.process(now);
    }

    /// Resumes network use on servers of `family`. Each refreshes its
    /// registration; stored notifications follow, and downloads resume once
    /// a registration succeeds.
    pub fn exit_offline(&mut self, now: Instant, family: TransportFamily) {
        let mut stored = Vec::new();
        for idx in 0..self.servers.len() {
            let server = &mut self.servers[idx];
            if !family.matches(server.kind) || !server.offline {
                continue;
            }
            info!("{} going online", server.ssid);
            server.offline = false;
            server.engine.set_offline(now, false);
            if server.registration.is_registered() {
                server.registration.force_update();
                self.update(now, idx);
            } else {
                self.register(now, idx);
            }
            let ssid = self.servers[idx].ssid;
            let queued = self.observations.exit_offline(ssid);
            info!("{} delivering {} stored notifications", ssid, queued.len());
            stored.extend(queued);
        }

        for notification in stored {
            self.route(now, notification);
        }
        self.process(now);
    }

    fn resume_objects(&mut self) {
        if self.objects_offline {
            self.objects_offline = false;
            for object in self.objects.updates_mut() {
                object.exit_offline();
            }
        }
    }

    /// Returns every object to its initial state and forgets every
    /// observation, as after re-provisioning.
    pub fn reprovision(&mut self, now: Instant) {
        for server in &self.servers {
            self.observations.remove_observer(server.ssid);
        }
        for object in self.objects.updates_mut() {
            object.reset(now);
        }
        self.process(now);
    }

    fn update_object(&mut self, target: &Lwm2mPath) -> Option<(&mut Box<dyn UpdateObject>, u16)> {
        let iid = target.iid()?;
        let object = self.objects.update_mut(target.oid()?)?;
        Some((object, iid))
    }

    /// Pauses the download into `target`.
    pub fn suspend_download(&mut self, now: Instant, target: &Lwm2mPath) -> bool {
        let done = match self.update_object(target) {
            Some((object, iid)) => object.suspend_download(iid),
            None => false,
        };
        self.process(now);
        done
    }

    /// Resumes the download into `target`.
    pub fn resume_download(&mut self, now: Instant, target: &Lwm2mPath) -> bool {
        let done = match self.update_object(target) {
            Some((object, iid)) => object.resume_download(iid),
            None => false,
        };
        self.process(now);
        done
    }

    /// Bytes stored for the package of `target`.
    pub fn download_offset(&self, target: &Lwm2mPath) -> Option<u64> {
        self.objects
            .update(target.oid()?)?
            .download_offset(target.iid()?)
    }

    /// When the delayed result or update deferral of `target` falls due.
    pub fn update_deadline(&self, target: &Lwm2mPath) -> Option<Instant> {
        self.objects
            .update(target.oid()?)?
            .update_deadline(target.iid()?)
    }

    /// Stores later packages of `target` at `path`.
    pub fn set_package_path(&mut self, target: &Lwm2mPath, path: &Path) -> bool {
        match self.update_object(target) {
            Some((object, iid)) => object.relocate_package(iid, path),
            None => false,
        }
    }

    /// Changes a power source voltage of the Device object.
    pub fn set_voltage(&mut self, now: Instant, riid: usize, millivolts: i64) {
        if let Some(path) = self.objects.device_mut().set_voltage(riid, millivolts) {
            self.observations.notify_changed(&path);
        }
        self.process(now);
    }

    /// Delivers progress of a download started by
    /// [`ClientEvent::StartDownload`].
    pub fn download_event(
        &mut self,
        now: Instant,
        target: &Lwm2mPath,
        session: DownloadSession,
        event: DownloadEvent,
    ) {
        self.deliver_download(now, target, session, event);
        self.process(now);
    }

    /// Sends the values under `paths` to every registered online server
    /// with a LwM2M Send. Fails if no server can take it.
    pub fn send(&mut self, now: Instant, paths: &[Lwm2mPath]) -> Result<(), ResponseError> {
        let mut entries = Vec::new();
        for path in paths {
            entries.extend(self.objects.read_values(path)?);
        }

        let targets: Vec<usize> = (0..self.servers.len())
            .filter(|idx| {
                let server = &self.servers[*idx];
                !server.offline && !server.removing && server.registration.is_registered()
            })
            .collect();
        if targets.is_empty() || self.config.version < crate::lwm2m::Lwm2mVersion::V1_1 {
            return Err(ResponseError::ServiceUnavailable);
        }

        let msg = send_request(&entries, Some(unix_now() as f64))?;
        for idx in targets {
            self.start(now, idx, msg.clone(), Pending::Send);
        }
        self.process(now);
        Ok(())
    }

    fn report(&mut self, now: Instant, instance: Lwm2mPath) {
        let (oid, iid) = match (instance.oid(), instance.iid()) {
            (Some(oid), Some(iid)) => (oid, iid),
            _ => return,
        };
        let rids = if oid == OID_SOFTWARE_MANAGEMENT {
            [SW_UPDATE_STATE, SW_UPDATE_RESULT, SW_PKG_VERSION]
        } else {
            [FW_STATE, FW_RESULT, FW_PKG_VERSION]
        };
        let mut paths: Vec<Lwm2mPath> = rids
            .iter()
            .map(|rid| Lwm2mPath::resource(oid, iid, *rid))
            .collect();
        paths.push(Lwm2mPath::resource(OID_DEVICE, 0, DEV_FIRMWARE_VERSION));

        if let Err(e) = self.send(now, &paths) {
            debug!("not reporting {}: {}", instance, e);
        }
    }

    /// Handles a message received from server `ssid`.
    pub fn handle_message(&mut self, now: Instant, ssid: ObserverId, msg: CoapMessage) {
        let idx = match self.index(ssid) {
            Some(idx) => idx,
            None => {
                warn!("message from unknown {}", ssid);
                return;
            }
        };
        let server = &mut self.servers[idx];
        match server.engine.handle_message(now, server.remote, msg) {
            Inbound::Handled => (),
            Inbound::Request(req) => self.handle_request(now, idx, req),
            Inbound::Unmatched(msg) => debug!("{} unmatched {}", ssid, MessageDisplay(&msg)),
        }
        self.process(now);
    }

    fn handle_request(&mut self, now: Instant, idx: usize, req: CoapMessage) {
        match self.servers[idx].block1.admits(&req) {
            Admission::Accept => (),
            Admission::Ignore => return,
            Admission::Busy => {
                let server = &mut self.servers[idx];
                let resp = req.response(MsgCode::SERVICE_UNAVAILABLE);
                server.engine.send_response(now, server.remote, &req, resp);
                return;
            }
        }

        let response = match self.dispatch(now, idx, &req) {
            Ok(resp) => resp,
            Err(e) => {
                warn!("{} request {} failed: {}", self.servers[idx].ssid, MessageDisplay(&req), e);
                req.response(e.msg_code())
            }
        };
        let server = &mut self.servers[idx];
        server.engine.send_response(now, server.remote, &req, response);
    }

    fn dispatch(&mut self, now: Instant, idx: usize, req: &CoapMessage) -> Result<CoapMessage, ResponseError> {
        let path = Lwm2mPath::from_segments(&req.uri_path())?;
        let ssid = self.servers[idx].ssid;

        match req.code {
            MsgCode::GET => self.get(now, ssid, req, path),
            MsgCode::PUT
                if req.payload.is_empty()
                    && req.content_format().is_none()
                    && !req.uri_queries().is_empty() =>
            {
                self.write_attributes(ssid, req, &path)
            }
            MsgCode::PUT | MsgCode::POST => self.write_or_execute(now, idx, req, path),
            _ => Err(ResponseError::MethodNotAllowed),
        }
    }

    fn get(
        &mut self,
        now: Instant,
        ssid: ObserverId,
        req: &CoapMessage,
        path: Lwm2mPath,
    ) -> Result<CoapMessage, ResponseError> {
        let accept = req.try_option(option::ACCEPT).map_err(|_| ResponseError::BadOption)?;
        if accept == Some(ContentFormat::APPLICATION_LINK_FORMAT) {
            let links = self.discover(ssid, &path)?;
            return Ok(req
                .response(MsgCode::CONTENT)
                .with_option(option::CONTENT_FORMAT, ContentFormat::APPLICATION_LINK_FORMAT)
                .with_payload(links.into_bytes()));
        }

        match req.observe() {
            Some(OBSERVE_REGISTER) => {
                let (_, resp) = self
                    .observations
                    .observe(now, ssid, req, path, &self.objects)?;
                return Ok(resp);
            }
            Some(OBSERVE_DEREGISTER) => {
                self.observations.cancel_by_path(ssid, &path);
            }
            _ => (),
        }

        let value = self.objects.read_encoded(&path, accept)?;
        Ok(req
            .response(MsgCode::CONTENT)
            .with_option(option::CONTENT_FORMAT, value.format)
            .with_payload(value.payload))
    }

    fn discover(&self, ssid: ObserverId, path: &Lwm2mPath) -> Result<String, ResponseError> {
        let oid = path.oid().ok_or(ResponseError::MethodNotAllowed)?;
        if path.riid().is_some() {
            return Err(ResponseError::MethodNotAllowed);
        }
        if !self.objects.exists(path) {
            return Err(ResponseError::NotFound);
        }

        let dim = |iid: u16, rid: u16| match self.objects.read_resource(oid, iid, rid) {
            Ok(ResourceValue::Multiple(values)) => Some(values.len()),
            _ => None,
        };

        let mut links: Vec<(Lwm2mPath, Option<usize>)> = vec![(*path, None)];
        match (path.iid(), path.rid()) {
            (None, _) => {
                for iid in self.objects.instances(oid).unwrap_or_default() {
                    links.push((Lwm2mPath::instance(oid, iid), None));
                    for rid in self.objects.resources(oid, iid)? {
                        links.push((Lwm2mPath::resource(oid, iid, rid), dim(iid, rid)));
                    }
                }
            }
            (Some(iid), None) => {
                for rid in self.objects.resources(oid, iid)? {
                    links.push((Lwm2mPath::resource(oid, iid, rid), dim(iid, rid)));
                }
            }
            (Some(iid), Some(rid)) => links[0].1 = dim(iid, rid),
        }

        let mut write = LinkWriter::new();
        for (target, dim) in links.iter() {
            let attrs = self.observations.attributes().get(ssid, target);
            write_link(&mut write, target, &attrs, *dim);
        }
        Ok(write.into_string())
    }

    fn write_attributes(
        &mut self,
        ssid: ObserverId,
        req: &CoapMessage,
        path: &Lwm2mPath,
    ) -> Result<CoapMessage, ResponseError> {
        let write = AttributeWrite::parse_query(&req.uri_queries())?;
        if path.is_root() || !self.objects.exists(path) {
            return Err(ResponseError::NotFound);
        }
        self.observations.write_attributes(ssid, path, &write)?;
        Ok(req.response(MsgCode::CHANGED))
    }

    fn write_or_execute(
        &mut self,
        now: Instant,
        idx: usize,
        req: &CoapMessage,
        path: Lwm2mPath,
    ) -> Result<CoapMessage, ResponseError> {
        let (oid, iid) = match (path.oid(), path.iid(), path.riid()) {
            (Some(oid), Some(iid), None) => (oid, iid),
            _ => return Err(ResponseError::MethodNotAllowed),
        };
        let format = req
            .try_option(option::CONTENT_FORMAT)
            .map_err(|_| ResponseError::BadOption)?;

        if let Some(rid) = path.rid() {
            if self.objects.is_executable(oid, rid) {
                if req.code != MsgCode::POST {
                    return Err(ResponseError::MethodNotAllowed);
                }
                self.objects.execute(now, oid, iid, rid, &req.payload)?;
                return Ok(req.response(MsgCode::CHANGED));
            }

            let raw = matches!(
                format.map(ContentFormat::canonical),
                None | Some(ContentFormat::APPLICATION_OCTET_STREAM)
            );
            if self.objects.package_rid(oid) == Some(rid) && raw {
                return self.push_package(now, idx, req, oid, iid);
            }
        }

        let format = match (format, path.rid()) {
            (Some(format), _) => format,
            (None, Some(rid)) if self.objects.kind(oid, rid)? == ValueKind::Opaque => {
                ContentFormat::APPLICATION_OCTET_STREAM
            }
            (None, Some(_)) => ContentFormat::TEXT_PLAIN,
            (None, None) => ContentFormat::LWM2M_TLV,
        };
        self.objects.write_payload(now, &path, format, &req.payload)?;
        self.observations.notify_changed(&path);
        Ok(req.response(MsgCode::CHANGED))
    }

    fn push_package(
        &mut self,
        now: Instant,
        idx: usize,
        req: &CoapMessage,
        oid: u16,
        iid: u16,
    ) -> Result<CoapMessage, ResponseError> {
        let (block, offset, last) = match self.servers[idx].block1.handle(req) {
            Block1Outcome::Accepted { block, offset, last } => (block, offset, last),
            Block1Outcome::Duplicate(resp) => return Ok(resp),
            Block1Outcome::Reject(e) => return Err(e),
        };

        if let Err(e) = self
            .objects
            .write_package(now, oid, iid, offset, &req.payload, last)
        {
            self.servers[idx].block1.abort();
            return Err(e);
        }

        let mut resp = req.response(if last {
            MsgCode::CHANGED
        } else {
            MsgCode::CONTINUE
        });
        if req.block1().is_some() {
            resp.add_option(option::BLOCK1, block);
        }
        self.servers[idx].block1.cache_response(req, &resp);
        Ok(resp)
    }

    fn route(&mut self, now: Instant, notification: crate::observe::Notification) {
        let idx = match self.index(notification.observer) {
            Some(idx) => idx,
            None => return,
        };
        let server = &mut self.servers[idx];
        if server.offline {
            debug!(
                "{} offline, dropping notification for {}",
                server.ssid, notification.observation
            );
            return;
        }
        let id = server
            .engine
            .send_message(now, server.remote, notification.message);
        if notification.confirmable {
            server
                .pending
                .insert(id, Pending::Notification(notification.observation));
        } else {
            server.recent_non.push_back((id, notification.observation));
            while server.recent_non.len() > RECENT_NOTIFICATIONS {
                server.recent_non.pop_front();
            }
        }
    }

    fn handle_exchange_event(&mut self, now: Instant, idx: usize, event: ExchangeEvent) {
        let (id, result) = match event {
            ExchangeEvent::Response { id, response } => (id, Ok(Some(response))),
            ExchangeEvent::Delivered { id } => (id, Ok(None)),
            ExchangeEvent::Failed { id, error } => (id, Err(error)),
        };
        let server = &mut self.servers[idx];
        let ssid = server.ssid;

        let pending = match server.pending.remove(&id) {
            Some(pending) => pending,
            None => {
                let non = server.recent_non.iter().position(|(x, _)| *x == id);
                if let (Some(i), Err(Error::Reset)) = (non, &result) {
                    if let Some((_, obs)) = server.recent_non.remove(i) {
                        self.observations.handle_reset(obs);
                    }
                }
                return;
            }
        };
        let response = result.as_ref().map(|r| r.as_ref()).map_err(|e| *e);

        match pending {
            Pending::Register => {
                let outcome = match response {
                    Ok(Some(resp)) => server.registration.handle_register_result(now, Ok(resp)),
                    Ok(None) => server.registration.handle_register_result(now, Err(Error::Unspecified)),
                    Err(e) => server.registration.handle_register_result(now, Err(e)),
                };
                match outcome {
                    Ok(()) => {
                        self.events.push_back(ClientEvent::Registered(ssid));
                        for object in self.objects.updates_mut() {
                            object.on_registered(now);
                        }
                        self.resume_objects();
                    }
                    Err(_) => {
                        let retry = Duration::from_secs(self.config.register_retry_secs);
                        self.servers[idx].retry_at = Some(now + retry);
                        self.events.push_back(ClientEvent::RegistrationFailed(ssid));
                    }
                }
            }
            Pending::Update => {
                let action = match response {
                    Ok(Some(resp)) => server.registration.handle_update_result(now, Ok(resp)),
                    Ok(None) => server.registration.handle_update_result(now, Err(Error::Unspecified)),
                    Err(e) => server.registration.handle_update_result(now, Err(e)),
                };
                match action {
                    RegistrationAction::None => self.resume_objects(),
                    RegistrationAction::Reregister => self.register(now, idx),
                }
            }
            Pending::Deregister => {
                let acknowledged = match response {
                    Ok(Some(resp)) => server.registration.handle_deregister_result(Ok(resp)),
                    Ok(None) => false,
                    Err(e) => server.registration.handle_deregister_result(Err(e)),
                };
                if !acknowledged {
                    warn!("{} did not acknowledge deregistration", ssid);
                }
                self.remove_server(now, idx);
            }
            Pending::Notification(obs) => match response {
                Ok(_) => self.observations.handle_delivered(obs),
                Err(Error::Reset) => self.observations.handle_reset(obs),
                Err(e) => warn!("{} notification for {} failed: {:?}", ssid, obs, e),
            },
            Pending::Send => match response {
                Ok(Some(resp)) if resp.code == MsgCode::CHANGED => debug!("{} accepted send", ssid),
                Ok(Some(resp)) => warn!("{} rejected send with {}", ssid, resp.code),
                Ok(None) => (),
                Err(e) => warn!("{} send failed: {:?}", ssid, e),
            },
            Pending::Block(target) => {
                let events = match self.pulls.get_mut(&target) {
                    Some(pull) if pull.exchange == Some(id) => {
                        pull.exchange = None;
                        match response {
                            Ok(Some(resp)) => pull.pull.handle_response(resp),
                            Ok(None) => vec![pull.pull.handle_error(Error::Unspecified)],
                            Err(e) => vec![pull.pull.handle_error(e)],
                        }
                    }
                    _ => return,
                };
                self.advance_pull(now, target, events);
            }
        }
    }

    /// The server a CoAP package URI points at, if it names one by address.
    fn pull_server(&self, uri: &str) -> Option<(usize, CoapUri)> {
        let uri = CoapUri::parse(uri).ok()?;
        let remote = uri.literal_addr()?;
        let idx = self
            .servers
            .iter()
            .position(|s| !s.removing && s.kind == uri.kind && s.remote == remote)?;
        Some((idx, uri))
    }

    fn start_pull(
        &mut self,
        now: Instant,
        idx: usize,
        target: Lwm2mPath,
        session: DownloadSession,
        pull: BlockPull,
    ) {
        let ssid = self.servers[idx].ssid;
        info!("{}: pulling {:?} through {}", target, pull.uri().path, ssid);
        self.pulls.insert(
            target,
            Pull {
                ssid,
                session,
                pull,
                exchange: None,
            },
        );
        self.request_block(now, target);
    }

    fn request_block(&mut self, now: Instant, target: Lwm2mPath) {
        let pull = match self.pulls.get_mut(&target) {
            Some(pull) if pull.exchange.is_none() => pull,
            _ => return,
        };
        let ssid = pull.ssid;
        let server = match self.servers.iter_mut().find(|s| s.ssid == ssid && !s.removing) {
            Some(server) => server,
            None => return self.fail_pull(now, target, Error::ConnectionLost),
        };
        let id = server
            .engine
            .start(now, server.remote, pull.pull.request(), pull.pull.options());
        server.pending.insert(id, Pending::Block(target));
        pull.exchange = Some(id);
    }

    fn advance_pull(&mut self, now: Instant, target: Lwm2mPath, events: Vec<DownloadEvent>) {
        let (session, done) = match self.pulls.get(&target) {
            Some(pull) => (pull.session, pull.pull.is_done()),
            None => return,
        };
        if done {
            self.pulls.remove(&target);
        }
        for event in events {
            self.deliver_download(now, &target, session, event);
        }
        if !done {
            self.request_block(now, target);
        }
    }

    fn fail_pull(&mut self, now: Instant, target: Lwm2mPath, error: Error) {
        if let Some(mut pull) = self.pulls.remove(&target) {
            let event = pull.pull.handle_error(error);
            self.deliver_download(now, &target, pull.session, event);
        }
    }

    /// Drops the pull into `target`; false if there was none.
    fn cancel_pull(&mut self, now: Instant, target: &Lwm2mPath) -> bool {
        let pull = match self.pulls.remove(target) {
            Some(pull) => pull,
            None => return false,
        };
        if let (Some(id), Some(idx)) = (pull.exchange, self.index(pull.ssid)) {
            let server = &mut self.servers[idx];
            server.pending.remove(&id);
            server.engine.cancel(now, id);
        }
        debug!("{}: pull cancelled", target);
        true
    }

    fn deliver_download(
        &mut self,
        now: Instant,
        target: &Lwm2mPath,
        session: DownloadSession,
        event: DownloadEvent,
    ) {
        match self.update_object(target) {
            Some((object, iid)) => object.download_event(now, iid, session, event),
            None => warn!("download event for unknown target {}", target),
        }
    }

    fn handle_action(&mut self, now: Instant, action: UpdateAction) {
        match action {
            UpdateAction::StartDownload {
                target,
                session,
                uri,
                offset,
                etag,
            } => {
                self.cancel_pull(now, &target);
                match self.pull_server(&uri) {
                    Some((idx, coap)) => match BlockPull::new(coap, self.config.block_szx(), offset, etag) {
                        Ok(pull) => self.start_pull(now, idx, target, session, pull),
                        Err(failure) => self.deliver_download(
                            now,
                            &target,
                            session,
                            DownloadEvent::Failed(failure),
                        ),
                    },
                    None => self.events.push_back(ClientEvent::StartDownload {
                        target,
                        session,
                        uri,
                        offset,
                        etag,
                    }),
                }
            }
            UpdateAction::CancelDownload { target } => {
                if !self.cancel_pull(now, &target) {
                    self.events.push_back(ClientEvent::CancelDownload { target })
                }
            }
            UpdateAction::Changed(path) => self.observations.notify_changed(&path),
            UpdateAction::Report(path) if self.config.send_on_update => self.report(now, path),
            UpdateAction::Report(_) => (),
            UpdateAction::Restart => {
                if !self.events.contains(&ClientEvent::Restart) {
                    self.events.push_back(ClientEvent::Restart);
                }
            }
        }
    }

    /// Drains engine events and object actions, then produces notifications.
    fn process(&mut self, now: Instant) {
        let mut idx = 0;
        while idx < self.servers.len() {
            let before = self.servers.len();
            while let Some(event) = self.servers.get_mut(idx).and_then(|s| s.engine.poll_event()) {
                self.handle_exchange_event(now, idx, event);
                if self.servers.len() != before {
                    break;
                }
            }
            if self.servers.len() == before {
                idx += 1;
            }
        }

        // Handling an action can hand download events to an object, which
        // may queue further actions.
        loop {
            let mut actions = Vec::new();
            for object in self.objects.updates_mut() {
                while let Some(action) = object.poll_action() {
                    actions.push(action);
                }
            }
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.handle_action(now, action);
            }
        }

        if self.objects.device_mut().take_reboot() {
            self.handle_action(now, UpdateAction::Restart);
        }

        let notifications = self.observations.poll(now, &self.objects);
        for notification in notifications {
            self.route(now, notification);
        }
    }

    /// Next message to send, with the server it is for.
    pub fn poll_transmit(&mut self) -> Option<(ObserverId, Transmit)> {
        self.servers
            .iter_mut()
            .find_map(|s| s.engine.poll_transmit().map(|t| (s.ssid, t)))
    }

    /// Next event for the runtime.
    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// When [`handle_timeout`](Lwm2mClient::handle_timeout) should next be called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let servers = self.servers.iter().flat_map(|s| {
            let update = if s.offline {
                None
            } else {
                s.registration.next_update()
            };
            s.engine
                .poll_timeout()
                .into_iter()
                .chain(update)
                .chain(s.retry_at)
                .chain(s.registration.expires_at())
        });
        let objects = self.objects.updates().filter_map(|o| o.poll_timeout());

        servers
            .chain(objects)
            .chain(self.observations.poll_timeout())
            .min()
    }

    /// Runs everything that is due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        for idx in 0..self.servers.len() {
            self.servers[idx].engine.handle_timeout(now);

            if self.servers[idx].registration.expire(now) {
                let ssid = self.servers[idx].ssid;
                warn!("{} registration lifetime ran out", ssid);
                self.observations.expire_observer(ssid);
            }

            let server = &self.servers[idx];
            if server.offline || server.removing {
                continue;
            }
            if server.retry_at.map(|at| now >= at).unwrap_or(false) {
                self.register(now, idx);
            } else if server.registration.update_due(now) {
                self.update(now, idx);
            }
        }

        for object in self.objects.updates_mut() {
            object.handle_timeout(now);
        }
        self.process(now);
    }
}

#[cfg(test)]
mod tests;
