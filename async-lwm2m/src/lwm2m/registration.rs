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

use super::link_format::*;
use super::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Protocol version advertised in the `lwm2m=` query parameter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lwm2mVersion {
    /// LwM2M 1.0
    #[serde(rename = "1.0")]
    V1_0,
    /// LwM2M 1.1
    #[serde(rename = "1.1")]
    V1_1,
    /// LwM2M 1.2
    #[serde(rename = "1.2")]
    V1_2,
}

impl Lwm2mVersion {
    /// The version string.
    pub fn as_str(self) -> &'static str {
        match self {
            Lwm2mVersion::V1_0 => "1.0",
            Lwm2mVersion::V1_1 => "1.1",
            Lwm2mVersion::V1_2 => "1.2",
        }
    }
}

impl Default for Lwm2mVersion {
    fn default() -> Self {
        Lwm2mVersion::V1_1
    }
}

/// Parameters of the Register request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterParams {
    /// Endpoint client name.
    pub endpoint: String,
    /// Registration lifetime in seconds.
    pub lifetime: u32,
    /// Binding mode, e.g. `U` or `T`.
    pub binding: Option<String>,
    /// Queue mode; sent as the `Q` flag on LwM2M 1.1 and later.
    pub queue_mode: bool,
    /// Protocol version.
    pub version: Lwm2mVersion,
}

/// One object in the Register inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Object id.
    pub oid: u16,
    /// Object version, if other than 1.0.
    pub version: Option<String>,
    /// Instance ids, ascending.
    pub instances: Vec<u16>,
}

/// Writes the CoRE-Link object inventory carried by Register and by an
/// Update that reports changed objects.
pub fn object_links(version: Lwm2mVersion, objects: &[ObjectEntry]) -> String {
    let mut write = LinkWriter::new();

    let format = if version >= Lwm2mVersion::V1_1 {
        ContentFormat::APPLICATION_SENML_CBOR
    } else {
        ContentFormat::LWM2M_TLV
    };
    write
        .link("/")
        .quoted(LINK_ATTR_RESOURCE_TYPE, "oma.lwm2m")
        .value(LINK_ATTR_CONTENT_FORMAT, format.0);

    for object in objects {
        match (&object.version, object.instances.is_empty()) {
            (Some(ver), _) => {
                write
                    .link(Lwm2mPath::object(object.oid))
                    .quoted(LINK_ATTR_OBJECT_VERSION, ver);
            }
            (None, true) => {
                write.link(Lwm2mPath::object(object.oid));
            }
            (None, false) => (),
        }
        for iid in &object.instances {
            write.link(Lwm2mPath::instance(object.oid, *iid));
        }
    }

    write.into_string()
}

/// Builds the Register request `POST /rd?lwm2m=..&ep=..&lt=..`.
pub fn register_request(params: &RegisterParams, links: &str) -> CoapMessage {
    let mut msg = CoapMessage::request(MsgCode::POST)
        .with_uri_path(RD_PATH)
        .with_option(option::CONTENT_FORMAT, ContentFormat::APPLICATION_LINK_FORMAT)
        .with_payload(links.as_bytes());

    msg.add_uri_query(&format!("lwm2m={}", params.version.as_str()));
    msg.add_uri_query(&format!("ep={}", params.endpoint));
    msg.add_uri_query(&format!("lt={}", params.lifetime));
    if let Some(binding) = &params.binding {
        msg.add_uri_query(&format!("b={}", binding));
    }
    if params.queue_mode && params.version >= Lwm2mVersion::V1_1 {
        msg.add_uri_query("Q");
    }
    msg
}

/// Builds an Update request to the registration `location`.
pub fn update_request(
    location: &[String],
    lifetime: Option<u32>,
    binding: Option<&str>,
    links: Option<&str>,
) -> CoapMessage {
    let mut msg = CoapMessage::request(MsgCode::POST);
    for segment in location {
        msg.add_raw_option(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
    }
    if let Some(lifetime) = lifetime {
        msg.add_uri_query(&format!("lt={}", lifetime));
    }
    if let Some(binding) = binding {
        msg.add_uri_query(&format!("b={}", binding));
    }
    if let Some(links) = links {
        msg.add_option(option::CONTENT_FORMAT, ContentFormat::APPLICATION_LINK_FORMAT);
        msg.payload = links.as_bytes().to_vec();
    }
    msg
}

/// Builds the Deregister request.
pub fn deregister_request(location: &[String]) -> CoapMessage {
    let mut msg = CoapMessage::request(MsgCode::DELETE);
    for segment in location {
        msg.add_raw_option(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
    }
    msg
}

/// Where a registration is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// Not registered, or registration was lost.
    Unregistered,
    /// Register sent, awaiting 2.01.
    Registering,
    /// Registered at `location`.
    Registered,
    /// Update sent.
    Updating,
    /// Deregister sent.
    Deregistering,
    /// Deregister acknowledged.
    Deregistered,
}

/// What the caller should do after a registration response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegistrationAction {
    /// Nothing; the registration is current.
    None,
    /// Send a fresh Register.
    Reregister,
}

/// Registration lifecycle with one LwM2M server.
///
/// Updates fall due at half the lifetime after the last successful
/// Register or Update. A 4.04 to an Update means the server forgot the
/// registration; any failure of an Update falls back to Register.
#[derive(Debug, Clone)]
pub struct Registration {
    params: RegisterParams,
    state: RegistrationState,
    location: Vec<String>,
    refreshed_at: Option<Instant>,
    update_forced: bool,
    expired: bool,
}

impl Registration {
    /// Creates an unregistered lifecycle.
    pub fn new(params: RegisterParams) -> Registration {
        Registration {
            params,
            state: RegistrationState::Unregistered,
            location: Vec::new(),
            refreshed_at: None,
            update_forced: false,
            expired: false,
        }
    }

    /// Register parameters.
    pub fn params(&self) -> &RegisterParams {
        &self.params
    }

    /// Current state.
    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    /// True while registered, including while an Update is in flight.
    pub fn is_registered(&self) -> bool {
        matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::Updating
        )
    }

    /// Location-Path of the registration.
    pub fn location(&self) -> &[String] {
        &self.location
    }

    /// Builds the Register request and enters `Registering`.
    pub fn register(&mut self, links: &str) -> CoapMessage {
        self.state = RegistrationState::Registering;
        self.update_forced = false;
        register_request(&self.params, links)
    }

    /// Processes the outcome of Register.
    pub fn handle_register_result(
        &mut self,
        now: Instant,
        result: Result<&CoapMessage, Error>,
    ) -> Result<(), Error> {
        match result {
            Ok(response) if response.code == MsgCode::CREATED => {
                self.location = response.location_path();
                self.refreshed_at = Some(now);
                self.expired = false;
                self.state = RegistrationState::Registered;
                info!("registered as {:?}", self.location);
                Ok(())
            }
            Ok(response) => {
                warn!("register rejected with {}", response.code);
                self.state = RegistrationState::Unregistered;
                Err(Error::Reset)
            }
            Err(error) => {
                warn!("register failed: {:?}", error);
                self.state = RegistrationState::Unregistered;
                Err(error)
            }
        }
    }

    /// Requests an Update at the next opportunity.
    pub fn force_update(&mut self) {
        self.update_forced = true;
    }

    /// When the next periodic Update falls due.
    pub fn next_update(&self) -> Option<Instant> {
        if self.state != RegistrationState::Registered {
            return None;
        }
        self.refreshed_at
            .map(|at| at + Duration::from_secs(self.params.lifetime as u64) / 2)
    }

    /// When the server drops the registration unless it is refreshed.
    /// `None` once that has happened.
    pub fn expires_at(&self) -> Option<Instant> {
        if self.expired || !self.is_registered() {
            return None;
        }
        self.refreshed_at
            .map(|at| at + Duration::from_secs(self.params.lifetime as u64))
    }

    /// Records that the lifetime ran out by `now`. True only on the call
    /// that notices it.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.expires_at() {
            Some(at) if now >= at => {
                self.expired = true;
                true
            }
            _ => false,
        }
    }

    /// True if an Update should be sent now.
    pub fn update_due(&self, now: Instant) -> bool {
        self.state == RegistrationState::Registered
            && (self.update_forced || self.next_update().map(|at| now >= at).unwrap_or(false))
    }

    /// Builds an Update request and enters `Updating`.
    pub fn update(&mut self, links: Option<&str>) -> Option<CoapMessage> {
        if self.state != RegistrationState::Registered {
            return None;
        }
        self.state = RegistrationState::Updating;
        self.update_forced = false;
        Some(update_request(&self.location, None, None, links))
    }

    /// Processes the outcome of Update.
    pub fn handle_update_result(
        &mut self,
        now: Instant,
        result: Result<&CoapMessage, Error>,
    ) -> RegistrationAction {
        match result {
            Ok(response) if response.code == MsgCode::CHANGED => {
                self.refreshed_at = Some(now);
                self.expired = false;
                self.state = RegistrationState::Registered;
                debug!("registration updated");
                RegistrationAction::None
            }
            Ok(response) => {
                warn!("update rejected with {}, re-registering", response.code);
                self.state = RegistrationState::Unregistered;
                RegistrationAction::Reregister
            }
            Err(error) => {
                warn!("update failed ({:?}), re-registering", error);
                self.state = RegistrationState::Unregistered;
                RegistrationAction::Reregister
            }
        }
    }

    /// Builds the Deregister request, if registered.
    pub fn deregister(&mut self) -> Option<CoapMessage> {
        if !self.is_registered() {
            return None;
        }
        self.state = RegistrationState::Deregistering;
        Some(deregister_request(&self.location))
    }

    /// Processes the outcome of Deregister; true if it was acknowledged.
    pub fn handle_deregister_result(&mut self, result: Result<&CoapMessage, Error>) -> bool {
        let acknowledged = matches!(result, Ok(response) if response.code == MsgCode::DELETED);
        self.state = RegistrationState::Deregistered;
        self.location.clear();
        acknowledged
    }

    /// Drops the registration, e.g. after a transport reset.
    pub fn invalidate(&mut self) {
        self.state = RegistrationState::Unregistered;
        self.refreshed_at = None;
        self.expired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RegisterParams {
        RegisterParams {
            endpoint: "urn:dev:os:0023C7-000001".into(),
            lifetime: 86400,
            binding: Some("U".into()),
            queue_mode: true,
            version: Lwm2mVersion::V1_1,
        }
    }

    #[test]
    fn register_query() {
        let links = object_links(
            Lwm2mVersion::V1_1,
            &[
                ObjectEntry {
                    oid: 3,
                    version: None,
                    instances: vec![0],
                },
                ObjectEntry {
                    oid: 33629,
                    version: Some("1.0".into()),
                    instances: vec![0, 1],
                },
            ],
        );
        assert_eq!(
            r#"</>;rt="oma.lwm2m";ct=112,</3/0>,</33629>;ver="1.0",</33629/0>,</33629/1>"#,
            links
        );

        let msg = register_request(&params(), &links);
        assert_eq!(vec!["rd"], msg.uri_path());
        assert_eq!(
            vec!["lwm2m=1.1", "ep=urn:dev:os:0023C7-000001", "lt=86400", "b=U", "Q"],
            msg.uri_queries()
        );
        assert_eq!(Some(ContentFormat::APPLICATION_LINK_FORMAT), msg.content_format());
    }

    #[test]
    fn lifecycle() {
        let start = Instant::now();
        let mut reg = Registration::new(params());
        let _ = reg.register("");

        let created = CoapMessage::new(MsgType::Ack, MsgCode::CREATED)
            .with_option(option::LOCATION_PATH, "rd".to_string())
            .with_option(option::LOCATION_PATH, "5a3f".to_string());
        reg.handle_register_result(start, Ok(&created)).unwrap();
        assert!(reg.is_registered());
        assert_eq!(Some(start + Duration::from_secs(43200)), reg.next_update());
        assert!(!reg.update_due(start + Duration::from_secs(43199)));
        assert!(reg.update_due(start + Duration::from_secs(43200)));

        let update = reg.update(None).unwrap();
        assert_eq!(vec!["rd", "5a3f"], update.uri_path());
        assert!(update.payload.is_empty());

        let not_found = CoapMessage::new(MsgType::Ack, MsgCode::NOT_FOUND);
        assert_eq!(
            RegistrationAction::Reregister,
            reg.handle_update_result(start, Ok(&not_found))
        );
        assert!(!reg.is_registered());
    }

    #[test]
    fn lifetime_runs_out_once() {
        let start = Instant::now();
        let mut reg = Registration::new(RegisterParams {
            lifetime: 60,
            ..params()
        });
        assert_eq!(None, reg.expires_at());
        let _ = reg.register("");
        let created = CoapMessage::new(MsgType::Ack, MsgCode::CREATED)
            .with_option(option::LOCATION_PATH, "rd".to_string())
            .with_option(option::LOCATION_PATH, "5a3f".to_string());
        reg.handle_register_result(start, Ok(&created)).unwrap();

        let lapse = start + Duration::from_secs(60);
        assert_eq!(Some(lapse), reg.expires_at());
        assert!(!reg.expire(lapse - Duration::from_secs(1)));
        assert!(reg.expire(lapse));
        assert!(!reg.expire(lapse));
        assert_eq!(None, reg.expires_at());

        let _ = reg.update(None).unwrap();
        let changed = CoapMessage::new(MsgType::Ack, MsgCode::CHANGED);
        reg.handle_update_result(lapse, Ok(&changed));
        assert_eq!(Some(lapse + Duration::from_secs(60)), reg.expires_at());
    }

    #[test]
    fn deregister() {
        let mut reg = Registration::new(params());
        assert_eq!(None, reg.deregister());
        let _ = reg.register("");
        let created = CoapMessage::new(MsgType::Ack, MsgCode::CREATED)
            .with_option(option::LOCATION_PATH, "rd".to_string())
            .with_option(option::LOCATION_PATH, "1".to_string());
        reg.handle_register_result(Instant::now(), Ok(&created)).unwrap();

        let msg = reg.deregister().unwrap();
        assert_eq!(MsgCode::DELETE, msg.code);
        let deleted = CoapMessage::new(MsgType::Ack, MsgCode::DELETED);
        assert!(reg.handle_deregister_result(Ok(&deleted)));
    }
}
