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

use super::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Stable handle of an observation in the [`ObservationEngine`] arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationId(pub u64);

impl std::fmt::Display for ObservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obs#{}", self.0)
    }
}

/// A value read from the data model for a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadValue {
    /// Content format of `payload`.
    pub format: ContentFormat,
    /// Encoded value.
    pub payload: Vec<u8>,
    /// Numeric value for `lt`/`gt`/`st` evaluation, for single numeric resources.
    pub numeric: Option<f64>,
}

/// Source of the values that observations report.
pub trait DataModel {
    /// Reads `path`, encoded as `accept` when given.
    fn read(&self, path: &Lwm2mPath, accept: Option<ContentFormat>)
        -> Result<ReadValue, ResponseError>;
}

/// Lifecycle of one observation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObservationState {
    /// Notifications are sent.
    Active,
    /// The client is offline; notifications are stored or skipped.
    Suspended,
    /// The observation ended; a final error notification is pending or was sent.
    Cancelled,
}

#[derive(Debug)]
struct Observation {
    observer: ObserverId,
    path: Lwm2mPath,
    token: MsgToken,
    accept: Option<ContentFormat>,
    state: ObservationState,
    seq: u32,
    last_sent: Instant,
    last_eval: Instant,
    last_hash: u64,
    last_numeric: Option<f64>,
    changed: bool,
    missed: bool,
    final_code: Option<MsgCode>,
    final_sent: bool,
}

/// A notification ready to be sent, or stored while offline.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The observation that produced it.
    pub observation: ObservationId,
    /// Recipient.
    pub observer: ObserverId,
    /// True if `message` is confirmable.
    pub confirmable: bool,
    /// The notification, without a message id.
    pub message: CoapMessage,
    /// When the value was captured.
    pub captured: Instant,
}

fn payload_hash(payload: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

fn secs(x: u32) -> Duration {
    Duration::from_secs(x as u64)
}

/// Observation arena and notification scheduler.
///
/// The engine is sans-IO: callers report value changes with
/// [`notify_changed`](ObservationEngine::notify_changed), call
/// [`poll`](ObservationEngine::poll) whenever
/// [`poll_timeout`](ObservationEngine::poll_timeout) expires or something
/// changed, and send the returned notifications.
#[derive(Debug)]
pub struct ObservationEngine {
    observations: BTreeMap<ObservationId, Observation>,
    attributes: AttributeStore,
    stored: BTreeMap<ObserverId, DropOldestQueue<Notification>>,
    stored_limit: usize,
    offline: BTreeSet<ObserverId>,
    next_id: u64,
}

impl ObservationEngine {
    /// Creates an engine storing at most `stored_limit` notifications per
    /// observer while that observer is offline.
    pub fn new(stored_limit: usize) -> ObservationEngine {
        ObservationEngine {
            observations: BTreeMap::new(),
            attributes: AttributeStore::new(),
            stored: BTreeMap::new(),
            stored_limit,
            offline: BTreeSet::new(),
            next_id: 0,
        }
    }

    /// Attribute store.
    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    /// Sets the server-level defaults of `observer`.
    pub fn set_defaults(&mut self, observer: ObserverId, defaults: NotificationDefaults) {
        self.attributes.set_defaults(observer, defaults);
    }

    /// Changes the stored-notification limit.
    pub fn set_stored_limit(&mut self, limit: usize) {
        self.stored_limit = limit;
        for queue in self.stored.values_mut() {
            queue.set_limit(limit);
        }
    }

    /// Number of notifications waiting for their observers to come online.
    pub fn stored_len(&self) -> usize {
        self.stored.values().map(DropOldestQueue::len).sum()
    }

    /// Number of observations, including cancelled ones awaiting their final notification.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// True if there are no observations.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// State of an observation.
    pub fn state(&self, id: ObservationId) -> Option<ObservationState> {
        self.observations.get(&id).map(|obs| obs.state)
    }

    /// Finds the observation of `path` by `observer`.
    pub fn find(&self, observer: ObserverId, path: &Lwm2mPath) -> Option<ObservationId> {
        self.observations
            .iter()
            .find(|(_, obs)| obs.observer == observer && obs.path == *path)
            .map(|(id, _)| *id)
    }

    /// True while `observer` is offline.
    pub fn is_offline(&self, observer: ObserverId) -> bool {
        self.offline.contains(&observer)
    }

    fn alloc_id(&mut self) -> ObservationId {
        self.next_id += 1;
        ObservationId(self.next_id)
    }

    /// Handles an Observe request for `path` and returns the first
    /// response. An existing observation with the same observer and path or
    /// token is replaced.
    pub fn observe(
        &mut self,
        now: Instant,
        observer: ObserverId,
        request: &CoapMessage,
        path: Lwm2mPath,
        model: &dyn DataModel,
    ) -> Result<(ObservationId, CoapMessage), ResponseError> {
        let accept = request.option(option::ACCEPT);
        let value = model.read(&path, accept)?;

        self.observations.retain(|_, obs| {
            obs.observer != observer || (obs.path != path && obs.token != request.token)
        });

        let id = self.alloc_id();
        let observation = Observation {
            observer,
            path,
            token: request.token,
            accept,
            state: if self.offline.contains(&observer) {
                ObservationState::Suspended
            } else {
                ObservationState::Active
            },
            seq: 0,
            last_sent: now,
            last_eval: now,
            last_hash: payload_hash(&value.payload),
            last_numeric: value.numeric,
            changed: false,
            missed: false,
            final_code: None,
            final_sent: false,
        };

        let response = request
            .response(MsgCode::CONTENT)
            .with_option(option::OBSERVE, observation.seq)
            .with_option(option::CONTENT_FORMAT, value.format)
            .with_payload(value.payload);

        debug!("{} {} observes {} with {}", id, observer, path, request.token);
        self.observations.insert(id, observation);
        Ok((id, response))
    }

    /// Removes the observation of `path` by `observer`, as requested by a
    /// GET with Observe=1.
    pub fn cancel_by_path(&mut self, observer: ObserverId, path: &Lwm2mPath) -> bool {
        let before = self.observations.len();
        self.observations
            .retain(|_, obs| obs.observer != observer || obs.path != *path);
        before != self.observations.len()
    }

    /// Removes the observation of `observer` carrying `token`.
    pub fn cancel_by_token(&mut self, observer: ObserverId, token: MsgToken) -> bool {
        let before = self.observations.len();
        self.observations
            .retain(|_, obs| obs.observer != observer || obs.token != token);
        before != self.observations.len()
    }

    /// The observer answered a notification with a Reset.
    pub fn handle_reset(&mut self, id: ObservationId) {
        if self.observations.remove(&id).is_some() {
            debug!("{} cancelled by reset", id);
        }
    }

    /// A confirmable notification was acknowledged. Finalizes removal of a
    /// cancelled observation.
    pub fn handle_delivered(&mut self, id: ObservationId) {
        let finished = self
            .observations
            .get(&id)
            .map(|obs| obs.state == ObservationState::Cancelled && obs.final_sent)
            .unwrap_or(false);
        if finished {
            self.observations.remove(&id);
        }
    }

    /// Marks an observation as ended; its next notification carries `code`.
    pub fn cancel_with(&mut self, id: ObservationId, code: MsgCode) {
        if let Some(obs) = self.observations.get_mut(&id) {
            obs.state = ObservationState::Cancelled;
            obs.final_code = Some(code);
        }
    }

    /// Applies a Write-Attributes request.
    pub fn write_attributes(
        &mut self,
        observer: ObserverId,
        path: &Lwm2mPath,
        write: &AttributeWrite,
    ) -> Result<(), ResponseError> {
        self.attributes.write(observer, path, write)
    }

    /// Reports that the value at `path` changed.
    pub fn notify_changed(&mut self, path: &Lwm2mPath) {
        for obs in self.observations.values_mut() {
            if obs.state != ObservationState::Cancelled && obs.path.overlaps(path) {
                obs.changed = true;
            }
        }
    }

    /// Drops every observation of `observer` and its stored notifications,
    /// e.g. on re-registration.
    pub fn remove_observer(&mut self, observer: ObserverId) {
        self.observations.retain(|_, obs| obs.observer != observer);
        self.stored.remove(&observer);
        self.offline.remove(&observer);
    }

    /// The registration of `observer` expired. Without storing its
    /// observations end.
    pub fn expire_observer(&mut self, observer: ObserverId) {
        if !self.attributes.defaults(observer).storing {
            self.remove_observer(observer);
        }
    }

    fn storing(&self, observer: ObserverId) -> bool {
        self.attributes.defaults(observer).storing && self.stored_limit > 0
    }

    /// Attributes in effect for an observation: its own inherited
    /// attributes, with pmin and pmax lowered to those of any observed
    /// ancestor of the same observer.
    fn effective(&self, obs: &Observation) -> Attributes {
        let mut attrs = self.attributes.effective(obs.observer, &obs.path);

        for other in self.observations.values() {
            if other.observer != obs.observer
                || other.path == obs.path
                || !other.path.is_prefix_of(&obs.path)
            {
                continue;
            }
            let outer = self.attributes.effective(other.observer, &other.path);
            attrs.pmin = match (attrs.pmin, outer.pmin) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if let Some(outer_pmax) = outer.scheduled_pmax() {
                attrs.pmax = Some(match attrs.scheduled_pmax() {
                    Some(pmax) => pmax.min(outer_pmax),
                    None => outer_pmax,
                });
            }
        }

        attrs
    }

    fn build(obs: &mut Observation, attrs: &Attributes, code: MsgCode) -> CoapMessage {
        obs.seq = (obs.seq + 1) & OBSERVE_SEQ_MASK;
        let msg_type = if attrs.con == Some(true) || code.is_error() {
            MsgType::Con
        } else {
            MsgType::Non
        };
        CoapMessage::new(msg_type, code)
            .with_token(obs.token)
            .with_option(option::OBSERVE, obs.seq)
    }

    /// Produces the notifications that are due at `now`.
    ///
    /// Nothing is returned for an offline observer. Its notifications are
    /// stored when storing is enabled, evicting the oldest once its queue
    /// is full.
    pub fn poll(&mut self, now: Instant, model: &dyn DataModel) -> Vec<Notification> {
        let mut out = Vec::new();
        let ids: Vec<ObservationId> = self.observations.keys().copied().collect();

        for id in ids {
            let (attrs, storing, offline) = match self.observations.get(&id) {
                Some(obs) => (
                    self.effective(obs),
                    self.storing(obs.observer),
                    self.offline.contains(&obs.observer),
                ),
                None => continue,
            };
            let obs = match self.observations.get_mut(&id) {
                Some(obs) => obs,
                None => continue,
            };

            if obs.state == ObservationState::Cancelled {
                if let (Some(code), false, false) = (obs.final_code, obs.final_sent, offline) {
                    obs.final_sent = true;
                    let message = Self::build(obs, &attrs, code);
                    info!("{} ended with {}", id, code);
                    out.push(Notification {
                        observation: id,
                        observer: obs.observer,
                        confirmable: true,
                        message,
                        captured: now,
                    });
                }
                continue;
            }

            if offline && !storing {
                if obs.changed {
                    obs.changed = false;
                    obs.missed = true;
                }
                continue;
            }

            let since = now.saturating_duration_since(obs.last_sent);
            let since_eval = now.saturating_duration_since(obs.last_eval);
            let pmax_due = attrs
                .scheduled_pmax()
                .map(|pmax| since >= secs(pmax))
                .unwrap_or(false);
            let epmax_due = attrs
                .epmax
                .filter(|epmax| *epmax > 0)
                .map(|epmax| since_eval >= secs(epmax))
                .unwrap_or(false);
            let epmin_ok = attrs
                .epmin
                .map(|epmin| since_eval >= secs(epmin))
                .unwrap_or(true);

            if !((obs.changed && epmin_ok) || epmax_due || pmax_due) {
                continue;
            }
            if since < secs(attrs.pmin.unwrap_or(0)) {
                continue;
            }

            let value = match model.read(&obs.path, obs.accept) {
                Ok(value) => value,
                Err(error) => {
                    warn!("{} read of {} failed: {}", id, obs.path, error);
                    obs.state = ObservationState::Cancelled;
                    obs.final_code = Some(error.msg_code());
                    if !offline {
                        obs.final_sent = true;
                        let message = Self::build(obs, &attrs, error.msg_code());
                        out.push(Notification {
                            observation: id,
                            observer: obs.observer,
                            confirmable: true,
                            message,
                            captured: now,
                        });
                    }
                    continue;
                }
            };
            obs.last_eval = now;

            let hash = payload_hash(&value.payload);
            if !pmax_due {
                if !obs.changed && hash == obs.last_hash {
                    continue;
                }
                if let Some(current) = value.numeric {
                    if !attrs.threshold_crossed(obs.last_numeric, current) {
                        obs.changed = false;
                        continue;
                    }
                }
            }

            obs.changed = false;
            obs.last_sent = now;
            obs.last_hash = hash;
            obs.last_numeric = value.numeric;

            let message = Self::build(obs, &attrs, MsgCode::CONTENT)
                .with_option(option::CONTENT_FORMAT, value.format)
                .with_payload(value.payload);
            let notification = Notification {
                observation: id,
                observer: obs.observer,
                confirmable: message.msg_type == Some(MsgType::Con),
                message,
                captured: now,
            };

            if offline {
                debug!("{} stored notification {}", id, obs.seq);
                let limit = self.stored_limit;
                self.stored
                    .entry(notification.observer)
                    .or_insert_with(|| DropOldestQueue::new(limit))
                    .push(notification);
            } else {
                out.push(notification);
            }
        }

        out
    }

    /// When [`poll`](ObservationEngine::poll) should next be called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |at: Instant| {
            next = Some(next.map_or(at, |n| n.min(at)));
        };

        for obs in self.observations.values() {
            let offline = self.offline.contains(&obs.observer);
            if obs.state == ObservationState::Cancelled {
                if obs.final_code.is_some() && !obs.final_sent && !offline {
                    consider(obs.last_sent);
                }
                continue;
            }
            if offline && !self.storing(obs.observer) {
                continue;
            }

            let attrs = self.effective(obs);
            let pmin_at = obs.last_sent + secs(attrs.pmin.unwrap_or(0));

            if obs.changed {
                let epmin_at = obs.last_eval + secs(attrs.epmin.unwrap_or(0));
                consider(pmin_at.max(epmin_at));
            }
            if let Some(pmax) = attrs.scheduled_pmax() {
                consider(pmin_at.max(obs.last_sent + secs(pmax)));
            }
            if let Some(epmax) = attrs.epmax.filter(|epmax| *epmax > 0) {
                consider(pmin_at.max(obs.last_eval + secs(epmax)));
            }
        }

        next
    }

    /// Suspends the observations of `observer`.
    pub fn enter_offline(&mut self, observer: ObserverId) {
        self.offline.insert(observer);
        for obs in self.observations.values_mut() {
            if obs.observer == observer && obs.state == ObservationState::Active {
                obs.state = ObservationState::Suspended;
            }
        }
    }

    /// Resumes the observations of `observer` and returns its stored
    /// notifications, oldest first. Observations that skipped changes while
    /// offline without storing report their current value on the next poll.
    pub fn exit_offline(&mut self, observer: ObserverId) -> Vec<Notification> {
        self.offline.remove(&observer);
        for obs in self.observations.values_mut() {
            if obs.observer != observer {
                continue;
            }
            if obs.state == ObservationState::Suspended {
                obs.state = ObservationState::Active;
            }
            if obs.missed {
                obs.missed = false;
                obs.changed = true;
            }
        }

        let observations = &self.observations;
        match self.stored.remove(&observer) {
            Some(mut queue) => queue
                .drain()
                .filter(|n| observations.contains_key(&n.observation))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    const SERVER: ObserverId = ObserverId(1);

    #[derive(Default)]
    struct Model(RefCell<HashMap<Lwm2mPath, f64>>);

    impl Model {
        fn set(&self, path: Lwm2mPath, value: f64) {
            self.0.borrow_mut().insert(path, value);
        }
    }

    impl DataModel for Model {
        fn read(
            &self,
            path: &Lwm2mPath,
            _accept: Option<ContentFormat>,
        ) -> Result<ReadValue, ResponseError> {
            let values = self.0.borrow();
            let value = values
                .iter()
                .find(|(p, _)| path.is_prefix_of(p))
                .map(|(_, v)| *v)
                .ok_or(ResponseError::NotFound)?;
            Ok(ReadValue {
                format: ContentFormat::TEXT_PLAIN,
                payload: value.to_string().into_bytes(),
                numeric: Some(value),
            })
        }
    }

    const VOLTAGE: Lwm2mPath = Lwm2mPath::resource(3, 0, 7);

    fn observe_request(token: u8) -> CoapMessage {
        CoapMessage::request(MsgCode::GET)
            .with_token(MsgToken::new(&[token]).unwrap())
            .with_option(option::OBSERVE, OBSERVE_REGISTER)
    }

    fn attrs(engine: &mut ObservationEngine, path: Lwm2mPath, query: &[&str]) {
        let write = AttributeWrite::parse_query(query).unwrap();
        engine.write_attributes(SERVER, &path, &write).unwrap();
    }

    fn at(start: Instant, secs: u64) -> Instant {
        start + Duration::from_secs(secs)
    }

    #[test]
    fn observe_then_cancel() {
        let model = Model::default();
        model.set(VOLTAGE, 3800.0);
        let mut engine = ObservationEngine::new(8);
        let now = Instant::now();

        let (_, response) = engine
            .observe(now, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();
        assert_eq!(MsgCode::CONTENT, response.code);
        assert_eq!(Some(0), response.observe());
        assert_eq!(b"3800".to_vec(), response.payload);

        assert!(engine.cancel_by_path(SERVER, &VOLTAGE));
        assert!(engine.is_empty());
        assert!(!engine.cancel_by_path(SERVER, &VOLTAGE));
    }

    #[test]
    fn pmax_repeats_unchanged_value() {
        let model = Model::default();
        model.set(VOLTAGE, 3800.0);
        let mut engine = ObservationEngine::new(8);
        attrs(&mut engine, VOLTAGE, &["pmin=0", "pmax=2"]);
        let start = Instant::now();
        engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();

        assert_eq!(Some(at(start, 2)), engine.poll_timeout());
        assert!(engine.poll(at(start, 1), &model).is_empty());

        let first = engine.poll(at(start, 2), &model);
        assert_eq!(1, first.len());
        assert_eq!(Some(MsgType::Non), first[0].message.msg_type);
        assert_eq!(Some(1), first[0].message.observe());

        let second = engine.poll(at(start, 4), &model);
        assert_eq!(1, second.len());
        assert_eq!(first[0].message.payload, second[0].message.payload);
        assert_eq!(Some(2), second[0].message.observe());
    }

    #[test]
    fn pmin_delays_change() {
        let model = Model::default();
        model.set(VOLTAGE, 1.0);
        let mut engine = ObservationEngine::new(8);
        attrs(&mut engine, VOLTAGE, &["pmin=5"]);
        let start = Instant::now();
        engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();

        model.set(VOLTAGE, 2.0);
        engine.notify_changed(&VOLTAGE);
        assert!(engine.poll(at(start, 1), &model).is_empty());
        assert_eq!(Some(at(start, 5)), engine.poll_timeout());

        let sent = engine.poll(at(start, 5), &model);
        assert_eq!(b"2".to_vec(), sent[0].message.payload);
        assert_eq!(None, engine.poll_timeout());
    }

    #[test]
    fn pmax_zero_or_below_pmin_is_silent() {
        let model = Model::default();
        model.set(VOLTAGE, 1.0);
        let start = Instant::now();

        for query in [&["pmax=0"][..], &["pmin=10", "pmax=5"][..]] {
            let mut engine = ObservationEngine::new(8);
            attrs(&mut engine, VOLTAGE, query);
            engine
                .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
                .unwrap();
            assert_eq!(None, engine.poll_timeout());
            assert!(engine.poll(at(start, 100), &model).is_empty());
        }
    }

    #[test]
    fn thresholds_filter_changes() {
        let model = Model::default();
        model.set(VOLTAGE, 15.0);
        let mut engine = ObservationEngine::new(8);
        attrs(&mut engine, VOLTAGE, &["gt=20"]);
        let start = Instant::now();
        engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();

        model.set(VOLTAGE, 18.0);
        engine.notify_changed(&VOLTAGE);
        assert!(engine.poll(at(start, 1), &model).is_empty());

        model.set(VOLTAGE, 21.0);
        engine.notify_changed(&VOLTAGE);
        assert_eq!(1, engine.poll(at(start, 2), &model).len());
    }

    #[test]
    fn con_attribute() {
        let model = Model::default();
        model.set(VOLTAGE, 1.0);
        let mut engine = ObservationEngine::new(8);
        attrs(&mut engine, Lwm2mPath::object(3), &["con=1"]);
        let start = Instant::now();
        engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();
        model.set(VOLTAGE, 2.0);
        engine.notify_changed(&VOLTAGE);
        let sent = engine.poll(start, &model);
        assert!(sent[0].confirmable);
        assert_eq!(Some(MsgType::Con), sent[0].message.msg_type);
    }

    #[test]
    fn not_found_ends_observation() {
        let model = Model::default();
        model.set(VOLTAGE, 1.0);
        let mut engine = ObservationEngine::new(8);
        let start = Instant::now();
        let (id, _) = engine
            .observe(start, SERVER, &observe_request(9), VOLTAGE, &model)
            .unwrap();

        model.0.borrow_mut().clear();
        engine.notify_changed(&VOLTAGE);
        let sent = engine.poll(start, &model);
        assert_eq!(MsgCode::NOT_FOUND, sent[0].message.code);
        assert_eq!(Some(MsgType::Con), sent[0].message.msg_type);
        assert_eq!(MsgToken::new(&[9]).unwrap(), sent[0].message.token);
        assert_eq!(Some(ObservationState::Cancelled), engine.state(id));

        assert!(engine.poll(at(start, 10), &model).is_empty());
        engine.handle_delivered(id);
        assert!(engine.is_empty());
    }

    #[test]
    fn reset_removes() {
        let model = Model::default();
        model.set(VOLTAGE, 1.0);
        let mut engine = ObservationEngine::new(8);
        let (id, _) = engine
            .observe(Instant::now(), SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();
        engine.handle_reset(id);
        assert!(engine.is_empty());
    }

    #[test]
    fn outer_observation_lowers_pmax() {
        let model = Model::default();
        model.set(VOLTAGE, 1.0);
        let mut engine = ObservationEngine::new(8);
        attrs(&mut engine, Lwm2mPath::object(3), &["pmax=5"]);
        attrs(&mut engine, VOLTAGE, &["pmax=60"]);
        let start = Instant::now();
        engine
            .observe(start, SERVER, &observe_request(1), Lwm2mPath::object(3), &model)
            .unwrap();
        let (leaf, _) = engine
            .observe(start, SERVER, &observe_request(2), VOLTAGE, &model)
            .unwrap();

        let sent = engine.poll(at(start, 5), &model);
        assert!(sent.iter().any(|n| n.observation == leaf));
    }

    #[test]
    fn stored_queue_keeps_most_recent() {
        let model = Model::default();
        model.set(VOLTAGE, 0.0);
        let mut engine = ObservationEngine::new(3);
        let start = Instant::now();
        engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();

        engine.enter_offline(SERVER);
        for i in 1..=6 {
            model.set(VOLTAGE, i as f64);
            engine.notify_changed(&VOLTAGE);
            assert!(engine.poll(at(start, i), &model).is_empty());
        }
        assert_eq!(3, engine.stored_len());

        let delivered: Vec<Vec<u8>> = engine
            .exit_offline(SERVER)
            .into_iter()
            .map(|n| n.message.payload)
            .collect();
        assert_eq!(vec![b"4".to_vec(), b"5".to_vec(), b"6".to_vec()], delivered);
    }

    #[test]
    fn storing_disabled_sends_current_value_on_reconnect() {
        let model = Model::default();
        model.set(VOLTAGE, 0.0);
        let mut engine = ObservationEngine::new(3);
        engine.set_defaults(
            SERVER,
            NotificationDefaults {
                storing: false,
                ..Default::default()
            },
        );
        let start = Instant::now();
        engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();

        engine.enter_offline(SERVER);
        for i in 1..=3 {
            model.set(VOLTAGE, i as f64);
            engine.notify_changed(&VOLTAGE);
            assert!(engine.poll(at(start, i), &model).is_empty());
        }
        assert_eq!(None, engine.poll_timeout());
        assert!(engine.exit_offline(SERVER).is_empty());

        let sent = engine.poll(at(start, 4), &model);
        assert_eq!(1, sent.len());
        assert_eq!(b"3".to_vec(), sent[0].message.payload);
    }

    #[test]
    fn repeated_write_attributes_changes_nothing() {
        let model = Model::default();
        model.set(VOLTAGE, 1.0);
        let mut engine = ObservationEngine::new(8);
        attrs(&mut engine, VOLTAGE, &["pmin=1", "pmax=10", "gt=5"]);
        let start = Instant::now();
        let (id, _) = engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();
        let attributes = engine.attributes().get(SERVER, &VOLTAGE);
        let timeout = engine.poll_timeout();

        attrs(&mut engine, VOLTAGE, &["pmin=1", "pmax=10", "gt=5"]);

        assert_eq!(attributes, engine.attributes().get(SERVER, &VOLTAGE));
        assert_eq!(timeout, engine.poll_timeout());
        assert_eq!(Some(ObservationState::Active), engine.state(id));
        assert_eq!(1, engine.len());

        let sent = engine.poll(at(start, 10), &model);
        assert_eq!(1, sent.len());
        assert_eq!(Some(1), sent[0].message.observe());
    }

    #[test]
    fn offline_is_tracked_per_observer() {
        const OTHER: ObserverId = ObserverId(2);
        let model = Model::default();
        model.set(VOLTAGE, 0.0);
        let mut engine = ObservationEngine::new(4);
        let start = Instant::now();
        let (stored, _) = engine
            .observe(start, SERVER, &observe_request(1), VOLTAGE, &model)
            .unwrap();
        let (live, _) = engine
            .observe(start, OTHER, &observe_request(2), VOLTAGE, &model)
            .unwrap();

        engine.enter_offline(SERVER);
        assert!(engine.is_offline(SERVER));
        assert!(!engine.is_offline(OTHER));
        assert_eq!(Some(ObservationState::Suspended), engine.state(stored));
        assert_eq!(Some(ObservationState::Active), engine.state(live));

        model.set(VOLTAGE, 1.0);
        engine.notify_changed(&VOLTAGE);
        let sent = engine.poll(at(start, 1), &model);
        assert_eq!(1, sent.len());
        assert_eq!(OTHER, sent[0].observer);
        assert_eq!(1, engine.stored_len());

        assert!(engine.exit_offline(OTHER).is_empty());
        let delivered = engine.exit_offline(SERVER);
        assert_eq!(1, delivered.len());
        assert_eq!(stored, delivered[0].observation);
        assert_eq!(b"1".to_vec(), delivered[0].message.payload);
        assert_eq!(0, engine.stored_len());
    }
}
