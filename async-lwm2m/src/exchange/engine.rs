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

//! The sans-IO exchange engine.

use super::*;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Identifies an exchange for the lifetime of an [`ExchangeEngine`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Life-cycle of an exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    /// Queued behind `NSTART` or while offline.
    Pending,

    /// A confirmable message was sent and not yet acknowledged.
    AwaitingAck,

    /// Acknowledged (or never needing an ACK); waiting for the response.
    AwaitingResponse,

    /// Part of a block-wise transfer has completed; the next block is in flight.
    AwaitingMoreBlocks,

    /// Finished with a response.
    Complete,

    /// The deadline passed or retransmissions ran out.
    TimedOut,

    /// Cancelled locally.
    Cancelled,
}

/// Per-request knobs for [`ExchangeEngine::start`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// Absolute deadline. Defaults to `now + MAX_TRANSMIT_WAIT`.
    pub deadline: Option<Instant>,

    /// Fetch the remaining BLOCK2 blocks and deliver one response with the
    /// whole representation.
    pub collect_block2: bool,

    /// Block size exponent used when the payload needs to be sent with BLOCK1.
    pub block1_szx: u8,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            deadline: None,
            collect_block2: true,
            block1_szx: BlockInfo::SZX_MAX,
        }
    }
}

/// A message the engine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Destination.
    pub remote: SocketAddr,

    /// The message to encode and send.
    pub message: CoapMessage,
}

/// Something that happened to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// The request completed with this (reassembled) response.
    Response {
        /// Exchange.
        id: ExchangeId,
        /// The response.
        response: CoapMessage,
    },

    /// A confirmable one-way message was acknowledged.
    Delivered {
        /// Exchange.
        id: ExchangeId,
    },

    /// The exchange failed. Deadline expiry is reported as
    /// [`Error::ConnectionLost`], a Reset from the peer as [`Error::Reset`].
    Failed {
        /// Exchange.
        id: ExchangeId,
        /// Why.
        error: Error,
    },
}

/// The result of [`ExchangeEngine::handle_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The message was consumed by the engine.
    Handled,

    /// A new request for the local server role.
    Request(CoapMessage),

    /// A message that matched no exchange.
    Unmatched(CoapMessage),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kind {
    Request,
    OneWay,
}

#[derive(Debug)]
struct Upload {
    szx: u8,
    offset: usize,
}

#[derive(Debug)]
struct Exchange {
    kind: Kind,
    remote: SocketAddr,
    request: CoapMessage,
    current: CoapMessage,
    state: ExchangeState,
    deadline: Instant,
    confirmable: bool,
    unacked: bool,
    retransmits: u32,
    timeout: Duration,
    next_retransmit: Option<Instant>,
    upload: Option<Upload>,
    download: Option<Block2Assembler>,
    collect_block2: bool,
    collected: Vec<u8>,
}

impl Exchange {
    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ExchangeState::AwaitingAck
                | ExchangeState::AwaitingResponse
                | ExchangeState::AwaitingMoreBlocks
        )
    }

    /// Builds the message for the current step of the exchange.
    fn next_message(&self) -> Result<CoapMessage, Error> {
        let mut msg = self.request.clone();

        if let Some(upload) = &self.upload {
            let size = 1usize << (upload.szx + 4);
            let total = self.request.payload.len();
            let end = (upload.offset + size).min(total);
            let more = end < total;
            let block = BlockInfo::new((upload.offset / size) as u32, more, upload.szx)
                .ok_or(Error::OutOfSpace)?;
            msg.payload = self.request.payload[upload.offset..end].to_vec();
            msg.set_option(option::BLOCK1, block);
            if upload.offset == 0 {
                msg.set_option(option::SIZE1, total as u32);
            }
        }

        if let Some(download) = &self.download {
            if download.offset() > 0 {
                msg.remove_option(OptionNumber::BLOCK1);
                msg.remove_option(OptionNumber::SIZE1);
                msg.payload.clear();
                msg.set_option(option::BLOCK2, download.next_block());
            }
        }

        Ok(msg)
    }
}

/// Correlates requests with responses, retransmits confirmable messages,
/// runs block-wise transfers and enforces `NSTART`.
///
/// The engine performs no I/O. Feed it received messages with
/// [`handle_message`](ExchangeEngine::handle_message) and the passage of time
/// with [`handle_timeout`](ExchangeEngine::handle_timeout); drain
/// [`poll_transmit`](ExchangeEngine::poll_transmit) and
/// [`poll_event`](ExchangeEngine::poll_event) after each call.
#[derive(Debug)]
pub struct ExchangeEngine {
    framing: Framing,
    params: TransParams,
    ids: IdGenerator,
    nstart: usize,
    offline: bool,
    next_id: u64,
    exchanges: BTreeMap<ExchangeId, Exchange>,
    recent_non: VecDeque<(SocketAddr, MsgId, ExchangeId)>,
    dedup: DedupCache,
    transmits: VecDeque<Transmit>,
    events: VecDeque<ExchangeEvent>,
}

const RECENT_NON_LEN: usize = 32;

impl ExchangeEngine {
    /// Creates an engine with its own randomly seeded id generator.
    pub fn new(framing: Framing, params: TransParams) -> ExchangeEngine {
        ExchangeEngine::with_ids(framing, params, IdGenerator::new())
    }

    /// Creates an engine using the given id generator.
    pub fn with_ids(framing: Framing, params: TransParams, ids: IdGenerator) -> ExchangeEngine {
        ExchangeEngine {
            framing,
            params,
            ids,
            nstart: params.nstart.max(1),
            offline: false,
            next_id: 1,
            exchanges: BTreeMap::new(),
            recent_non: VecDeque::new(),
            dedup: DedupCache::new(params.exchange_lifetime()),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// The framing this engine produces messages for.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// The transmission parameters.
    pub fn params(&self) -> &TransParams {
        &self.params
    }

    /// Allocates a fresh token.
    pub fn next_token(&mut self) -> MsgToken {
        self.ids.next_token()
    }

    fn alloc_id(&mut self) -> ExchangeId {
        let id = ExchangeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Queues a client request to `remote`. A token is generated if `msg`
    /// has none.
    pub fn start(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        mut msg: CoapMessage,
        opts: RequestOptions,
    ) -> ExchangeId {
        if msg.token.is_empty() {
            msg.token = self.ids.next_token();
        }

        let confirmable = self.framing == Framing::Udp && msg.msg_type != Some(MsgType::Non);
        match self.framing {
            Framing::Udp if confirmable => msg.msg_type = Some(MsgType::Con),
            Framing::Udp => (),
            Framing::Tcp => msg.msg_type = None,
        }

        let szx = opts.block1_szx.min(BlockInfo::SZX_MAX);
        let upload = if msg.payload.len() > (1usize << (szx + 4)) {
            Some(Upload { szx, offset: 0 })
        } else {
            None
        };

        let id = self.alloc_id();
        let exchange = Exchange {
            kind: Kind::Request,
            remote,
            current: msg.clone(),
            request: msg,
            state: ExchangeState::Pending,
            deadline: opts
                .deadline
                .unwrap_or(now + self.params.default_deadline()),
            confirmable,
            unacked: false,
            retransmits: 0,
            timeout: self.params.ack_timeout,
            next_retransmit: None,
            upload,
            download: None,
            collect_block2: opts.collect_block2,
            collected: Vec::new(),
        };

        debug!("exchange {} queued: {}", id, MessageDisplay(&exchange.request));
        self.exchanges.insert(id, exchange);
        self.pump(now);
        id
    }

    /// Sends a message that expects no response: a notification or a
    /// separate response. A confirmable one is retransmitted until
    /// acknowledged and reports [`ExchangeEvent::Delivered`].
    pub fn send_message(&mut self, now: Instant, remote: SocketAddr, mut msg: CoapMessage) -> ExchangeId {
        let id = self.alloc_id();

        if self.framing == Framing::Tcp {
            msg.msg_type = None;
            msg.msg_id = None;
            debug!("outbound {}", MessageDisplay(&msg));
            self.transmits.push_back(Transmit { remote, message: msg });
            return id;
        }

        if msg.msg_type.is_none() {
            msg.msg_type = Some(MsgType::Non);
        }

        if msg.msg_type == Some(MsgType::Con) {
            let exchange = Exchange {
                kind: Kind::OneWay,
                remote,
                current: msg.clone(),
                request: msg,
                state: ExchangeState::Pending,
                deadline: now + self.params.default_deadline(),
                confirmable: true,
                unacked: false,
                retransmits: 0,
                timeout: self.params.ack_timeout,
                next_retransmit: None,
                upload: None,
                download: None,
                collect_block2: false,
                collected: Vec::new(),
            };
            self.exchanges.insert(id, exchange);
            self.transmit_current(now, id, ExchangeState::AwaitingAck);
            return id;
        }

        let msg_id = self.ids.next_msg_id();
        msg.msg_id = Some(msg_id);
        self.recent_non.push_back((remote, msg_id, id));
        while self.recent_non.len() > RECENT_NON_LEN {
            self.recent_non.pop_front();
        }
        debug!("outbound {}", MessageDisplay(&msg));
        self.transmits.push_back(Transmit { remote, message: msg });
        id
    }

    /// Sends the response to a request previously returned as
    /// [`Inbound::Request`].
    ///
    /// On UDP an untyped response to a confirmable request is piggybacked on
    /// the ACK; to a non-confirmable one it is sent as NON. A response typed
    /// CON is a separate response and is tracked like
    /// [`send_message`](ExchangeEngine::send_message).
    pub fn send_response(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        request: &CoapMessage,
        mut response: CoapMessage,
    ) -> Option<ExchangeId> {
        response.token = request.token;

        if self.framing == Framing::Tcp {
            response.msg_type = None;
            response.msg_id = None;
            debug!("outbound {}", MessageDisplay(&response));
            self.transmits.push_back(Transmit { remote, message: response });
            return None;
        }

        if response.msg_type.is_none() {
            response.msg_type = match request.msg_type {
                Some(MsgType::Con) => Some(MsgType::Ack),
                _ => Some(MsgType::Non),
            };
        }

        match response.msg_type {
            Some(MsgType::Con) => return Some(self.send_message(now, remote, response)),
            Some(MsgType::Ack) => response.msg_id = request.msg_id,
            _ => response.msg_id = Some(self.ids.next_msg_id()),
        }

        if let Some(msg_id) = request.msg_id {
            self.dedup.answered(remote, msg_id, &response);
        }

        debug!("outbound {}", MessageDisplay(&response));
        self.transmits.push_back(Transmit { remote, message: response });
        None
    }

    /// Launches queued exchanges while `NSTART` permits.
    fn pump(&mut self, now: Instant) {
        if self.offline {
            return;
        }

        let pending: Vec<ExchangeId> = self
            .exchanges
            .iter()
            .filter(|(_, ex)| ex.state == ExchangeState::Pending)
            .map(|(id, _)| *id)
            .collect();

        for id in pending {
            let remote = match self.exchanges.get(&id) {
                Some(ex) => ex.remote,
                None => continue,
            };
            if self.in_flight(remote) < self.nstart {
                let state = if self.exchanges.get(&id).map(|ex| ex.confirmable) == Some(true) {
                    ExchangeState::AwaitingAck
                } else {
                    ExchangeState::AwaitingResponse
                };
                self.transmit_current(now, id, state);
            }
        }
    }

    /// Number of client requests to `remote` currently on the wire.
    pub fn in_flight(&self, remote: SocketAddr) -> usize {
        self.exchanges
            .values()
            .filter(|ex| ex.kind == Kind::Request && ex.remote == remote && ex.is_active())
            .count()
    }

    /// Number of exchanges waiting for a free `NSTART` slot.
    pub fn pending(&self) -> usize {
        self.exchanges
            .values()
            .filter(|ex| ex.state == ExchangeState::Pending)
            .count()
    }

    fn transmit_current(&mut self, now: Instant, id: ExchangeId, state: ExchangeState) {
        let ex = match self.exchanges.get_mut(&id) {
            Some(ex) => ex,
            None => return,
        };

        let mut msg = match ex.next_message() {
            Ok(msg) => msg,
            Err(error) => {
                self.fail(now, id, ExchangeState::Cancelled, error);
                return;
            }
        };

        if self.framing == Framing::Udp {
            msg.msg_id = Some(self.ids.next_msg_id());
        }

        if ex.confirmable {
            ex.unacked = true;
            ex.retransmits = 0;
            ex.timeout = self.params.initial_timeout(self.ids.rng());
            ex.next_retransmit = Some(now + ex.timeout);
        }

        ex.state = state;
        ex.current = msg.clone();
        debug!("exchange {} outbound {}", id, MessageDisplay(&msg));
        self.transmits.push_back(Transmit {
            remote: ex.remote,
            message: msg,
        });
    }

    fn fail(&mut self, now: Instant, id: ExchangeId, state: ExchangeState, error: Error) {
        if self.exchanges.remove(&id).is_some() {
            debug!("exchange {} {:?}: {:?}", id, state, error);
            self.events.push_back(ExchangeEvent::Failed { id, error });
        }
        self.pump(now);
    }

    fn complete(&mut self, now: Instant, id: ExchangeId, response: CoapMessage) {
        if self.exchanges.remove(&id).is_some() {
            debug!("exchange {} complete", id);
            self.events.push_back(ExchangeEvent::Response { id, response });
        }
        self.pump(now);
    }

    /// Processes a received message.
    pub fn handle_message(&mut self, now: Instant, remote: SocketAddr, msg: CoapMessage) -> Inbound {
        debug!("inbound {}", MessageDisplay(&msg));

        match self.framing {
            Framing::Udp => self.handle_udp(now, remote, msg),
            Framing::Tcp => self.handle_tcp(now, remote, msg),
        }
    }

    fn handle_udp(&mut self, now: Instant, remote: SocketAddr, msg: CoapMessage) -> Inbound {
        match msg.msg_type {
            Some(MsgType::Ack) | Some(MsgType::Rst) => return self.handle_ack_or_reset(now, remote, msg),
            None => return Inbound::Unmatched(msg),
            _ => (),
        }

        if msg.code.is_empty() {
            if msg.msg_type == Some(MsgType::Con) {
                // CoAP ping.
                self.transmits.push_back(Transmit {
                    remote,
                    message: msg.reset(),
                });
            }
            return Inbound::Handled;
        }

        if msg.code.is_method() {
            let msg_id = match msg.msg_id {
                Some(msg_id) => msg_id,
                None => return Inbound::Unmatched(msg),
            };
            return match self.dedup.check(now, remote, msg_id) {
                DedupVerdict::New => self.admit_request(now, remote, msg),
                DedupVerdict::Answered(response) => {
                    debug!("duplicate request {:04X}, resending response", msg_id);
                    self.transmits.push_back(Transmit {
                        remote,
                        message: response,
                    });
                    Inbound::Handled
                }
                DedupVerdict::InProgress => Inbound::Handled,
            };
        }

        if msg.code.is_response() {
            let id = self.match_response(remote, &msg);

            if msg.msg_type == Some(MsgType::Con) {
                let reply = if id.is_some() { msg.empty_ack() } else { msg.reset() };
                self.transmits.push_back(Transmit {
                    remote,
                    message: reply,
                });
            } else if id.is_none() {
                self.transmits.push_back(Transmit {
                    remote,
                    message: msg.reset(),
                });
            }

            return match id {
                Some(id) => {
                    if let Some(ex) = self.exchanges.get_mut(&id) {
                        ex.unacked = false;
                        ex.next_retransmit = None;
                    }
                    self.process_response(now, id, msg);
                    Inbound::Handled
                }
                None => Inbound::Unmatched(msg),
            };
        }

        warn!("ignoring {:?} over UDP", msg.code);
        Inbound::Handled
    }

    fn handle_ack_or_reset(&mut self, now: Instant, remote: SocketAddr, msg: CoapMessage) -> Inbound {
        let is_reset = msg.msg_type == Some(MsgType::Rst);

        let found = self
            .exchanges
            .iter()
            .find(|(_, ex)| ex.remote == remote && ex.unacked && ex.current.msg_id == msg.msg_id)
            .map(|(id, ex)| (*id, ex.kind));

        let (id, kind) = match found {
            Some(found) => found,
            None if is_reset => {
                let non = self
                    .recent_non
                    .iter()
                    .position(|(r, m, _)| *r == remote && Some(*m) == msg.msg_id);
                return match non.and_then(|i| self.recent_non.remove(i)) {
                    Some((_, _, id)) => {
                        self.events.push_back(ExchangeEvent::Failed {
                            id,
                            error: Error::Reset,
                        });
                        Inbound::Handled
                    }
                    None => Inbound::Unmatched(msg),
                };
            }
            None => return Inbound::Unmatched(msg),
        };

        if is_reset {
            self.fail(now, id, ExchangeState::Complete, Error::Reset);
            return Inbound::Handled;
        }

        if kind == Kind::OneWay {
            self.exchanges.remove(&id);
            self.events.push_back(ExchangeEvent::Delivered { id });
            self.pump(now);
            return Inbound::Handled;
        }

        if let Some(ex) = self.exchanges.get_mut(&id) {
            ex.unacked = false;
            ex.next_retransmit = None;
            if msg.code.is_empty() {
                if ex.state == ExchangeState::AwaitingAck {
                    ex.state = ExchangeState::AwaitingResponse;
                }
                return Inbound::Handled;
            }
        }

        self.process_response(now, id, msg);
        Inbound::Handled
    }

    fn handle_tcp(&mut self, now: Instant, remote: SocketAddr, msg: CoapMessage) -> Inbound {
        if msg.code.is_signal() {
            match msg.code {
                MsgCode::PING => {
                    let pong = CoapMessage::stream(MsgCode::PONG).with_token(msg.token);
                    self.transmits.push_back(Transmit {
                        remote,
                        message: pong,
                    });
                }
                MsgCode::RELEASE | MsgCode::ABORT => self.fail_all(now, Error::ConnectionLost),
                _ => (),
            }
            return Inbound::Handled;
        }

        if msg.code.is_empty() {
            return Inbound::Handled;
        }

        if msg.code.is_method() {
            return self.admit_request(now, remote, msg);
        }

        match self.match_response(remote, &msg) {
            Some(id) => {
                self.process_response(now, id, msg);
                Inbound::Handled
            }
            None => Inbound::Unmatched(msg),
        }
    }

    /// Rejects requests carrying critical options this library does not know.
    fn admit_request(&mut self, now: Instant, remote: SocketAddr, msg: CoapMessage) -> Inbound {
        let unknown = msg
            .options
            .iter()
            .map(|opt| opt.number)
            .find(|number| number.is_critical() && !number.is_recognized());

        match unknown {
            Some(number) => {
                warn!("rejecting request with unrecognized option {}", number);
                let response = msg.response(MsgCode::BAD_OPTION);
                self.send_response(now, remote, &msg, response);
                Inbound::Handled
            }
            None => Inbound::Request(msg),
        }
    }

    fn match_response(&self, remote: SocketAddr, msg: &CoapMessage) -> Option<ExchangeId> {
        self.exchanges
            .iter()
            .find(|(_, ex)| {
                ex.kind == Kind::Request
                    && ex.is_active()
                    && ex.remote == remote
                    && ex.request.token == msg.token
            })
            .map(|(id, _)| *id)
    }

    fn process_response(&mut self, now: Instant, id: ExchangeId, msg: CoapMessage) {
        let ex = match self.exchanges.get_mut(&id) {
            Some(ex) => ex,
            None => return,
        };

        let next_state = if ex.confirmable {
            ExchangeState::AwaitingAck
        } else {
            ExchangeState::AwaitingResponse
        };

        if let Some(upload) = ex.upload.as_mut() {
            let size = 1usize << (upload.szx + 4);
            let server_szx = msg.block1().map(|b| b.szx()).unwrap_or(upload.szx);

            if msg.code == MsgCode::CONTINUE {
                upload.offset += size;
                upload.szx = upload.szx.min(server_szx);
                if upload.offset >= ex.request.payload.len() {
                    self.fail(now, id, ExchangeState::Cancelled, Error::InvalidMessage);
                } else {
                    self.transmit_current(now, id, next_state);
                }
                return;
            }

            if msg.code == MsgCode::REQUEST_ENTITY_TOO_LARGE
                && upload.offset == 0
                && server_szx < upload.szx
            {
                upload.szx = server_szx;
                self.transmit_current(now, id, next_state);
                return;
            }

            ex.upload = None;
        }

        let block2 = msg.block2();
        let more = block2.map(|b| b.more_flag()).unwrap_or(false);

        if ex.collect_block2 && msg.code.is_success() && (more || ex.download.is_some()) {
            let assembler = ex.download.get_or_insert_with(|| {
                Block2Assembler::new(block2.map(|b| b.szx()).unwrap_or(BlockInfo::SZX_MAX))
            });

            match assembler.feed(&msg) {
                Ok(Block2Step::More(_)) => {
                    ex.collected.extend_from_slice(&msg.payload);
                    self.transmit_current(now, id, ExchangeState::AwaitingMoreBlocks);
                }
                Ok(Block2Step::Done) => {
                    ex.collected.extend_from_slice(&msg.payload);
                    let mut response = msg;
                    response.payload = std::mem::take(&mut ex.collected);
                    response.remove_option(OptionNumber::BLOCK2);
                    self.complete(now, id, response);
                }
                Err(error) => self.fail(now, id, ExchangeState::Cancelled, error),
            }
            return;
        }

        self.complete(now, id, msg);
    }

    /// The earliest instant at which [`handle_timeout`](ExchangeEngine::handle_timeout)
    /// has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.exchanges
            .values()
            .flat_map(|ex| {
                let retransmit = if self.offline { None } else { ex.next_retransmit };
                std::iter::once(ex.deadline).chain(retransmit)
            })
            .min()
    }

    /// Retransmits, times out exchanges and expires the duplicate cache.
    pub fn handle_timeout(&mut self, now: Instant) {
        let ids: Vec<ExchangeId> = self.exchanges.keys().copied().collect();

        for id in ids {
            let ex = match self.exchanges.get_mut(&id) {
                Some(ex) => ex,
                None => continue,
            };

            if now >= ex.deadline {
                self.fail(now, id, ExchangeState::TimedOut, Error::ConnectionLost);
                continue;
            }

            if self.offline || !ex.unacked {
                continue;
            }

            match ex.next_retransmit {
                Some(at) if at <= now => (),
                _ => continue,
            }

            // The peer never acknowledged; it is unreachable.
            if ex.retransmits >= self.params.max_retransmit {
                self.fail(now, id, ExchangeState::TimedOut, Error::ConnectionLost);
                continue;
            }

            ex.retransmits += 1;
            ex.timeout *= 2;
            ex.next_retransmit = Some(now + ex.timeout);
            debug!(
                "exchange {} retransmit {}/{}",
                id, ex.retransmits, self.params.max_retransmit
            );
            self.transmits.push_back(Transmit {
                remote: ex.remote,
                message: ex.current.clone(),
            });
        }

        self.dedup.expire(now);
        self.pump(now);
    }

    /// Aborts an exchange. No event is reported for it.
    pub fn cancel(&mut self, now: Instant, id: ExchangeId) -> bool {
        let removed = self.exchanges.remove(&id).is_some();
        if removed {
            debug!("exchange {} cancelled", id);
        }
        self.pump(now);
        removed
    }

    /// Fails every exchange with `error`, e.g. when the connection is lost.
    pub fn fail_all(&mut self, now: Instant, error: Error) {
        let ids: Vec<ExchangeId> = self.exchanges.keys().copied().collect();
        for id in ids {
            self.fail(now, id, ExchangeState::Cancelled, error);
        }
    }

    /// The state of a live exchange; `None` once it has finished.
    pub fn state(&self, id: ExchangeId) -> Option<ExchangeState> {
        self.exchanges.get(&id).map(|ex| ex.state)
    }

    /// Sets the maximum number of outstanding requests per peer.
    pub fn set_nstart(&mut self, now: Instant, nstart: usize) {
        self.nstart = nstart.max(1);
        self.pump(now);
    }

    /// While offline nothing is launched or retransmitted; deadlines keep running.
    pub fn set_offline(&mut self, now: Instant, offline: bool) {
        if self.offline == offline {
            return;
        }
        self.offline = offline;

        if !offline {
            for ex in self.exchanges.values_mut() {
                if ex.unacked {
                    ex.next_retransmit = Some(now);
                }
            }
            self.pump(now);
        }
    }

    /// Returns true while offline.
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Next message to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next exchange event.
    pub fn poll_event(&mut self) -> Option<ExchangeEvent> {
        self.events.pop_front()
    }
}
