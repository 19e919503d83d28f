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
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

const RECV_BUF_LEN: usize = 2048;

/// Drives an [`ExchangeEngine`] over a [`TransportStream`], offering an
/// `async` request/response interface for both the client and server roles.
#[derive(Debug)]
pub struct Endpoint<T> {
    transport: T,
    engine: ExchangeEngine,
    stream_buf: Vec<u8>,
    requests: VecDeque<(SocketAddr, CoapMessage)>,
    awaited: HashSet<ExchangeId>,
    results: HashMap<ExchangeId, Result<CoapMessage, Error>>,
    events: VecDeque<ExchangeEvent>,
}

impl<T: TransportStream> Endpoint<T> {
    /// Creates an endpoint whose framing follows the transport kind.
    pub fn new(transport: T, params: TransParams) -> Endpoint<T> {
        let engine = ExchangeEngine::new(transport.kind().framing(), params);
        Endpoint::with_engine(transport, engine)
    }

    /// Creates an endpoint around an existing engine.
    pub fn with_engine(transport: T, engine: ExchangeEngine) -> Endpoint<T> {
        Endpoint {
            transport,
            engine,
            stream_buf: Vec::new(),
            requests: VecDeque::new(),
            awaited: HashSet::new(),
            results: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport, for reconnects and fake closes.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The engine.
    pub fn engine(&self) -> &ExchangeEngine {
        &self.engine
    }

    /// Mutable access to the engine.
    pub fn engine_mut(&mut self) -> &mut ExchangeEngine {
        &mut self.engine
    }

    /// Replaces the transport, dropping buffered stream bytes. Exchanges in
    /// flight are kept and will be retransmitted on the new transport.
    pub fn replace_transport(&mut self, transport: T) -> T {
        self.stream_buf.clear();
        std::mem::replace(&mut self.transport, transport)
    }

    fn remote(&self) -> SocketAddr {
        self.transport
            .peer_addr()
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    /// Queues a request and returns its id; the response is collected with
    /// [`wait_for`](Endpoint::wait_for) or [`take_result`](Endpoint::take_result).
    pub fn start_request(&mut self, msg: CoapMessage, opts: RequestOptions) -> ExchangeId {
        let remote = self.remote();
        let id = self.engine.start(Instant::now(), remote, msg, opts);
        self.awaited.insert(id);
        id
    }

    /// Sends a request and waits for its (reassembled) response.
    pub async fn send_request(
        &mut self,
        msg: CoapMessage,
        opts: RequestOptions,
    ) -> Result<CoapMessage, Error> {
        let id = self.start_request(msg, opts);
        self.wait_for(id).await
    }

    /// Runs the endpoint until the exchange `id` finishes.
    pub async fn wait_for(&mut self, id: ExchangeId) -> Result<CoapMessage, Error> {
        loop {
            if let Some(result) = self.take_result(id) {
                return result;
            }
            if self.engine.state(id).is_none() {
                return Err(Error::Cancelled);
            }
            self.step(None).await?;
        }
    }

    /// Takes the outcome of a finished request started with
    /// [`start_request`](Endpoint::start_request).
    pub fn take_result(&mut self, id: ExchangeId) -> Option<Result<CoapMessage, Error>> {
        let result = self.results.remove(&id);
        if result.is_some() {
            self.awaited.remove(&id);
        }
        result
    }

    /// Waits for the next inbound request.
    pub async fn receive_request(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<(SocketAddr, CoapMessage), Error> {
        loop {
            if let Some(request) = self.requests.pop_front() {
                return Ok(request);
            }
            self.step(deadline).await?;
        }
    }

    /// Takes an already received request without waiting.
    pub fn take_request(&mut self) -> Option<(SocketAddr, CoapMessage)> {
        self.requests.pop_front()
    }

    /// Answers `request`.
    pub async fn send_response(
        &mut self,
        request: &CoapMessage,
        response: CoapMessage,
    ) -> Result<Option<ExchangeId>, Error> {
        let remote = self.remote();
        let id = self
            .engine
            .send_response(Instant::now(), remote, request, response);
        self.flush().await?;
        Ok(id)
    }

    /// Sends a notification or other one-way message.
    pub async fn send_message(&mut self, msg: CoapMessage) -> Result<ExchangeId, Error> {
        let remote = self.remote();
        let id = self.engine.send_message(Instant::now(), remote, msg);
        self.flush().await?;
        Ok(id)
    }

    /// Cancels an exchange.
    pub fn cancel(&mut self, id: ExchangeId) -> bool {
        self.awaited.remove(&id);
        self.results.remove(&id);
        self.engine.cancel(Instant::now(), id)
    }

    /// Sets `NSTART`.
    pub fn set_nstart(&mut self, nstart: usize) {
        self.engine.set_nstart(Instant::now(), nstart);
    }

    /// Events of one-way messages (deliveries and resets).
    pub fn poll_event(&mut self) -> Option<ExchangeEvent> {
        self.events.pop_front()
    }

    /// Encodes and sends everything the engine has queued.
    pub async fn flush(&mut self) -> Result<(), Error> {
        let framing = self.engine.framing();
        while let Some(transmit) = self.engine.poll_transmit() {
            let bytes = codec::encode(&transmit.message, framing)?;
            self.transport.send(&bytes).await?;
        }
        Ok(())
    }

    /// Sends pending messages, then waits for one inbound message, the
    /// engine's next timer or `deadline`, whichever comes first.
    ///
    /// Returns [`Error::ResponseTimeout`] once `deadline` has passed.
    pub async fn step(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        self.flush().await?;

        let wake = match (self.engine.poll_timeout(), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut buf = [0u8; RECV_BUF_LEN];
        match self.transport.recv(&mut buf, wake).await {
            Ok(len) => self.handle_bytes(&buf[..len]),
            Err(Error::ResponseTimeout) => {
                let now = Instant::now();
                self.engine.handle_timeout(now);
                self.collect_events();
                self.flush().await?;
                if deadline.map(|d| now >= d).unwrap_or(false) {
                    return Err(Error::ResponseTimeout);
                }
            }
            Err(error) => {
                warn!("transport failure: {:?}", error);
                self.engine.fail_all(Instant::now(), error);
                self.collect_events();
                return Err(error);
            }
        }

        self.collect_events();
        self.flush().await
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        let framing = self.engine.framing();
        let remote = self.remote();

        if framing == Framing::Udp {
            match codec::decode(bytes, framing) {
                Ok(msg) => self.handle_message(remote, msg),
                Err(e) => warn!("dropping malformed datagram ({:?}): {:02x?}", e, bytes),
            }
            return;
        }

        self.stream_buf.extend_from_slice(bytes);
        while let Some(len) = codec::tcp_frame_len(&self.stream_buf) {
            if self.stream_buf.len() < len {
                break;
            }
            let frame: Vec<u8> = self.stream_buf.drain(..len).collect();
            match codec::decode(&frame, framing) {
                Ok(msg) => self.handle_message(remote, msg),
                Err(e) => warn!("dropping malformed frame ({:?})", e),
            }
        }
    }

    fn handle_message(&mut self, remote: SocketAddr, msg: CoapMessage) {
        match self.engine.handle_message(Instant::now(), remote, msg) {
            Inbound::Request(request) => self.requests.push_back((remote, request)),
            Inbound::Unmatched(msg) => debug!("unmatched {}", MessageDisplay(&msg)),
            Inbound::Handled => (),
        }
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            match event {
                ExchangeEvent::Response { id, response } if self.awaited.contains(&id) => {
                    self.results.insert(id, Ok(response));
                }
                ExchangeEvent::Failed { id, error } if self.awaited.contains(&id) => {
                    self.results.insert(id, Err(error));
                }
                other => self.events.push_back(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use futures::executor::block_on;
    use std::time::Duration;

    fn pair(kind: TransportKind, params: TransParams) -> (Endpoint<LoopbackTransport>, Endpoint<LoopbackTransport>) {
        let (a, b) = LoopbackTransport::pair(kind);
        (Endpoint::new(a, params), Endpoint::new(b, params))
    }

    #[test]
    fn request_response_over_tcp() {
        let (mut client, mut server) = pair(TransportKind::Tcp, TransParams::default());
        let big = vec![0x33u8; 600];

        block_on(async {
            let serve = async {
                let (_, req) = server.receive_request(None).await.unwrap();
                assert_eq!(vec!["5", "0", "0"], req.uri_path());
                let resp = req.response(MsgCode::CHANGED).with_payload(big.clone());
                server.send_response(&req, resp).await.unwrap();
            };
            let request = CoapMessage::request(MsgCode::PUT)
                .with_uri_path("5/0/0")
                .with_payload(&b"x"[..]);
            let (resp, ()) = futures::join!(client.send_request(request, RequestOptions::default()), serve);
            assert_eq!(big, resp.unwrap().payload);
        });
    }

    #[test]
    fn receive_times_out() {
        let (_client, mut server) = pair(TransportKind::Udp, TransParams::default());
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(
            Err(Error::ResponseTimeout),
            block_on(server.receive_request(Some(deadline)))
        );
    }

    #[test]
    fn retransmission_recovers_lost_request() {
        let params = TransParams {
            ack_timeout: Duration::from_millis(20),
            ack_random_factor: 1.0,
            ..TransParams::default()
        };
        let (mut client, mut server) = pair(TransportKind::Udp, params);

        block_on(async {
            let serve = async {
                server.transport_mut().fake_close().unwrap();
                let deadline = Instant::now() + Duration::from_millis(30);
                assert_eq!(
                    Err(Error::ResponseTimeout),
                    server.receive_request(Some(deadline)).await
                );
                server.transport_mut().fake_unclose().unwrap();

                let (_, req) = server.receive_request(None).await.unwrap();
                server
                    .send_response(&req, req.response(MsgCode::CONTENT))
                    .await
                    .unwrap();
            };
            let request = CoapMessage::request(MsgCode::GET).with_uri_path("3/0/7");
            let (resp, ()) = futures::join!(client.send_request(request, RequestOptions::default()), serve);
            assert_eq!(MsgCode::CONTENT, resp.unwrap().code);
        });
    }

    #[test]
    fn closed_peer_fails_request() {
        let (mut client, mut server) = pair(TransportKind::Tcp, TransParams::default());
        block_on(async {
            server.transport_mut().close().await.unwrap();
            let request = CoapMessage::request(MsgCode::GET).with_uri_path("1");
            assert_eq!(
                Err(Error::ConnectionLost),
                client.send_request(request, RequestOptions::default()).await
            );
        });
    }
}
