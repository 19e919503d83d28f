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
use std::time::Duration;

/// The next thing a [`SecuritySession`] wants to happen during a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send this flight, then wait for the peer's answer.
    Send(Vec<u8>),

    /// Wait for a flight from the peer without sending anything.
    Wait,

    /// Send this final flight (possibly empty); the session is established.
    Done(Vec<u8>),
}

/// The cryptographic half of a DTLS or TLS connection, as an opaque
/// sans-IO state machine. [`SecureStream`] moves its records.
pub trait SecuritySession: Send {
    /// Begins a handshake. When `resume` is true a saved session is replayed.
    fn start(&mut self, resume: bool) -> Result<HandshakeStep, Error>;

    /// Consumes a flight received from the peer.
    fn handle_flight(&mut self, flight: &[u8]) -> Result<HandshakeStep, Error>;

    /// Protects an application record.
    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Verifies and decrypts an application record.
    fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, Error>;

    /// True if a session ticket or PSK identity was saved for resumption.
    fn can_resume(&self) -> bool;

    /// Discards saved session state.
    fn forget(&mut self);
}

/// A [`TransportStream`] adaptor turning a plain UDP or TCP transport into a
/// DTLS or TLS one, given a [`SecuritySession`].
///
/// On stream transports each record is preceded by its length as a
/// big-endian `u16`.
#[derive(Debug)]
pub struct SecureStream<T, S> {
    inner: T,
    session: S,
    established: bool,
    handshake_timeout: Duration,
    record_buf: Vec<u8>,
    plain_leftover: Vec<u8>,
}

const MAX_RECORD_LEN: usize = 16 * 1024 + 256;

impl<T: TransportStream, S: SecuritySession> SecureStream<T, S> {
    /// Wraps `inner`. No handshake is performed until
    /// [`TransportStream::handshake`] is called.
    pub fn new(inner: T, session: S) -> SecureStream<T, S> {
        SecureStream {
            inner,
            session,
            established: false,
            handshake_timeout: Duration::from_secs(10),
            record_buf: Vec::new(),
            plain_leftover: Vec::new(),
        }
    }

    /// Sets the time a whole handshake may take.
    pub fn set_handshake_timeout(&mut self, timeout: Duration) {
        self.handshake_timeout = timeout;
    }

    /// Returns true once a handshake has completed.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// The wrapped transport.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// The security session.
    pub fn session(&self) -> &S {
        &self.session
    }

    async fn write_record(&mut self, record: &[u8]) -> Result<(), Error> {
        if self.inner.kind().is_stream() {
            let len = u16::try_from(record.len()).map_err(|_| Error::OutOfSpace)?;
            let mut framed = Vec::with_capacity(record.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(record);
            self.inner.send(&framed).await
        } else {
            self.inner.send(record).await
        }
    }

    async fn read_record(&mut self, deadline: Option<Instant>) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; MAX_RECORD_LEN];

        if !self.inner.kind().is_stream() {
            let len = self.inner.recv(&mut buf, deadline).await?;
            buf.truncate(len);
            return Ok(buf);
        }

        loop {
            if self.record_buf.len() >= 2 {
                let len = u16::from_be_bytes([self.record_buf[0], self.record_buf[1]]) as usize;
                if self.record_buf.len() >= 2 + len {
                    let record = self.record_buf[2..2 + len].to_vec();
                    self.record_buf.drain(..2 + len);
                    return Ok(record);
                }
            }

            let len = self.inner.recv(&mut buf, deadline).await?;
            self.record_buf.extend_from_slice(&buf[..len]);
        }
    }

    async fn run_handshake(&mut self, resume: bool) -> Result<(), Error> {
        self.established = false;
        self.record_buf.clear();
        self.plain_leftover.clear();

        let deadline = Some(Instant::now() + self.handshake_timeout);
        let mut step = self.session.start(resume)?;

        loop {
            step = match step {
                HandshakeStep::Send(flight) => {
                    self.write_record(&flight).await?;
                    let answer = self.read_record(deadline).await?;
                    self.session.handle_flight(&answer)?
                }
                HandshakeStep::Wait => {
                    let flight = self.read_record(deadline).await?;
                    self.session.handle_flight(&flight)?
                }
                HandshakeStep::Done(flight) => {
                    if !flight.is_empty() {
                        self.write_record(&flight).await?;
                    }
                    self.established = true;
                    return Ok(());
                }
            };
        }
    }

    async fn handshake_or_lost(&mut self, resume: bool) -> Result<(), Error> {
        self.run_handshake(resume).await.map_err(|e| {
            warn!("{:?} handshake failed: {:?}", self.inner.kind(), e);
            Error::ConnectionLost
        })
    }

    async fn recv_plain(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, Error> {
        if !self.established {
            return Err(Error::NotConnected);
        }

        if self.plain_leftover.is_empty() {
            let record = self.read_record(deadline).await?;
            self.plain_leftover = self.session.open(&record)?;
        }

        let len = buf.len().min(self.plain_leftover.len());
        if !self.inner.kind().is_stream() && len < self.plain_leftover.len() {
            self.plain_leftover.clear();
            return Err(Error::OutOfSpace);
        }

        buf[..len].copy_from_slice(&self.plain_leftover[..len]);
        self.plain_leftover.drain(..len);
        Ok(len)
    }
}

impl<T: TransportStream, S: SecuritySession> TransportStream for SecureStream<T, S> {
    fn kind(&self) -> TransportKind {
        match self.inner.kind() {
            TransportKind::Udp | TransportKind::Dtls => TransportKind::Dtls,
            TransportKind::Tcp | TransportKind::Tls => TransportKind::Tls,
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn connect(&mut self, remote: SocketAddr) -> BoxFuture<'_, Result<(), Error>> {
        self.established = false;
        self.inner.connect(remote)
    }

    fn handshake(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.handshake_or_lost(false))
    }

    fn send<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if !self.established {
                return Err(Error::NotConnected);
            }
            let record = self.session.seal(buf)?;
            self.write_record(&record).await
        })
    }

    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(self.recv_plain(buf, deadline))
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        self.established = false;
        self.inner.close()
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.session.forget();
            self.inner.reset().await?;
            self.handshake_or_lost(false).await
        })
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.inner.resume().await?;
            let resume = self.session.can_resume();
            self.handshake_or_lost(resume).await
        })
    }

    fn fake_close(&mut self) -> Result<(), Error> {
        self.inner.fake_close()
    }

    fn fake_unclose(&mut self) -> Result<(), Error> {
        self.inner.fake_unclose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    /// A toy session: fixed handshake flights and XOR "encryption".
    #[derive(Debug, Default)]
    struct XorSession {
        server: bool,
        saved: bool,
        resumed: bool,
        fail: bool,
    }

    impl SecuritySession for XorSession {
        fn start(&mut self, resume: bool) -> Result<HandshakeStep, Error> {
            self.resumed = resume;
            if self.server {
                Ok(HandshakeStep::Wait)
            } else if resume {
                Ok(HandshakeStep::Send(b"RESUME".to_vec()))
            } else {
                Ok(HandshakeStep::Send(b"HELLO".to_vec()))
            }
        }

        fn handle_flight(&mut self, flight: &[u8]) -> Result<HandshakeStep, Error> {
            match (self.server, flight) {
                (true, b"HELLO") | (true, b"RESUME") if !self.fail => {
                    Ok(HandshakeStep::Send(b"WELCOME".to_vec()))
                }
                (true, b"FIN") => Ok(HandshakeStep::Done(vec![])),
                (false, b"WELCOME") => {
                    self.saved = true;
                    Ok(HandshakeStep::Done(b"FIN".to_vec()))
                }
                _ => Err(Error::InvalidMessage),
            }
        }

        fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(plaintext.iter().map(|b| b ^ 0x5A).collect())
        }

        fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, Error> {
            self.seal(record)
        }

        fn can_resume(&self) -> bool {
            self.saved
        }

        fn forget(&mut self) {
            self.saved = false;
        }
    }

    fn secure_pair(
        kind: TransportKind,
    ) -> (
        SecureStream<LoopbackTransport, XorSession>,
        SecureStream<LoopbackTransport, XorSession>,
    ) {
        let (a, b) = LoopbackTransport::pair(kind);
        let server = XorSession {
            server: true,
            ..Default::default()
        };
        (
            SecureStream::new(a, XorSession::default()),
            SecureStream::new(b, server),
        )
    }

    #[test]
    fn tls_handshake_and_records() {
        let (mut client, mut server) = secure_pair(TransportKind::Tcp);
        assert_eq!(TransportKind::Tls, client.kind());

        block_on(async {
            let (c, s) = futures::join!(client.handshake(), server.handshake());
            assert_eq!(Ok(()), c);
            assert_eq!(Ok(()), s);

            client.send(b"ping").await.unwrap();
            let mut buf = [0u8; 16];
            let len = server.recv(&mut buf, None).await.unwrap();
            assert_eq!(b"ping", &buf[..len]);
        });
        assert!(client.session().can_resume());
    }

    #[test]
    fn dtls_resume_replays_session() {
        let (mut client, mut server) = secure_pair(TransportKind::Udp);
        assert_eq!(TransportKind::Dtls, client.kind());

        block_on(async {
            let (c, _) = futures::join!(client.handshake(), server.handshake());
            assert_eq!(Ok(()), c);
            let (c, _) = futures::join!(client.resume(), server.handshake());
            assert_eq!(Ok(()), c);
        });
        assert!(client.session().resumed);
        assert!(!server.session().resumed);
    }

    #[test]
    fn handshake_failure_is_connection_lost() {
        let (mut client, mut server) = secure_pair(TransportKind::Udp);
        server.session.fail = true;
        client.set_handshake_timeout(Duration::from_millis(50));

        block_on(async {
            let (c, s) = futures::join!(client.handshake(), server.handshake());
            assert_eq!(Err(Error::ConnectionLost), s);
            assert_eq!(Err(Error::ConnectionLost), c);
        });
        assert!(!client.is_established());
    }

    #[test]
    fn send_before_handshake() {
        let (mut client, _server) = secure_pair(TransportKind::Udp);
        assert_eq!(Err(Error::NotConnected), block_on(client.send(b"x")));
    }
}
