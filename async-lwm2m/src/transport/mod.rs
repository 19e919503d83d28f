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

//! Transport abstraction: datagram and stream carriers for CoAP messages.
//!
//! A [`TransportStream`] moves opaque bytes. It does not interpret CoAP; the
//! framing is chosen by the [`exchange::Endpoint`](crate::exchange::Endpoint)
//! from [`TransportKind::framing`].

use super::*;
use futures::future::{self, BoxFuture, Either};
use futures_timer::Delay;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

mod loopback;
pub use loopback::LoopbackTransport;

mod secure;
pub use secure::*;

mod uri;
pub use uri::CoapUri;

/// The four transport variants a LwM2M server URI can select.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plain UDP, `coap://`.
    Udp,

    /// DTLS over UDP, `coaps://`.
    Dtls,

    /// Plain TCP, `coap+tcp://`.
    Tcp,

    /// TLS over TCP, `coaps+tcp://`.
    Tls,
}

impl TransportKind {
    /// The CoAP framing used on this transport.
    pub fn framing(self) -> Framing {
        match self {
            TransportKind::Udp | TransportKind::Dtls => Framing::Udp,
            TransportKind::Tcp | TransportKind::Tls => Framing::Tcp,
        }
    }

    /// True for DTLS and TLS.
    pub fn is_secure(self) -> bool {
        matches!(self, TransportKind::Dtls | TransportKind::Tls)
    }

    /// True for the byte-stream transports, TCP and TLS.
    pub fn is_stream(self) -> bool {
        self.framing() == Framing::Tcp
    }

    /// Maps a URI scheme onto a transport kind.
    pub fn from_scheme(scheme: &str) -> Option<TransportKind> {
        match scheme {
            URI_SCHEME_COAP => Some(TransportKind::Udp),
            URI_SCHEME_COAPS => Some(TransportKind::Dtls),
            URI_SCHEME_COAP_TCP => Some(TransportKind::Tcp),
            URI_SCHEME_COAPS_TCP => Some(TransportKind::Tls),
            _ => None,
        }
    }

    /// The URI scheme of this transport kind.
    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::Udp => URI_SCHEME_COAP,
            TransportKind::Dtls => URI_SCHEME_COAPS,
            TransportKind::Tcp => URI_SCHEME_COAP_TCP,
            TransportKind::Tls => URI_SCHEME_COAPS_TCP,
        }
    }

    /// The IANA-assigned default port.
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Udp => DEFAULT_PORT_COAP_UDP,
            TransportKind::Dtls => DEFAULT_PORT_COAP_DTLS,
            TransportKind::Tcp => DEFAULT_PORT_COAP_TCP,
            TransportKind::Tls => DEFAULT_PORT_COAP_TLS,
        }
    }
}

/// A connected CoAP transport.
///
/// Datagram transports deliver exactly one datagram per [`recv`](TransportStream::recv);
/// stream transports deliver whatever bytes are available.
pub trait TransportStream: Send {
    /// The kind of this transport.
    fn kind(&self) -> TransportKind;

    /// The local address the underlying socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr, Error>;

    /// The remote address, if connected.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Connects to `remote`.
    fn connect(&mut self, remote: SocketAddr) -> BoxFuture<'_, Result<(), Error>>;

    /// Performs the security handshake. A no-op for plain transports.
    fn handshake(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(future::ready(Ok(())))
    }

    /// Sends one datagram or a run of stream bytes.
    fn send<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), Error>>;

    /// Receives into `buf`, failing with [`Error::ResponseTimeout`] once
    /// `deadline` has passed.
    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<usize, Error>>;

    /// Closes the connection. Further sends fail with [`Error::NotConnected`].
    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Drops any session state, as if the peer had reset the connection,
    /// and reconnects to the same remote.
    fn reset(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Re-establishes the connection, resuming the security session when one
    /// was saved.
    fn resume(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Stops receiving without releasing the local port. Incoming traffic is
    /// refused by the operating system.
    fn fake_close(&mut self) -> Result<(), Error>;

    /// Undoes [`fake_close`](TransportStream::fake_close), keeping the local port.
    fn fake_unclose(&mut self) -> Result<(), Error>;
}

impl<T: TransportStream + ?Sized> TransportStream for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }

    fn connect(&mut self, remote: SocketAddr) -> BoxFuture<'_, Result<(), Error>> {
        (**self).connect(remote)
    }

    fn handshake(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        (**self).handshake()
    }

    fn send<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        (**self).send(buf)
    }

    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        (**self).recv(buf, deadline)
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        (**self).close()
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        (**self).reset()
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        (**self).resume()
    }

    fn fake_close(&mut self) -> Result<(), Error> {
        (**self).fake_close()
    }

    fn fake_unclose(&mut self) -> Result<(), Error> {
        (**self).fake_unclose()
    }
}

/// Runs `fut` until it completes or `deadline` passes, in which case
/// [`Error::ResponseTimeout`] is returned.
///
/// A future that is already complete wins over an expired deadline.
pub async fn with_deadline<T, F>(fut: F, deadline: Option<Instant>) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let deadline = match deadline {
        Some(deadline) => deadline,
        None => return fut.await,
    };

    let delay = Delay::new(deadline.saturating_duration_since(Instant::now()));
    futures::pin_mut!(fut);

    match future::select(fut, delay).await {
        Either::Left((result, _)) => result,
        Either::Right(((), _)) => Err(Error::ResponseTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::time::Duration;

    #[test]
    fn schemes() {
        assert_eq!(Some(TransportKind::Tls), TransportKind::from_scheme("coaps+tcp"));
        assert_eq!(None, TransportKind::from_scheme("http"));
        assert_eq!(5684, TransportKind::Dtls.default_port());
        assert_eq!(Framing::Tcp, TransportKind::Tls.framing());
    }

    #[test]
    fn deadline_expires() {
        let deadline = Instant::now() + Duration::from_millis(10);
        let result: Result<(), Error> = block_on(with_deadline(future::pending(), Some(deadline)));
        assert_eq!(Err(Error::ResponseTimeout), result);
    }

    #[test]
    fn ready_future_beats_expired_deadline() {
        let deadline = Instant::now() - Duration::from_millis(10);
        let result = block_on(with_deadline(future::ready(Ok(5)), Some(deadline)));
        assert_eq!(Ok(5), result);
    }
}
