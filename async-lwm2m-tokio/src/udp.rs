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

use async_lwm2m::transport::{TransportKind, TransportStream};
use async_lwm2m::Error;
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;
use tokio::net::UdpSocket;

/// Where a fake-closed socket points: a loopback port nothing listens on,
/// so datagrams from the real peer are refused by the operating system.
fn unreachable_for(local: &SocketAddr) -> SocketAddr {
    match local {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::LOCALHOST, 1)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::LOCALHOST, 1)),
    }
}

/// The wildcard address of the same family as `remote`, any port.
pub fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[derive(Debug, Copy, Clone)]
struct Reuse {
    address: bool,
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    port: bool,
}

impl Reuse {
    const ALL: Reuse = Reuse {
        address: true,
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        port: true,
    };

    const NONE: Reuse = Reuse {
        address: false,
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        port: false,
    };

    fn get(socket: &SockRef<'_>) -> std::io::Result<Reuse> {
        Ok(Reuse {
            address: socket.reuse_address()?,
            #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
            port: socket.reuse_port()?,
        })
    }

    fn set(self, socket: &SockRef<'_>) -> std::io::Result<()> {
        socket.set_reuse_address(self.address)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(self.port)?;
        Ok(())
    }
}

fn new_socket(local: SocketAddr, reuse: Option<Reuse>) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(reuse) = reuse {
        reuse.set(&SockRef::from(&socket))?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    Ok(socket)
}

/// A [`TransportStream`] over a Tokio UDP socket.
///
/// The local port survives [`reset`](TransportStream::reset) and
/// [`fake_close`](TransportStream::fake_close), so a server keeps seeing
/// the same client address.
#[derive(Debug)]
pub struct TokioUdpTransport {
    socket: Option<UdpSocket>,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    saved_peer: Option<SocketAddr>,
    fake_closed: bool,
}

impl TokioUdpTransport {
    /// Binds a socket to `local`. Must be called within a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use async_lwm2m_tokio::TokioUdpTransport;
    /// # fn main() -> Result<(), async_lwm2m::Error> {
    /// let transport = TokioUdpTransport::bind("[::]:0".parse().unwrap())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn bind(local: SocketAddr) -> Result<TokioUdpTransport, Error> {
        let socket = UdpSocket::from_std(new_socket(local, None)?.into())?;
        let local = socket.local_addr()?;
        debug!("udp bound to {}", local);
        Ok(TokioUdpTransport {
            socket: Some(socket),
            local,
            peer: None,
            saved_peer: None,
            fake_closed: false,
        })
    }

    /// Binds to `port` on every IPv4 address, with no peer yet.
    pub fn listen(port: u16) -> Result<TokioUdpTransport, Error> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Waits for the first datagram and connects to its sender.
    ///
    /// The datagram stays queued for the next `recv`.
    pub async fn accept(&mut self, deadline: Option<Instant>) -> Result<SocketAddr, Error> {
        let socket = self.socket()?;
        let mut probe = [0u8; 2048];
        let peeked = socket.peek_from(&mut probe);
        let (_, from) = match deadline {
            None => peeked.await?,
            Some(deadline) => match tokio::time::timeout_at(deadline.into(), peeked).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::ResponseTimeout),
            },
        };
        socket.connect(from).await?;
        self.peer = Some(from);
        self.saved_peer = None;
        self.fake_closed = false;
        debug!("udp {}: accepted {}", self.local, from);
        Ok(from)
    }

    /// True while [`fake_close`](TransportStream::fake_close) is in effect.
    pub fn is_fake_closed(&self) -> bool {
        self.fake_closed
    }

    fn socket(&self) -> Result<&UdpSocket, Error> {
        self.socket.as_ref().ok_or(Error::NotConnected)
    }

    /// Swaps the socket for a fresh one bound to the same local address.
    ///
    /// Both sockets share the port for a moment, so the ephemeral port
    /// allocator never sees it free.
    pub fn rebind(&mut self) -> Result<(), Error> {
        let original = match &self.socket {
            Some(old) => {
                let old = SockRef::from(old);
                let original = Reuse::get(&old)?;
                Reuse::ALL.set(&old)?;
                original
            }
            None => Reuse::NONE,
        };

        let fresh = new_socket(self.local, Some(Reuse::ALL))?;
        self.socket = None;
        original.set(&SockRef::from(&fresh))?;
        self.socket = Some(UdpSocket::from_std(fresh.into())?);
        debug!("udp {}: rebound", self.local);
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), Error> {
        self.rebind()?;
        self.fake_closed = false;
        self.saved_peer = None;
        if let Some(peer) = self.peer {
            SockRef::from(self.socket()?).connect(&peer.into())?;
        }
        Ok(())
    }
}

impl TransportStream for TokioUdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn connect(&mut self, remote: SocketAddr) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.socket()?.connect(remote).await?;
            self.peer = Some(remote);
            self.saved_peer = None;
            self.fake_closed = false;
            Ok(())
        })
    }

    fn send<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if self.peer.is_none() {
                return Err(Error::NotConnected);
            }
            let socket = self.socket()?;
            match socket.send(buf).await {
                Ok(_) => Ok(()),
                // An ICMP error from an earlier datagram; this one went out.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    socket.send(buf).await?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let socket = self.socket()?;
            let received = async {
                loop {
                    match socket.recv(buf).await {
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                            debug!("udp {}: peer unreachable", self.local);
                        }
                        other => return other,
                    }
                }
            };
            match deadline {
                None => Ok(received.await?),
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline.into(), received).await {
                        Ok(result) => Ok(result?),
                        Err(_) => Err(Error::ResponseTimeout),
                    }
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        self.socket = None;
        self.peer = None;
        self.saved_peer = None;
        self.fake_closed = false;
        Box::pin(futures::future::ready(Ok(())))
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        let result = self.reconnect();
        Box::pin(futures::future::ready(result))
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        let result = if self.socket.is_some() && !self.fake_closed {
            Ok(())
        } else {
            self.reconnect()
        };
        Box::pin(futures::future::ready(result))
    }

    fn fake_close(&mut self) -> Result<(), Error> {
        let unreachable = unreachable_for(&self.local);
        SockRef::from(self.socket()?).connect(&unreachable.into())?;
        if !self.fake_closed {
            self.saved_peer = self.peer;
            self.fake_closed = true;
        }
        debug!("udp {}: fake closed", self.local);
        Ok(())
    }

    fn fake_unclose(&mut self) -> Result<(), Error> {
        if !self.fake_closed {
            return Ok(());
        }
        // Connecting to the loopback pinned the source address, so the saved
        // peer is restored on a fresh socket with the same port.
        if let Some(peer) = self.saved_peer.take() {
            self.peer = Some(peer);
        }
        self.reconnect()?;
        debug!("udp {}: reopened", self.local);
        Ok(())
    }
}
