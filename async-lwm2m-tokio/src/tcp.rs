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
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

async fn connect_from(
    local: Option<SocketAddr>,
    remote: SocketAddr,
) -> std::io::Result<TcpStream> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    if let Some(local) = local {
        socket.bind(local)?;
    }
    socket.connect(remote).await
}

/// A [`TransportStream`] over a Tokio TCP connection.
///
/// [`fake_close`](TransportStream::fake_close) drops the connection; the
/// next send or receive after [`fake_unclose`](TransportStream::fake_unclose)
/// reconnects from the same local port when the operating system allows it.
#[derive(Debug, Default)]
pub struct TokioTcpTransport {
    stream: Option<TcpStream>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    fake_closed: bool,
    reopen: bool,
}

impl TokioTcpTransport {
    /// Creates an unconnected transport.
    pub fn new() -> TokioTcpTransport {
        TokioTcpTransport::default()
    }

    async fn open(&mut self, remote: SocketAddr) -> Result<(), Error> {
        self.stream = None;
        let previous = self.local.filter(|local| local.is_ipv4() == remote.is_ipv4());
        let stream = match previous {
            Some(local) => match connect_from(Some(local), remote).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("tcp: cannot reuse {}: {}", local, e);
                    connect_from(None, remote).await?
                }
            },
            None => connect_from(None, remote).await?,
        };
        stream.set_nodelay(true)?;
        self.local = Some(stream.local_addr()?);
        self.peer = Some(remote);
        self.stream = Some(stream);
        self.fake_closed = false;
        self.reopen = false;
        debug!("tcp {:?} connected to {}", self.local, remote);
        Ok(())
    }

    async fn ensure_open(&mut self) -> Result<(), Error> {
        if self.reopen {
            let peer = self.peer.ok_or(Error::NotConnected)?;
            self.open(peer).await?;
        }
        if self.fake_closed {
            return Err(Error::ConnectionLost);
        }
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream, Error> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }
}

/// Accepts incoming TCP connections as [`TokioTcpTransport`]s.
#[derive(Debug)]
pub struct TokioTcpListener {
    listener: TcpListener,
}

impl TokioTcpListener {
    /// Listens on `port` on every IPv4 address.
    pub async fn listen(port: u16) -> Result<TokioTcpListener, Error> {
        let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await?;
        debug!("tcp listening on {}", listener.local_addr()?);
        Ok(TokioTcpListener { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next connection.
    pub async fn accept(&self) -> Result<TokioTcpTransport, Error> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("tcp accepted {}", peer);
        Ok(TokioTcpTransport {
            local: Some(stream.local_addr()?),
            peer: Some(peer),
            stream: Some(stream),
            fake_closed: false,
            reopen: false,
        })
    }
}

impl TransportStream for TokioTcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.local.ok_or(Error::NotConnected)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn connect(&mut self, remote: SocketAddr) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.open(remote))
    }

    fn send<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.ensure_open().await?;
            self.stream()?.write_all(buf).await?;
            Ok(())
        })
    }

    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            self.ensure_open().await?;
            let stream = self.stream()?;
            let received = match deadline {
                None => stream.read(buf).await?,
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline.into(), stream.read(buf)).await {
                        Ok(result) => result?,
                        Err(_) => return Err(Error::ResponseTimeout),
                    }
                }
            };
            if received == 0 {
                return Err(Error::ConnectionLost);
            }
            Ok(received)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.shutdown().await;
            }
            self.fake_closed = false;
            self.reopen = false;
            Ok(())
        })
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let peer = self.peer.ok_or(Error::NotConnected)?;
            self.open(peer).await
        })
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.stream.is_some() && !self.fake_closed {
                return Ok(());
            }
            let peer = self.peer.ok_or(Error::NotConnected)?;
            self.open(peer).await
        })
    }

    fn fake_close(&mut self) -> Result<(), Error> {
        self.stream = None;
        self.fake_closed = true;
        self.reopen = false;
        Ok(())
    }

    fn fake_unclose(&mut self) -> Result<(), Error> {
        if self.fake_closed {
            self.reopen = true;
        }
        Ok(())
    }
}
