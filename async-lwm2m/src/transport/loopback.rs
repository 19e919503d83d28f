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
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::prelude::*;

/// An in-memory [`TransportStream`]. [`LoopbackTransport::pair`] returns two
/// connected ends; whatever one end sends, the other receives.
#[derive(Debug)]
pub struct LoopbackTransport {
    kind: TransportKind,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    sender: Option<UnboundedSender<Vec<u8>>>,
    receiver: UnboundedReceiver<Vec<u8>>,

    // Stream bytes that did not fit into the caller's buffer.
    leftover: Vec<u8>,
    fake_closed: bool,
}

impl LoopbackTransport {
    /// Creates a connected pair: a client end bound to `127.0.0.1:56830` and a
    /// server end bound to the default port of `kind`.
    pub fn pair(kind: TransportKind) -> (LoopbackTransport, LoopbackTransport) {
        let client_addr = SocketAddr::from(([127, 0, 0, 1], 56830));
        let server_addr = SocketAddr::from(([127, 0, 0, 1], kind.default_port()));
        let (to_server, from_client) = unbounded();
        let (to_client, from_server) = unbounded();

        let client = LoopbackTransport {
            kind,
            local: client_addr,
            peer: Some(server_addr),
            sender: Some(to_server),
            receiver: from_server,
            leftover: Vec::new(),
            fake_closed: false,
        };

        let server = LoopbackTransport {
            kind,
            local: server_addr,
            peer: Some(client_addr),
            sender: Some(to_client),
            receiver: from_client,
            leftover: Vec::new(),
            fake_closed: false,
        };

        (client, server)
    }

    /// Returns true while [`TransportStream::fake_close`] is in effect.
    pub fn is_fake_closed(&self) -> bool {
        self.fake_closed
    }

    async fn recv_inner(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.kind.is_stream() && !self.leftover.is_empty() {
            let len = buf.len().min(self.leftover.len());
            buf[..len].copy_from_slice(&self.leftover[..len]);
            self.leftover.drain(..len);
            return Ok(len);
        }

        loop {
            let packet = self.receiver.next().await.ok_or(Error::ConnectionLost)?;

            if self.fake_closed {
                debug!("loopback {}: dropping {} bytes while closed", self.local, packet.len());
                continue;
            }

            if self.kind.is_stream() {
                let len = buf.len().min(packet.len());
                buf[..len].copy_from_slice(&packet[..len]);
                self.leftover.extend_from_slice(&packet[len..]);
                return Ok(len);
            }

            if packet.len() > buf.len() {
                return Err(Error::OutOfSpace);
            }
            buf[..packet.len()].copy_from_slice(&packet);
            return Ok(packet.len());
        }
    }
}

impl TransportStream for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn connect(&mut self, remote: SocketAddr) -> BoxFuture<'_, Result<(), Error>> {
        self.peer = Some(remote);
        Box::pin(future::ready(Ok(())))
    }

    fn send<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        let result = match &self.sender {
            None => Err(Error::NotConnected),
            // Sent towards the unreachable sentinel; lost.
            Some(_) if self.fake_closed => Ok(()),
            Some(sender) => sender
                .unbounded_send(buf.to_vec())
                .map_err(|_| Error::ConnectionLost),
        };
        Box::pin(future::ready(result))
    }

    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { with_deadline(self.recv_inner(buf), deadline).await })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        if let Some(sender) = self.sender.take() {
            sender.close_channel();
        }
        Box::pin(future::ready(Ok(())))
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        self.leftover.clear();
        self.fake_closed = false;
        Box::pin(future::ready(Ok(())))
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(future::ready(if self.sender.is_some() {
            Ok(())
        } else {
            Err(Error::ConnectionLost)
        }))
    }

    fn fake_close(&mut self) -> Result<(), Error> {
        self.fake_closed = true;
        Ok(())
    }

    fn fake_unclose(&mut self) -> Result<(), Error> {
        self.fake_closed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::time::Duration;

    #[test]
    fn datagrams_cross_over() {
        let (mut a, mut b) = LoopbackTransport::pair(TransportKind::Udp);
        block_on(async {
            a.send(b"hello").await.unwrap();
            let mut buf = [0u8; 16];
            let len = b.recv(&mut buf, None).await.unwrap();
            assert_eq!(b"hello", &buf[..len]);
        });
        assert_eq!(a.peer_addr(), Some(b.local_addr().unwrap()));
    }

    #[test]
    fn fake_close_drops_incoming_and_keeps_address() {
        let (mut a, mut b) = LoopbackTransport::pair(TransportKind::Udp);
        let local = b.local_addr().unwrap();
        block_on(async {
            b.fake_close().unwrap();
            a.send(b"lost").await.unwrap();
            let mut buf = [0u8; 16];
            let deadline = Instant::now() + Duration::from_millis(20);
            assert_eq!(Err(Error::ResponseTimeout), b.recv(&mut buf, Some(deadline)).await);

            b.fake_unclose().unwrap();
            a.send(b"kept").await.unwrap();
            let len = b.recv(&mut buf, None).await.unwrap();
            assert_eq!(b"kept", &buf[..len]);
        });
        assert_eq!(local, b.local_addr().unwrap());
    }

    #[test]
    fn stream_splits_reads() {
        let (mut a, mut b) = LoopbackTransport::pair(TransportKind::Tcp);
        block_on(async {
            a.send(b"abcdef").await.unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(4, b.recv(&mut buf, None).await.unwrap());
            assert_eq!(2, b.recv(&mut buf, None).await.unwrap());
            assert_eq!(b"ef", &buf[..2]);

            a.close().await.unwrap();
            assert_eq!(Err(Error::NotConnected), a.send(b"x").await);
            assert_eq!(Err(Error::ConnectionLost), b.recv(&mut buf, None).await);
        });
    }
}
