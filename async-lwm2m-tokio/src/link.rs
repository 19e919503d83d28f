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

use async_lwm2m::message::codec;
use async_lwm2m::message::{CoapMessage, Framing, MessageDisplay};
use async_lwm2m::observe::ObserverId;
use async_lwm2m::transport::{TransportKind, TransportStream};
use async_lwm2m::Error;
use std::net::SocketAddr;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

const RECV_BUF_LEN: usize = 2048;

/// Instructions for the task that owns a server's transport.
#[derive(Debug)]
pub enum LinkCommand {
    /// Encode and send a message.
    Send(CoapMessage),
    /// Stop exchanging packets with the peer, keeping the local address.
    FakeClose,
    /// Undo [`LinkCommand::FakeClose`].
    FakeUnclose,
    /// Tear the connection down and build it up again.
    Reset,
    /// Close the transport and end the task.
    Close,
}

/// A server connection running on its own task.
///
/// Decoded messages are forwarded to the channel given to
/// [`Link::spawn`], tagged with the server they came from.
#[derive(Debug)]
pub struct Link {
    ssid: ObserverId,
    kind: TransportKind,
    remote: SocketAddr,
    commands: UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

impl Link {
    /// Moves `transport` onto a new task.
    pub fn spawn(
        ssid: ObserverId,
        transport: Box<dyn TransportStream>,
        remote: SocketAddr,
        inbound: UnboundedSender<(ObserverId, CoapMessage)>,
    ) -> Link {
        let kind = transport.kind();
        let (commands, rx) = unbounded_channel();
        let task = tokio::spawn(run(ssid, transport, rx, inbound));
        Link {
            ssid,
            kind,
            remote,
            commands,
            task,
        }
    }

    /// The server this link belongs to.
    pub fn ssid(&self) -> ObserverId {
        self.ssid
    }

    /// Transport kind.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Peer address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queues a command; fails only once the task has ended.
    pub fn command(&self, command: LinkCommand) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::ConnectionLost)
    }

    /// Closes the transport and waits for the task to finish.
    pub async fn close(self) {
        let _ = self.commands.send(LinkCommand::Close);
        if let Err(e) = self.task.await {
            warn!("link {:?}: task failed: {}", self.ssid, e);
        }
    }
}

struct Deframer {
    framing: Framing,
    pending: Vec<u8>,
}

impl Deframer {
    fn push(&mut self, bytes: &[u8], mut deliver: impl FnMut(CoapMessage)) {
        if self.framing == Framing::Udp {
            match codec::decode(bytes, self.framing) {
                Ok(msg) => deliver(msg),
                Err(e) => warn!("dropping malformed datagram ({:?}): {:02x?}", e, bytes),
            }
            return;
        }

        self.pending.extend_from_slice(bytes);
        while let Some(len) = codec::tcp_frame_len(&self.pending) {
            if self.pending.len() < len {
                break;
            }
            let frame: Vec<u8> = self.pending.drain(..len).collect();
            match codec::decode(&frame, self.framing) {
                Ok(msg) => deliver(msg),
                Err(e) => warn!("dropping malformed frame ({:?})", e),
            }
        }
    }
}

async fn run(
    ssid: ObserverId,
    mut transport: Box<dyn TransportStream>,
    mut commands: UnboundedReceiver<LinkCommand>,
    inbound: UnboundedSender<(ObserverId, CoapMessage)>,
) {
    let framing = transport.kind().framing();
    let mut deframer = Deframer {
        framing,
        pending: Vec::new(),
    };
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut receiving = true;
    let mut fake_closed = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(LinkCommand::Close) => break,

                Some(LinkCommand::Send(msg)) => {
                    if !receiving && !fake_closed {
                        deframer.pending.clear();
                        match transport.reset().await {
                            Ok(()) => receiving = true,
                            Err(e) => debug!("link {:?}: reconnect failed: {:?}", ssid, e),
                        }
                    }
                    let bytes = match codec::encode(&msg, framing) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("link {:?}: cannot encode {}: {:?}", ssid, MessageDisplay(&msg), e);
                            continue;
                        }
                    };
                    trace!("link {:?}: sending {}", ssid, MessageDisplay(&msg));
                    if let Err(e) = transport.send(&bytes).await {
                        debug!("link {:?}: send failed: {:?}", ssid, e);
                    }
                }

                Some(LinkCommand::FakeClose) => {
                    if let Err(e) = transport.fake_close() {
                        warn!("link {:?}: fake close failed: {:?}", ssid, e);
                    }
                    deframer.pending.clear();
                    fake_closed = true;
                }

                Some(LinkCommand::FakeUnclose) => {
                    if let Err(e) = transport.fake_unclose() {
                        warn!("link {:?}: reopen failed: {:?}", ssid, e);
                    }
                    fake_closed = false;
                    receiving = true;
                }

                Some(LinkCommand::Reset) => {
                    deframer.pending.clear();
                    fake_closed = false;
                    match transport.reset().await {
                        Ok(()) => receiving = true,
                        Err(e) => {
                            warn!("link {:?}: reset failed: {:?}", ssid, e);
                            receiving = false;
                        }
                    }
                }
            },

            received = transport.recv(&mut buf, None), if receiving => match received {
                Ok(len) => deframer.push(&buf[..len], |msg| {
                    let _ = inbound.send((ssid, msg));
                }),
                Err(e) => {
                    if !fake_closed {
                        warn!("link {:?}: receive failed: {:?}", ssid, e);
                    }
                    deframer.pending.clear();
                    receiving = false;
                }
            },
        }
    }

    if let Err(e) = transport.close().await {
        debug!("link {:?}: close failed: {:?}", ssid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_lwm2m::message::MsgCode;

    #[test]
    fn deframes_split_tcp_frames() {
        let msg = CoapMessage::stream(MsgCode::CONTENT).with_payload(&b"0023C7"[..]);
        let mut bytes = codec::encode(&msg, Framing::Tcp).unwrap();
        bytes.extend_from_slice(&bytes.clone());

        let mut deframer = Deframer {
            framing: Framing::Tcp,
            pending: Vec::new(),
        };
        let mut out = Vec::new();
        deframer.push(&bytes[..3], |m| out.push(m));
        assert!(out.is_empty());
        deframer.push(&bytes[3..], |m| out.push(m));
        assert_eq!(2, out.len());
        assert_eq!(b"0023C7".to_vec(), out[1].payload);
        assert!(deframer.pending.is_empty());
    }
}
