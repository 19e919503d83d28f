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
use crate::update::package::{build_v1, ForcedError, MAGIC_FW};
use crate::update::persist::MemoryStore;
use crate::update::sink::MemorySink;
use crate::update::{
    DownloadFailure, FirmwareUpdate, PackageInstaller, FW_PACKAGE, FW_PACKAGE_URI, FW_UPDATE,
};

const LOCATION: &str = "5a3f";

fn server_addr() -> SocketAddr {
    "127.0.0.1:5683".parse().unwrap()
}

fn secs(start: Instant, secs: u64) -> Instant {
    start + Duration::from_secs(secs)
}

/// A client registered with one server, and a minimal server driving it.
struct Rig {
    client: Lwm2mClient,
    ssid: ObserverId,
    start: Instant,
    mid: u16,
}

impl Rig {
    fn new(config: ClientConfig) -> Rig {
        let fw = FirmwareUpdate::new(
            Box::new(MemorySink::new()),
            Box::new(MemoryStore::new()),
            Box::new(PackageInstaller::new()),
        );
        let objects =
            Objects::new(Device::new(config.device.clone(), "U")).with_object(Box::new(fw));
        let mut client = Lwm2mClient::new(config, objects);

        let start = Instant::now();
        let ssid = client.add_server(start, server_addr(), TransportKind::Udp);
        let mut rig = Rig {
            client,
            ssid,
            start,
            mid: 0x100,
        };

        let sent = rig.transmits();
        assert_eq!(1, sent.len());
        assert_eq!(MsgCode::POST, sent[0].code);
        assert_eq!(vec![RD_PATH], sent[0].uri_path());
        rig.reply(start, &sent[0], MsgCode::CREATED);
        assert_eq!(Some(ClientEvent::Registered(ssid)), rig.client.poll_event());
        rig
    }

    fn transmits(&mut self) -> Vec<CoapMessage> {
        std::iter::from_fn(|| self.client.poll_transmit())
            .map(|(ssid, t)| {
                assert_eq!(self.ssid, ssid);
                assert_eq!(server_addr(), t.remote);
                t.message
            })
            .collect()
    }

    fn reply(&mut self, now: Instant, request: &CoapMessage, code: MsgCode) {
        let mut response = request.response(code);
        if code == MsgCode::CREATED {
            response.add_option(option::LOCATION_PATH, RD_PATH.to_string());
            response.add_option(option::LOCATION_PATH, LOCATION.to_string());
        }
        self.client.handle_message(now, self.ssid, response);
    }

    /// Answers everything the client sends the way a well-behaved server
    /// would, and returns what was sent.
    fn settle(&mut self, now: Instant) -> Vec<CoapMessage> {
        let mut seen = Vec::new();
        loop {
            let sent = self.transmits();
            if sent.is_empty() {
                return seen;
            }
            for msg in sent {
                if msg.msg_type == Some(MsgType::Con) {
                    if msg.code.is_method() {
                        let code = match (msg.code, msg.uri_path().len()) {
                            (MsgCode::POST, 1) if msg.uri_path()[0] == RD_PATH => MsgCode::CREATED,
                            (MsgCode::DELETE, _) => MsgCode::DELETED,
                            _ => MsgCode::CHANGED,
                        };
                        self.reply(now, &msg, code);
                    } else {
                        let ack = CoapMessage::new(MsgType::Ack, MsgCode::EMPTY)
                            .with_msg_id(msg.msg_id.unwrap());
                        self.client.handle_message(now, self.ssid, ack);
                    }
                }
                seen.push(msg);
            }
        }
    }

    fn request(&mut self, code: MsgCode, path: &str) -> CoapMessage {
        self.mid += 1;
        CoapMessage::request(code)
            .with_msg_id(self.mid)
            .with_token(MsgToken::new(&self.mid.to_be_bytes()).unwrap())
            .with_uri_path(path)
    }

    /// Sends `request` and returns the piggybacked response.
    fn exchange(&mut self, now: Instant, request: CoapMessage) -> CoapMessage {
        let token = request.token;
        self.client.handle_message(now, self.ssid, request);
        let sent = self.transmits();
        let position = sent
            .iter()
            .position(|m| m.token == token && m.msg_type == Some(MsgType::Ack))
            .expect("no response");
        sent[position].clone()
    }

    fn events(&mut self) -> Vec<ClientEvent> {
        std::iter::from_fn(|| self.client.poll_event()).collect()
    }
}

fn notifications(sent: &[CoapMessage], token: MsgToken) -> Vec<&CoapMessage> {
    sent.iter()
        .filter(|m| m.token == token && m.observe().is_some())
        .collect()
}

#[test]
fn read_and_discover() {
    let mut rig = Rig::new(ClientConfig::default());
    let now = rig.start;

    let req = rig.request(MsgCode::GET, "/3/0/0");
    let resp = rig.exchange(now, req);
    assert_eq!(MsgCode::CONTENT, resp.code);
    assert_eq!(b"0023C7".to_vec(), resp.payload);

    let req = rig.request(MsgCode::GET, "/3/0/42");
    assert_eq!(MsgCode::NOT_FOUND, rig.exchange(now, req).code);

    let req = rig.request(MsgCode::DELETE, "/3/0");
    assert_eq!(MsgCode::METHOD_NOT_ALLOWED, rig.exchange(now, req).code);

    let req = rig
        .request(MsgCode::PUT, "/3/0/7")
        .with_uri_query("pmin=1")
        .with_uri_query("pmax=5");
    assert_eq!(MsgCode::CHANGED, rig.exchange(now, req).code);

    let req = rig
        .request(MsgCode::GET, "/3/0")
        .with_option(option::ACCEPT, ContentFormat::APPLICATION_LINK_FORMAT);
    let resp = rig.exchange(now, req);
    assert_eq!(MsgCode::CONTENT, resp.code);
    assert_eq!(
        Some(ContentFormat::APPLICATION_LINK_FORMAT),
        resp.content_format()
    );
    let links = String::from_utf8(resp.payload).unwrap();
    assert!(links.starts_with("</3/0>,</3/0/0>,"), "{}", links);
    assert!(links.contains("</3/0/7>;dim=1;pmin=1;pmax=5"), "{}", links);
}

#[test]
fn pmax_repeats_notifications() {
    let mut rig = Rig::new(ClientConfig::default());
    let now = rig.start;

    let req = rig
        .request(MsgCode::PUT, "/3/0/7")
        .with_uri_query("pmin=0")
        .with_uri_query("pmax=2");
    assert_eq!(MsgCode::CHANGED, rig.exchange(now, req).code);

    let req = rig
        .request(MsgCode::GET, "/3/0/7")
        .with_option(option::OBSERVE, OBSERVE_REGISTER);
    let token = req.token;
    let resp = rig.exchange(now, req);
    assert_eq!(MsgCode::CONTENT, resp.code);
    assert_eq!(Some(0), resp.observe());

    for i in 1..=3 {
        let at = secs(now, 2 * i);
        assert!(rig.client.poll_timeout().unwrap() <= at);
        rig.client.handle_timeout(at);
        let sent = rig.settle(at);
        assert_eq!(1, notifications(&sent, token).len(), "round {}", i);
    }

    let req = rig
        .request(MsgCode::GET, "/3/0/7")
        .with_option(option::OBSERVE, OBSERVE_DEREGISTER);
    assert_eq!(MsgCode::CONTENT, rig.exchange(secs(now, 7), req).code);
    rig.client.handle_timeout(secs(now, 8));
    assert!(notifications(&rig.settle(secs(now, 8)), token).is_empty());
}

#[test]
fn offline_stores_newest_notifications() {
    let config = ClientConfig {
        stored_notification_limit: 3,
        ..ClientConfig::default()
    };
    let mut rig = Rig::new(config);
    let now = rig.start;

    let req = rig
        .request(MsgCode::GET, "/3/0/7")
        .with_option(option::OBSERVE, OBSERVE_REGISTER);
    let token = req.token;
    rig.exchange(now, req);

    rig.client.enter_offline(now, TransportFamily::All);
    assert!(rig.client.servers()[0].offline);
    for i in 1..=5 {
        rig.client.set_voltage(secs(now, i), 0, 3800 + i as i64);
        assert!(rig.transmits().is_empty());
    }

    rig.client.exit_offline(secs(now, 10), TransportFamily::Udp);
    let sent = rig.settle(secs(now, 10));
    assert!(sent
        .iter()
        .any(|m| m.code == MsgCode::POST && m.uri_path() == vec![RD_PATH, LOCATION]));
    assert_eq!(3, notifications(&sent, token).len());
}

#[test]
fn offline_ignores_other_families() {
    let mut rig = Rig::new(ClientConfig::default());
    let now = rig.start;
    rig.client.enter_offline(now, TransportFamily::Tcp);
    assert!(!rig.client.servers()[0].offline);
    assert!(!rig.client.observations().is_offline(rig.ssid));
}

#[test]
fn lifetime_lapse_while_offline_ends_observations() {
    let config = ClientConfig {
        lifetime: 60,
        notification_storing: false,
        ..ClientConfig::default()
    };
    let mut rig = Rig::new(config);
    let now = rig.start;

    let req = rig
        .request(MsgCode::GET, "/3/0/7")
        .with_option(option::OBSERVE, OBSERVE_REGISTER);
    let token = req.token;
    rig.exchange(now, req);

    rig.client.enter_offline(now, TransportFamily::All);
    rig.client.set_voltage(secs(now, 5), 0, 3900);
    assert!(rig.client.poll_timeout().unwrap() <= secs(now, 60));

    rig.client.handle_timeout(secs(now, 59));
    assert!(!rig.client.observations().is_empty());
    rig.client.handle_timeout(secs(now, 60));
    assert!(rig.client.observations().is_empty());

    rig.client.exit_offline(secs(now, 61), TransportFamily::All);
    let sent = rig.settle(secs(now, 61));
    assert!(sent
        .iter()
        .any(|m| m.code == MsgCode::POST && m.uri_path() == vec![RD_PATH, LOCATION]));
    assert!(notifications(&sent, token).is_empty());

    rig.client.set_voltage(secs(now, 62), 0, 4000);
    assert!(notifications(&rig.settle(secs(now, 62)), token).is_empty());
}

fn drain(client: &mut Lwm2mClient) -> Vec<(ObserverId, CoapMessage)> {
    std::iter::from_fn(|| client.poll_transmit())
        .map(|(ssid, t)| (ssid, t.message))
        .collect()
}

#[test]
fn offline_server_keeps_notifications_while_another_stays_live() {
    let config = ClientConfig::default();
    let objects = Objects::new(Device::new(config.device.clone(), "U"));
    let mut client = Lwm2mClient::new(config, objects);
    let now = Instant::now();
    let live = client.add_server(now, server_addr(), TransportKind::Udp);
    let parked = client.add_server(now, "127.0.0.1:5684".parse().unwrap(), TransportKind::Tcp);

    let registers = drain(&mut client);
    assert_eq!(2, registers.len());
    for (ssid, register) in registers {
        let created = register
            .response(MsgCode::CREATED)
            .with_option(option::LOCATION_PATH, RD_PATH.to_string())
            .with_option(option::LOCATION_PATH, LOCATION.to_string());
        client.handle_message(now, ssid, created);
    }

    let live_token = MsgToken::new(&[1]).unwrap();
    let parked_token = MsgToken::new(&[2]).unwrap();
    let observe = |msg: CoapMessage, token: MsgToken| {
        msg.with_token(token)
            .with_uri_path("/3/0/7")
            .with_option(option::OBSERVE, OBSERVE_REGISTER)
    };
    client.handle_message(
        now,
        live,
        observe(CoapMessage::request(MsgCode::GET).with_msg_id(0x200), live_token),
    );
    client.handle_message(now, parked, observe(CoapMessage::stream(MsgCode::GET), parked_token));
    drain(&mut client);
    assert_eq!(2, client.observations().len());

    client.enter_offline(now, TransportFamily::Tcp);
    assert!(client.observations().is_offline(parked));
    assert!(!client.observations().is_offline(live));

    client.set_voltage(secs(now, 1), 0, 3900);
    let sent = drain(&mut client);
    assert!(sent.iter().all(|(ssid, _)| *ssid == live));
    assert_eq!(
        1,
        sent.iter()
            .filter(|(_, m)| m.token == live_token && m.observe().is_some())
            .count()
    );
    assert_eq!(1, client.observations().stored_len());

    client.exit_offline(secs(now, 2), TransportFamily::Tcp);
    let sent = drain(&mut client);
    let delivered: Vec<&CoapMessage> = sent
        .iter()
        .filter(|(ssid, m)| *ssid == parked && m.token == parked_token && m.observe().is_some())
        .map(|(_, m)| m)
        .collect();
    assert_eq!(1, delivered.len());
    assert_eq!(0, client.observations().stored_len());
}

#[test]
fn block_push_then_update() {
    let mut rig = Rig::new(ClientConfig::default());
    let now = rig.start;

    let package = build_v1(&MAGIC_FW, ForcedError::None, b"#!/bin/sh\necho updated\n");
    let path = format!("/5/0/{}", FW_PACKAGE);
    let blocks: Vec<&[u8]> = package.chunks(16).collect();
    for (num, chunk) in blocks.iter().enumerate() {
        let more = num + 1 < blocks.len();
        let block = BlockInfo::new(num as u32, more, 0).unwrap();
        let req = rig
            .request(MsgCode::PUT, &path)
            .with_option(option::BLOCK1, block)
            .with_payload(chunk.to_vec());
        let resp = rig.exchange(now, req);
        let expected = if more {
            MsgCode::CONTINUE
        } else {
            MsgCode::CHANGED
        };
        assert_eq!(expected, resp.code, "block {}", num);
        assert_eq!(Some(block), resp.block1());
    }

    let req = rig.request(MsgCode::GET, "/5/0/3");
    assert_eq!(b"2".to_vec(), rig.exchange(now, req).payload);

    let req = rig.request(MsgCode::PUT, &format!("/5/0/{}", FW_UPDATE));
    assert_eq!(MsgCode::METHOD_NOT_ALLOWED, rig.exchange(now, req).code);

    let req = rig.request(MsgCode::POST, &format!("/5/0/{}", FW_UPDATE));
    assert_eq!(MsgCode::CHANGED, rig.exchange(now, req).code);
    assert!(rig.events().contains(&ClientEvent::Restart));
}

#[test]
fn failed_update_reregisters() {
    let config = ClientConfig {
        lifetime: 60,
        ..ClientConfig::default()
    };
    let mut rig = Rig::new(config);
    let due = secs(rig.start, 30);
    assert!(rig.client.poll_timeout().unwrap() <= due);

    rig.client.handle_timeout(due);
    let sent = rig.transmits();
    assert_eq!(1, sent.len());
    assert_eq!(vec![RD_PATH, LOCATION], sent[0].uri_path());

    rig.reply(due, &sent[0], MsgCode::NOT_FOUND);
    let sent = rig.transmits();
    assert_eq!(1, sent.len());
    assert_eq!(vec![RD_PATH], sent[0].uri_path());
    rig.reply(due, &sent[0], MsgCode::CREATED);
    assert_eq!(vec![ClientEvent::Registered(rig.ssid)], rig.events());
}

#[test]
fn registration_retried_after_failure() {
    let config = ClientConfig {
        register_retry_secs: 3,
        ..ClientConfig::default()
    };
    let mut rig = Rig::new(config);
    let now = rig.start;

    rig.client.reconnect(now);
    let sent = rig.transmits();
    assert_eq!(vec![RD_PATH, LOCATION], sent[0].uri_path());
    rig.reply(now, &sent[0], MsgCode::NOT_FOUND);

    let sent = rig.transmits();
    rig.reply(now, &sent[0], MsgCode::FORBIDDEN);
    assert_eq!(vec![ClientEvent::RegistrationFailed(rig.ssid)], rig.events());
    assert!(rig.client.poll_timeout().unwrap() <= secs(now, 3));

    rig.client.handle_timeout(secs(now, 3));
    let sent = rig.transmits();
    assert_eq!(vec![RD_PATH], sent[0].uri_path());
}

#[test]
fn deregister_removes_server() {
    let mut rig = Rig::new(ClientConfig::default());
    let now = rig.start;

    rig.client.deregister(now);
    let sent = rig.transmits();
    assert_eq!(MsgCode::DELETE, sent[0].code);
    assert_eq!(vec![RD_PATH, LOCATION], sent[0].uri_path());
    rig.reply(now, &sent[0], MsgCode::DELETED);

    assert_eq!(
        vec![ClientEvent::ServerRemoved(rig.ssid), ClientEvent::Deregistered],
        rig.events()
    );
    assert!(rig.client.servers().is_empty());
}

#[test]
fn download_failure_is_notified_and_sent() {
    let config = ClientConfig {
        send_on_update: true,
        ..ClientConfig::default()
    };
    let mut rig = Rig::new(config);
    let now = rig.start;
    let target = Lwm2mPath::instance(OID_FIRMWARE_UPDATE, 0);

    let req = rig
        .request(MsgCode::GET, "/5/0/5")
        .with_option(option::OBSERVE, OBSERVE_REGISTER);
    let token = req.token;
    assert_eq!(b"0".to_vec(), rig.exchange(now, req).payload);

    let req = rig
        .request(MsgCode::PUT, &format!("/5/0/{}", FW_PACKAGE_URI))
        .with_payload(&b"http://invalidfirmware.exe"[..]);
    assert_eq!(MsgCode::CHANGED, rig.exchange(now, req).code);

    let session = match rig.events().pop() {
        Some(ClientEvent::StartDownload {
            target: t,
            session,
            uri,
            offset,
            ..
        }) => {
            assert_eq!(target, t);
            assert_eq!("http://invalidfirmware.exe", uri);
            assert_eq!(0, offset);
            session
        }
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(Some(0), rig.client.download_offset(&target));

    rig.client.download_event(
        secs(now, 1),
        &target,
        session,
        DownloadEvent::Failed(DownloadFailure::InvalidUri),
    );
    let sent = rig.settle(secs(now, 1));
    let notified = notifications(&sent, token);
    assert_eq!(1, notified.len());
    assert_eq!(b"7".to_vec(), notified[0].payload);
    assert!(sent
        .iter()
        .any(|m| m.code == MsgCode::POST && m.uri_path() == vec![SEND_PATH]));

    let req = rig.request(MsgCode::GET, "/5/0/3");
    assert_eq!(b"0".to_vec(), rig.exchange(secs(now, 1), req).payload);
}

#[test]
fn package_pull_waits_its_turn_with_registration_traffic() {
    let config = ClientConfig {
        block_size: 16,
        ..ClientConfig::default()
    };
    let mut rig = Rig::new(config);
    let now = rig.start;
    let target = Lwm2mPath::instance(OID_FIRMWARE_UPDATE, 0);
    let package = build_v1(&MAGIC_FW, ForcedError::None, b"#!/bin/sh\necho updated\n");
    let blocks: Vec<&[u8]> = package.chunks(16).collect();
    assert!(blocks.len() > 2);

    let req = rig
        .request(MsgCode::PUT, &format!("/5/0/{}", FW_PACKAGE_URI))
        .with_payload(&b"coap://127.0.0.1:5683/fw"[..]);
    let token = req.token;
    rig.client.handle_message(now, rig.ssid, req);
    let sent = rig.transmits();
    assert!(rig.events().is_empty());
    let ack = sent.iter().find(|m| m.token == token).unwrap();
    assert_eq!(MsgCode::CHANGED, ack.code);
    let get = sent.iter().find(|m| m.code == MsgCode::GET).unwrap().clone();
    assert_eq!(vec!["fw"], get.uri_path());
    assert_eq!(Some(0), get.block2().map(|b| b.num()));

    // The Update waits for the block exchange in flight.
    rig.client.send_update(now);
    assert!(rig.transmits().is_empty());

    let first = get
        .response(MsgCode::CONTENT)
        .with_option(option::BLOCK2, BlockInfo::new(0, true, 0).unwrap())
        .with_payload(blocks[0].to_vec());
    rig.client.handle_message(secs(now, 1), rig.ssid, first);
    let sent = rig.transmits();
    assert_eq!(1, sent.len());
    assert_eq!(MsgCode::POST, sent[0].code);
    assert_eq!(vec![RD_PATH, LOCATION], sent[0].uri_path());
    assert_eq!(Some(16), rig.client.download_offset(&target));

    rig.reply(secs(now, 1), &sent[0], MsgCode::CHANGED);
    let sent = rig.transmits();
    assert_eq!(1, sent.len());
    assert_eq!(MsgCode::GET, sent[0].code);
    assert_eq!(Some(1), sent[0].block2().map(|b| b.num()));
}

#[test]
fn send_needs_a_registered_server() {
    let mut rig = Rig::new(ClientConfig::default());
    let now = rig.start;
    let paths = [Lwm2mPath::resource(OID_DEVICE, 0, DEV_FIRMWARE_VERSION)];

    rig.client.send(now, &paths).unwrap();
    let sent = rig.transmits();
    assert_eq!(vec![SEND_PATH], sent[0].uri_path());
    assert_eq!(
        Some(ContentFormat::APPLICATION_SENML_CBOR),
        sent[0].content_format()
    );

    rig.client.enter_offline(now, TransportFamily::All);
    assert_eq!(
        Err(ResponseError::ServiceUnavailable),
        rig.client.send(now, &paths)
    );
}

#[test]
fn execute_reboot() {
    let mut rig = Rig::new(ClientConfig::default());
    let now = rig.start;
    let req = rig.request(MsgCode::POST, "/3/0/4");
    assert_eq!(MsgCode::CHANGED, rig.exchange(now, req).code);
    assert_eq!(vec![ClientEvent::Restart], rig.events());
}
