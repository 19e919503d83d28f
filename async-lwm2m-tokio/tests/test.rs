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

use async_lwm2m::client::Lwm2mClient;
use async_lwm2m::config::ClientConfig;
use async_lwm2m::control::ControlCommand;
use async_lwm2m::message::codec;
use async_lwm2m::prelude::*;
use async_lwm2m::update::{DownloadEvent, DownloadFailure, DownloadSession};
use async_lwm2m_tokio::*;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::unbounded_channel;

const PACKAGE: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!?";

fn soon(millis: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_millis(millis))
}

async fn recv_from(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("nothing received")
        .unwrap();
    (buf[..len].to_vec(), from)
}

#[tokio::test]
async fn udp_fake_close_keeps_address() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut client = TokioUdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    client.connect(server.local_addr().unwrap()).await.unwrap();
    let local = client.local_addr().unwrap();

    client.send(b"ping").await.unwrap();
    let (bytes, from) = recv_from(&server).await;
    assert_eq!(b"ping".to_vec(), bytes);
    assert_eq!(local, from);

    let mut buf = [0u8; 64];
    server.send_to(b"pong", from).await.unwrap();
    assert_eq!(Ok(4), client.recv(&mut buf, soon(2000)).await);

    client.fake_close().unwrap();
    assert!(client.is_fake_closed());
    server.send_to(b"lost", from).await.unwrap();
    assert_eq!(
        Err(Error::ResponseTimeout),
        client.recv(&mut buf, soon(200)).await
    );

    client.fake_unclose().unwrap();
    assert_eq!(local, client.local_addr().unwrap());
    client.send(b"again").await.unwrap();
    let (bytes, from) = recv_from(&server).await;
    assert_eq!(b"again".to_vec(), bytes);
    assert_eq!(local, from);
}

#[tokio::test]
async fn udp_reset_rebinds_same_port() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut client = TokioUdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    client.connect(server.local_addr().unwrap()).await.unwrap();
    let local = client.local_addr().unwrap();

    client.reset().await.unwrap();
    client.send(b"after reset").await.unwrap();
    let (bytes, from) = recv_from(&server).await;
    assert_eq!(b"after reset".to_vec(), bytes);
    assert_eq!(local, from);
}

#[tokio::test]
async fn tcp_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut client = TokioTcpTransport::new();
    client.connect(listener.local_addr().unwrap()).await.unwrap();
    let (mut accepted, _) = listener.accept().await.unwrap();

    client.send(b"hello").await.unwrap();
    let mut buf = [0u8; 64];
    let len = accepted.read(&mut buf).await.unwrap();
    assert_eq!(b"hello", &buf[..len]);

    accepted.write_all(b"world").await.unwrap();
    let len = client.recv(&mut buf, soon(2000)).await.unwrap();
    assert_eq!(b"world", &buf[..len]);

    drop(accepted);
    assert_eq!(
        Err(Error::ConnectionLost),
        client.recv(&mut buf, soon(2000)).await
    );
}

#[tokio::test]
async fn tcp_listener_accepts_transport() {
    let listener = TokioTcpListener::listen(0).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut client = TokioTcpTransport::new();
    client
        .connect(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .unwrap();
    let mut accepted = listener.accept().await.unwrap();
    assert_eq!(client.local_addr().ok(), accepted.peer_addr());

    client.send(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    let len = accepted.recv(&mut buf, soon(2000)).await.unwrap();
    assert_eq!(b"ping", &buf[..len]);
}

#[tokio::test]
async fn udp_accept_connects_to_first_sender() {
    let mut server = TokioUdpTransport::listen(0).unwrap();
    let port = server.local_addr().unwrap().port();
    assert_eq!(
        Err(Error::ResponseTimeout),
        server.accept(soon(50)).await
    );

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"hello", ("127.0.0.1", port))
        .await
        .unwrap();
    let from = server.accept(soon(2000)).await.unwrap();
    assert_eq!(client.local_addr().unwrap(), from);

    let mut buf = [0u8; 64];
    let len = server.recv(&mut buf, soon(2000)).await.unwrap();
    assert_eq!(b"hello", &buf[..len]);
    server.send(b"back").await.unwrap();
    assert_eq!(b"back".to_vec(), recv_from(&client).await.0);
}

#[tokio::test]
async fn resolves_coap_uris() {
    let target = resolve("coap+tcp://127.0.0.1/fw/pkg?v=2").await.unwrap();
    assert_eq!(TransportKind::Tcp, target.kind);
    assert_eq!(5683, target.remote.port());
    assert_eq!(vec!["fw", "pkg"], target.path);
    assert_eq!(vec!["v=2"], target.query);

    assert_eq!(
        Err(Error::UnsupportedUriScheme),
        resolve("http://127.0.0.1/").await
    );
}

fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

/// A one-file HTTP origin. `respond` gets the request number and the
/// lower-cased request head. Returns the package URL and the request log.
async fn http_origin<F>(respond: F) -> (String, Arc<Mutex<Vec<String>>>)
where
    F: Fn(usize, &str) -> Vec<u8> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/fw.pkg", listener.local_addr().unwrap());
    let log = Arc::new(Mutex::new(Vec::new()));
    let requests = log.clone();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let len = stream.read(&mut buf).await.unwrap();
                if len == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..len]);
            }
            let head = String::from_utf8_lossy(&head).to_ascii_lowercase();
            let index = {
                let mut log = requests.lock().unwrap();
                log.push(head.clone());
                log.len() - 1
            };
            stream.write_all(&respond(index, &head)).await.unwrap();
            let _ = stream.shutdown().await;
        }
    });

    (url, log)
}

async fn drain(downloads: &mut Downloads) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    loop {
        let progress = tokio::time::timeout(Duration::from_secs(10), downloads.next())
            .await
            .expect("download stalled")
            .expect("channel closed");
        assert_eq!(Lwm2mPath::instance(5, 0), progress.target);
        assert_eq!(DownloadSession(7), progress.session);
        let done = matches!(
            progress.event,
            DownloadEvent::Finished | DownloadEvent::Failed(_)
        );
        events.push(progress.event);
        if done {
            return events;
        }
    }
}

fn data(events: &[DownloadEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Data(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

async fn download(uri: &str, offset: u64, etag: Option<ETag>) -> Vec<DownloadEvent> {
    let mut downloads = Downloads::new(TransParams::default(), 1).unwrap();
    downloads.start(
        Lwm2mPath::instance(5, 0),
        DownloadSession(7),
        uri.to_string(),
        offset,
        etag,
    );
    drain(&mut downloads).await
}

#[tokio::test]
async fn http_download() {
    let (url, log) = http_origin(|_, _| {
        http_response("200 OK", &[("ETag", "\"v1\"")], PACKAGE)
    })
    .await;

    let events = download(&url, 0, None).await;
    assert_eq!(
        DownloadEvent::ETag(ETag::from_http_header("\"v1\"").unwrap()),
        events[0]
    );
    assert_eq!(Some(&DownloadEvent::Finished), events.last());
    assert_eq!(PACKAGE.to_vec(), data(&events));
    assert!(!log.lock().unwrap()[0].contains("range:"));
}

#[tokio::test]
async fn http_download_resumes_with_range() {
    let (url, log) = http_origin(|_, _| {
        http_response("206 Partial Content", &[("ETag", "\"v1\"")], &PACKAGE[20..])
    })
    .await;

    let etag = ETag::from_http_header("\"v1\"");
    let events = download(&url, 20, etag).await;
    assert!(!events.contains(&DownloadEvent::Restarted));
    assert_eq!(PACKAGE[20..].to_vec(), data(&events));

    let head = log.lock().unwrap()[0].clone();
    assert!(head.contains("range: bytes=20-"), "{}", head);
    assert!(head.contains("if-match: \"v1\""), "{}", head);
}

#[tokio::test]
async fn http_download_restarts_on_changed_package() {
    let (url, log) = http_origin(|index, _| match index {
        0 => http_response("412 Precondition Failed", &[], b""),
        _ => http_response("200 OK", &[("ETag", "\"v2\"")], PACKAGE),
    })
    .await;

    let events = download(&url, 20, ETag::from_http_header("\"v1\"")).await;
    assert_eq!(DownloadEvent::Restarted, events[0]);
    assert_eq!(Some(&DownloadEvent::Finished), events.last());
    assert_eq!(PACKAGE.to_vec(), data(&events));

    let log = log.lock().unwrap();
    assert_eq!(2, log.len());
    assert!(!log[1].contains("range:"));
}

#[tokio::test]
async fn http_download_failures() {
    let (url, _) = http_origin(|_, _| http_response("404 Not Found", &[], b"")).await;
    assert_eq!(
        vec![DownloadEvent::Failed(DownloadFailure::InvalidUri)],
        download(&url, 0, None).await
    );

    assert_eq!(
        vec![DownloadEvent::Failed(DownloadFailure::InvalidUri)],
        download("http://no-such-host.invalid/fw.pkg", 0, None).await
    );

    assert_eq!(
        vec![DownloadEvent::Failed(DownloadFailure::UnsupportedProtocol)],
        download("ftp://127.0.0.1/fw.pkg", 0, None).await
    );
}

/// A CoAP origin serving `PACKAGE` block by block with the given ETag.
async fn coap_origin(etag: &'static [u8]) -> (SocketAddr, Arc<Mutex<Vec<CoapMessage>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let requests = log.clone();

    tokio::spawn(async move {
        loop {
            let (bytes, from) = recv_from(&socket).await;
            let request = codec::decode(&bytes, Framing::Udp).unwrap();
            requests.lock().unwrap().push(request.clone());

            let response = match request.option(option::IF_MATCH) {
                Some(tag) if tag.as_bytes() != etag => request.response(MsgCode::PRECONDITION_FAILED),
                _ => {
                    let block = request
                        .block2()
                        .unwrap_or_else(|| BlockInfo::new(0, false, 6).unwrap());
                    let start = block.offset().min(PACKAGE.len());
                    let end = (start + block.len()).min(PACKAGE.len());
                    let more = end < PACKAGE.len();
                    request
                        .response(MsgCode::CONTENT)
                        .with_option(option::ETAG, ETag::new(etag))
                        .with_option(
                            option::BLOCK2,
                            BlockInfo::new(block.num(), more, block.szx()).unwrap(),
                        )
                        .with_payload(&PACKAGE[start..end])
                }
            };
            let bytes = codec::encode(&response, Framing::Udp).unwrap();
            socket.send_to(&bytes, from).await.unwrap();
        }
    });

    (addr, log)
}

#[tokio::test]
async fn coap_block2_download() {
    let (addr, log) = coap_origin(b"e1").await;
    let uri = format!("coap://{}/fw", addr);

    let events = download(&uri, 0, None).await;
    assert_eq!(DownloadEvent::ETag(ETag::new(b"e1")), events[0]);
    assert_eq!(PACKAGE.to_vec(), data(&events));

    // 32-byte blocks.
    let log = log.lock().unwrap();
    assert_eq!(2, log.len());
    assert_eq!(vec!["fw"], log[0].uri_path());
}

#[tokio::test]
async fn coap_download_resumes_mid_block() {
    let (addr, log) = coap_origin(b"e1").await;
    let uri = format!("coap://{}/fw", addr);

    let events = download(&uri, 40, Some(ETag::new(b"e1"))).await;
    assert!(!events.contains(&DownloadEvent::Restarted));
    assert_eq!(PACKAGE[40..].to_vec(), data(&events));

    let first = log.lock().unwrap()[0].clone();
    assert_eq!(32, first.block2().unwrap().offset());
    assert_eq!(Some(ETag::new(b"e1")), first.option(option::IF_MATCH));
}

#[tokio::test]
async fn coap_download_restarts_on_new_etag() {
    let (addr, _) = coap_origin(b"e2").await;
    let uri = format!("coap://{}/fw", addr);

    let events = download(&uri, 32, Some(ETag::new(b"e1"))).await;
    assert_eq!(DownloadEvent::Restarted, events[0]);
    assert_eq!(Some(&DownloadEvent::Finished), events.last());
    assert_eq!(PACKAGE.to_vec(), data(&events));
}

fn decode(bytes: &[u8]) -> CoapMessage {
    codec::decode(bytes, Framing::Udp).unwrap()
}

async fn answer(socket: &UdpSocket, to: SocketAddr, response: CoapMessage) {
    let bytes = codec::encode(&response, Framing::Udp).unwrap();
    socket.send_to(&bytes, to).await.unwrap();
}

#[tokio::test]
async fn runtime_registers_serves_and_deregisters() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("coap://{}", server.local_addr().unwrap());

    let config = ClientConfig {
        endpoint_name: "urn:dev:os:runtime-test".into(),
        ..ClientConfig::default()
    };
    let objects = Storage::for_config(&config).objects(&config).unwrap();
    let mut runtime = Runtime::new(Lwm2mClient::new(config, objects)).unwrap();
    runtime.add_server(&uri).await.unwrap();
    assert_eq!(vec![uri.clone()], runtime.server_uris());

    let (commands, mut rx) = unbounded_channel();

    let lwm2m_server = async {
        let (bytes, client) = recv_from(&server).await;
        let register = decode(&bytes);
        assert_eq!(MsgCode::POST, register.code);
        assert_eq!(vec!["rd"], register.uri_path());
        assert!(register
            .uri_queries()
            .contains(&"ep=urn:dev:os:runtime-test".to_string()));
        let mut created = register.response(MsgCode::CREATED);
        created.add_option(option::LOCATION_PATH, "rd".to_string());
        created.add_option(option::LOCATION_PATH, "42".to_string());
        answer(&server, client, created).await;

        let read = CoapMessage::request(MsgCode::GET)
            .with_msg_id(0x4000)
            .with_token(MsgToken::new(&[0xaa]).unwrap())
            .with_uri_path("3/0/0");
        answer(&server, client, read).await;
        let (bytes, _) = recv_from(&server).await;
        let content = decode(&bytes);
        assert_eq!(MsgCode::CONTENT, content.code);
        assert_eq!(Some(0x4000), content.msg_id);
        assert_eq!(b"0023C7".to_vec(), content.payload);

        commands.send(ControlCommand::Quit).unwrap();
        let (bytes, _) = recv_from(&server).await;
        let deregister = decode(&bytes);
        assert_eq!(MsgCode::DELETE, deregister.code);
        assert_eq!(vec!["rd", "42"], deregister.uri_path());
        answer(&server, client, deregister.response(MsgCode::DELETED)).await;
    };

    let (exit, ()) = tokio::join!(runtime.run(&mut rx), lwm2m_server);
    assert_eq!(Exit::Deregistered, exit.unwrap());
}

#[tokio::test]
async fn runtime_answers_control_queries() {
    let config = ClientConfig::default();
    let objects = Storage::for_config(&config).objects(&config).unwrap();
    let mut runtime = Runtime::new(Lwm2mClient::new(config, objects)).unwrap();

    assert_eq!(
        Some("FW_OFFSET 0".to_string()),
        runtime.control(ControlCommand::GetFwOffset).await
    );
    assert_eq!(
        Some("FW_DEADLINE -1".to_string()),
        runtime.control(ControlCommand::GetFwDeadline).await
    );
    assert_eq!(None, runtime.control(ControlCommand::SendUpdate).await);
}

#[tokio::test]
async fn secure_schemes_are_refused() {
    let addr: SocketAddr = "127.0.0.1:5684".parse().unwrap();
    assert!(matches!(
        connect(TransportKind::Dtls, addr).await,
        Err(Error::UnsupportedUriScheme)
    ));
}
