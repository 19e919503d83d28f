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

//! This crate provides the [Tokio](https://tokio.rs) back-end for [`async_lwm2m`]:
//!
//! * [`TokioUdpTransport`] and [`TokioTcpTransport`], socket implementations of
//!   [`TransportStream`](async_lwm2m::transport::TransportStream).
//! * [`Downloads`], which pulls firmware and software packages over CoAP, CoAP over TCP,
//!   HTTP and HTTPS.
//! * [`Runtime`], which drives an [`Lwm2mClient`](async_lwm2m::client::Lwm2mClient)
//!   against real sockets, timers and control commands.
//!
//! The `lwm2m-client` binary built from this crate wires a [`Runtime`] to a
//! configuration file, command line arguments and control commands on stdin.
//!
//! ## Example
//!
//! ```no_run
//! use async_lwm2m::client::Lwm2mClient;
//! use async_lwm2m::config::ClientConfig;
//! use async_lwm2m_tokio::{Runtime, Storage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default();
//!     let objects = Storage::for_config(&config).objects(&config)?;
//!     let mut runtime = Runtime::new(Lwm2mClient::new(config, objects))?;
//!     runtime.add_server("coap://127.0.0.1:5683").await?;
//!
//!     let (_commands, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     runtime.run(&mut rx).await?;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

use async_lwm2m::transport::{CoapUri, TransportKind, TransportStream};
use async_lwm2m::Error;
use std::net::SocketAddr;

mod udp;
pub use udp::TokioUdpTransport;

mod tcp;
pub use tcp::{TokioTcpListener, TokioTcpTransport};

mod link;
pub use link::{Link, LinkCommand};

mod http;

mod download;
pub use download::{Downloads, Progress};

mod runtime;
pub use runtime::{Exit, Runtime, RuntimeError, Storage};

/// A CoAP URI resolved to a transport and a socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapTarget {
    /// Transport selected by the scheme.
    pub kind: TransportKind,
    /// First address the host resolved to.
    pub remote: SocketAddr,
    /// Path segments as they appear in the URI.
    pub path: Vec<String>,
    /// Query items, undecoded.
    pub query: Vec<String>,
}

/// Parses `uri` and resolves its host.
///
/// Fails with [`Error::UnsupportedUriScheme`] for anything but the four CoAP
/// schemes, and with [`Error::HostNotFound`] when the name does not resolve.
pub async fn resolve(uri: &str) -> Result<CoapTarget, Error> {
    let CoapUri {
        kind,
        host,
        port,
        path,
        query,
    } = CoapUri::parse(uri)?;

    let remote = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| Error::HostNotFound)?
        .next()
        .ok_or(Error::HostNotFound)?;

    Ok(CoapTarget {
        kind,
        remote,
        path,
        query,
    })
}

/// Opens a transport of `kind` connected to `remote`.
///
/// Secure transports need a security session and are refused with
/// [`Error::UnsupportedUriScheme`].
pub async fn connect(
    kind: TransportKind,
    remote: SocketAddr,
) -> Result<Box<dyn TransportStream>, Error> {
    let mut transport: Box<dyn TransportStream> = match kind {
        TransportKind::Udp => Box::new(TokioUdpTransport::bind(udp::unspecified_for(&remote))?),
        TransportKind::Tcp => Box::new(TokioTcpTransport::new()),
        TransportKind::Dtls | TransportKind::Tls => {
            warn!("{}: no security session available", kind.scheme());
            return Err(Error::UnsupportedUriScheme);
        }
    };
    transport.connect(remote).await?;
    Ok(transport)
}
