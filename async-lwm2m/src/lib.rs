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

//! An experimental, asynchronous implementation of a Lightweight M2M (LwM2M) client core.
//!
//! This crate provides the runtime-agnostic parts of a LwM2M client: a CoAP codec for both the
//! UDP (RFC 7252) and TCP (RFC 8323) framings, a sans-IO exchange engine with retransmission and
//! block-wise transfer, a resource observation engine, and the Firmware Update, Advanced
//! Firmware Update and Software Management state machines.
//!
//! Network I/O is abstracted behind the [`transport::TransportStream`] trait. A
//! [Tokio](https://tokio.rs)-based back-end with UDP and TCP sockets, an HTTP package downloader
//! and a command-line driver can be found in the `async-lwm2m-tokio` crate. An in-memory
//! [`transport::LoopbackTransport`] is included for testing.
//!
//! ## Design
//!
//! The protocol engines ([`exchange::ExchangeEngine`], [`observe::ObservationEngine`] and the
//! state machines in [`update`]) never perform I/O themselves. They are fed with received
//! messages and the current time, and are polled for messages to transmit, events and the next
//! instant at which they want to be woken up. This keeps them deterministic under test and
//! lets the same code be driven by any executor.
//!
//! [`exchange::Endpoint`] ties an [`exchange::ExchangeEngine`] to a transport and offers an
//! `async` request/response interface on top:
//!
//! ```
//! # use async_lwm2m::prelude::*;
//! # use async_lwm2m::transport::LoopbackTransport;
//! # use async_lwm2m::exchange::{Endpoint, RequestOptions};
//! # use futures::executor::block_on;
//! let (client, server) = LoopbackTransport::pair(TransportKind::Udp);
//! let mut client = Endpoint::new(client, TransParams::default());
//! let mut server = Endpoint::new(server, TransParams::default());
//!
//! block_on(async {
//!     let request = CoapMessage::request(MsgCode::GET).with_uri_path("3/0/0");
//!     let serve = async {
//!         let (_, req) = server.receive_request(None).await.unwrap();
//!         let resp = req.response(MsgCode::CONTENT).with_payload(&b"Acme"[..]);
//!         server.send_response(&req, resp).await.unwrap();
//!     };
//!     let (response, _) = futures::join!(
//!         client.send_request(request, RequestOptions::default()),
//!         serve
//!     );
//!     assert_eq!(b"Acme".to_vec(), response.unwrap().payload);
//! });
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod message;
pub mod option;

mod content_format;
pub use content_format::ContentFormat;

mod block;
pub use block::*;

mod trans_params;
pub use trans_params::*;

pub mod consts;
#[doc(hidden)]
pub use consts::*;

mod error;
pub use error::*;

mod util;
use util::*;

mod etag;
pub use etag::ETag;

pub mod transport;
pub mod exchange;
pub mod observe;
pub mod lwm2m;
pub mod update;
pub mod scheduler;
pub mod client;
pub mod control;
pub mod config;

#[doc(hidden)]
pub mod prelude {
    pub use super::ContentFormat;
    pub use super::{BlockInfo, ETag, Error, ResponseError, TransParams};

    pub use super::message::CoapMessage;
    pub use super::message::CoapOption;
    pub use super::message::Framing;
    pub use super::message::MessageDisplay;
    pub use super::message::MsgCode;
    pub use super::message::MsgId;
    pub use super::message::MsgToken;
    pub use super::message::MsgType;

    pub use super::option;
    pub use option::OptionKey;
    pub use option::OptionNumber;
    pub use option::OptionValue;

    pub use super::transport::TransportKind;
    pub use super::transport::TransportStream;

    pub use super::lwm2m::Lwm2mPath;
}

use prelude::*;
