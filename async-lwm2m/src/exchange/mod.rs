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

//! Message exchanges: correlation, retransmission and block-wise transfer.
//!
//! [`ExchangeEngine`] is a sans-IO state machine. [`Endpoint`] drives one over
//! a [`TransportStream`].

use super::*;
use crate::message::codec;

mod ids;
pub use ids::IdGenerator;

mod block1;
pub use block1::*;

mod block2;
pub use block2::*;

mod dedup;
pub use dedup::*;

mod engine;
pub use engine::*;

mod endpoint;
pub use endpoint::Endpoint;
