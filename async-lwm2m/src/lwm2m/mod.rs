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

//! LwM2M data model primitives: paths, values, content encodings and the
//! registration interface messages.

use super::*;

mod path;
pub use path::Lwm2mPath;

mod value;
pub use value::{Value, ValueKind};

pub mod exec_args;
pub mod link_format;
pub mod senml;
pub mod tlv;

mod registration;
pub use registration::*;

mod send;
pub use send::send_request;
