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

//! Message templates: partially specified messages that can be matched
//! against received messages or completed into real ones.

use super::*;

/// A template field: either a concrete value or a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Field<T> {
    /// Matches anything. Cannot be encoded.
    #[default]
    Any,

    /// Matches exactly this value.
    Is(T),
}

impl<T: PartialEq> Field<T> {
    /// Returns true if `value` is acceptable for this field.
    pub fn accepts(&self, value: &T) -> bool {
        match self {
            Field::Any => true,
            Field::Is(x) => x == value,
        }
    }

    /// Returns the concrete value, or [`Error::PlaceholderRemaining`].
    pub fn concrete(self) -> Result<T, Error> {
        match self {
            Field::Any => Err(Error::PlaceholderRemaining),
            Field::Is(x) => Ok(x),
        }
    }

    /// Returns true if this field is the wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, Field::Any)
    }
}

impl<T> From<T> for Field<T> {
    fn from(x: T) -> Self {
        Field::Is(x)
    }
}

/// A CoAP message in which every field may be a wildcard.
///
/// Options are compared as a sorted list, so the order in which they were
/// added to the template does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageTemplate {
    /// Message type (UDP framing).
    pub msg_type: Field<MsgType>,

    /// Message code.
    pub code: Field<MsgCode>,

    /// Message id (UDP framing).
    pub msg_id: Field<MsgId>,

    /// Token.
    pub token: Field<MsgToken>,

    /// Complete option list.
    pub options: Field<Vec<CoapOption>>,

    /// Payload.
    pub payload: Field<Vec<u8>>,
}

impl MessageTemplate {
    /// Template matching any message with the given code.
    pub fn with_code(code: MsgCode) -> MessageTemplate {
        MessageTemplate {
            code: Field::Is(code),
            ..Default::default()
        }
    }

    /// Template fully determined by `msg`.
    pub fn exact(msg: &CoapMessage) -> MessageTemplate {
        let msg = msg.clone().sorted();
        MessageTemplate {
            msg_type: msg.msg_type.map(Field::Is).unwrap_or_default(),
            code: Field::Is(msg.code),
            msg_id: msg.msg_id.map(Field::Is).unwrap_or_default(),
            token: Field::Is(msg.token),
            options: Field::Is(msg.options),
            payload: Field::Is(msg.payload),
        }
    }

    /// Returns true if `msg` agrees with every concrete field.
    pub fn matches(&self, msg: &CoapMessage) -> bool {
        let type_ok = match (&self.msg_type, msg.msg_type) {
            (Field::Any, _) => true,
            (Field::Is(t), Some(actual)) => *t == actual,
            (Field::Is(_), None) => false,
        };
        let id_ok = match (&self.msg_id, msg.msg_id) {
            (Field::Any, _) => true,
            (Field::Is(id), Some(actual)) => *id == actual,
            (Field::Is(_), None) => false,
        };
        let options_ok = match &self.options {
            Field::Any => true,
            Field::Is(expected) => {
                let mut expected = expected.clone();
                expected.sort_by_key(|opt| opt.number);
                expected == msg.clone().sorted().options
            }
        };

        type_ok
            && id_ok
            && options_ok
            && self.code.accepts(&msg.code)
            && self.token.accepts(&msg.token)
            && self.payload.accepts(&msg.payload)
    }

    /// Turns the template into a message, failing with
    /// [`Error::PlaceholderRemaining`] if a field required by `framing` is
    /// still a wildcard. Type and message id are ignored for TCP framing.
    pub fn build(self, framing: Framing) -> Result<CoapMessage, Error> {
        let (msg_type, msg_id) = match framing {
            Framing::Udp => (Some(self.msg_type.concrete()?), Some(self.msg_id.concrete()?)),
            Framing::Tcp => (None, None),
        };

        Ok(CoapMessage {
            msg_type,
            code: self.code.concrete()?,
            msg_id,
            token: self.token.concrete()?,
            options: self.options.concrete()?,
            payload: self.payload.concrete()?,
        })
    }

    /// Builds and encodes the template.
    pub fn encode(self, framing: Framing) -> Result<Vec<u8>, Error> {
        codec::encode(&self.build(framing)?, framing)
    }
}
