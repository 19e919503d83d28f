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
use std::fmt::{Display, Formatter};

/// Data type of a LwM2M resource, as declared by its object definition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Signed integer.
    Integer,
    /// Unsigned integer.
    Unsigned,
    /// IEEE 754 float.
    Float,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Opaque,
    /// Seconds since the Unix epoch.
    Time,
    /// Object link `oid:iid`.
    ObjLink,
}

/// A single resource value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer.
    Integer(i64),
    /// Unsigned integer.
    Unsigned(u64),
    /// IEEE 754 float.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Opaque(Vec<u8>),
    /// Seconds since the Unix epoch.
    Time(i64),
    /// Object link.
    ObjLink(u16, u16),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Unsigned(_) => ValueKind::Unsigned,
            Value::Float(_) => ValueKind::Float,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::String(_) => ValueKind::String,
            Value::Opaque(_) => ValueKind::Opaque,
            Value::Time(_) => ValueKind::Time,
            Value::ObjLink(..) => ValueKind::ObjLink,
        }
    }

    /// The value as a number, for threshold attributes.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Integer(x) | Value::Time(x) => Some(x as f64),
            Value::Unsigned(x) => Some(x as f64),
            Value::Float(x) => Some(x),
            Value::Boolean(x) => Some(if x { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// The `text/plain` rendering. Opaque values have none.
    pub fn to_text(&self) -> Option<String> {
        Some(match self {
            Value::Integer(x) | Value::Time(x) => x.to_string(),
            Value::Unsigned(x) => x.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Boolean(x) => (if *x { "1" } else { "0" }).to_string(),
            Value::String(x) => x.clone(),
            Value::ObjLink(oid, iid) => format!("{}:{}", oid, iid),
            Value::Opaque(_) => return None,
        })
    }

    /// Parses a `text/plain` payload as a value of the given kind.
    pub fn from_text(kind: ValueKind, text: &str) -> Result<Value, ResponseError> {
        fn bad<E>(_: E) -> ResponseError {
            ResponseError::BadRequest
        }
        Ok(match kind {
            ValueKind::Integer => Value::Integer(text.parse().map_err(bad)?),
            ValueKind::Time => Value::Time(text.parse().map_err(bad)?),
            ValueKind::Unsigned => Value::Unsigned(text.parse().map_err(bad)?),
            ValueKind::Float => Value::Float(text.parse().map_err(bad)?),
            ValueKind::Boolean => match text {
                "0" => Value::Boolean(false),
                "1" => Value::Boolean(true),
                _ => return Err(ResponseError::BadRequest),
            },
            ValueKind::String => Value::String(text.to_string()),
            ValueKind::ObjLink => {
                let (oid, iid) = text.split_once(':').ok_or(ResponseError::BadRequest)?;
                Value::ObjLink(oid.parse().map_err(bad)?, iid.parse().map_err(bad)?)
            }
            ValueKind::Opaque => return Err(ResponseError::UnsupportedContentFormat),
        })
    }

    /// Encodes this value as the payload of a single-resource response in
    /// the requested format.
    pub fn to_payload(&self, format: ContentFormat) -> Result<Vec<u8>, ResponseError> {
        match format.canonical() {
            ContentFormat::TEXT_PLAIN => self
                .to_text()
                .map(String::into_bytes)
                .ok_or(ResponseError::NotAcceptable),
            ContentFormat::APPLICATION_OCTET_STREAM => {
                match self {
                    Value::Opaque(bytes) => Ok(bytes.clone()),
                    _ => Err(ResponseError::NotAcceptable),
                }
            }
            _ => Err(ResponseError::NotAcceptable),
        }
    }

    /// Decodes a single-resource write payload.
    pub fn from_payload(
        kind: ValueKind,
        format: ContentFormat,
        payload: &[u8],
    ) -> Result<Value, ResponseError> {
        match format.canonical() {
            ContentFormat::TEXT_PLAIN => {
                let text =
                    std::str::from_utf8(payload).map_err(|_| ResponseError::BadRequest)?;
                Value::from_text(kind, text)
            }
            ContentFormat::APPLICATION_OCTET_STREAM
                if kind == ValueKind::Opaque =>
            {
                Ok(Value::Opaque(payload.to_vec()))
            }
            ContentFormat::LWM2M_TLV => {
                let entries = tlv::decode(payload)?;
                match entries.as_slice() {
                    [entry] if entry.kind == tlv::TlvKind::Resource => {
                        tlv::decode_value(kind, &entry.payload)
                    }
                    _ => Err(ResponseError::BadRequest),
                }
            }
            _ => Err(ResponseError::UnsupportedContentFormat),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Opaque(bytes) => write!(f, "{:02x?}", bytes),
            other => f.write_str(&other.to_text().unwrap_or_default()),
        }
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Integer(x)
    }
}

impl From<bool> for Value {
    fn from(x: bool) -> Self {
        Value::Boolean(x)
    }
}

impl From<&str> for Value {
    fn from(x: &str) -> Self {
        Value::String(x.to_string())
    }
}

impl From<String> for Value {
    fn from(x: String) -> Self {
        Value::String(x)
    }
}

impl From<Vec<u8>> for Value {
    fn from(x: Vec<u8>) -> Self {
        Value::Opaque(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_write_then_read() {
        for (kind, text) in [
            (ValueKind::Integer, "-42"),
            (ValueKind::Boolean, "1"),
            (ValueKind::String, "coap://127.0.0.1:5683/fw"),
            (ValueKind::ObjLink, "33629:1"),
        ] {
            let value = Value::from_payload(kind, ContentFormat::TEXT_PLAIN, text.as_bytes())
                .unwrap();
            assert_eq!(
                text.as_bytes(),
                value.to_payload(ContentFormat::TEXT_PLAIN).unwrap().as_slice()
            );
        }
    }

    #[test]
    fn opaque_write_then_read() {
        let value = Value::from_payload(
            ValueKind::Opaque,
            ContentFormat::APPLICATION_OCTET_STREAM,
            &[0, 1, 2],
        )
        .unwrap();
        assert_eq!(
            vec![0, 1, 2],
            value.to_payload(ContentFormat::APPLICATION_OCTET_STREAM).unwrap()
        );
        assert_eq!(
            Err(ResponseError::NotAcceptable),
            value.to_payload(ContentFormat::TEXT_PLAIN)
        );
    }

    #[test]
    fn bad_text() {
        assert_eq!(
            Err(ResponseError::BadRequest),
            Value::from_text(ValueKind::Boolean, "yes")
        );
        assert_eq!(
            Err(ResponseError::BadRequest),
            Value::from_text(ValueKind::Integer, "1.5")
        );
    }
}
