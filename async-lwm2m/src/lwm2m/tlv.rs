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

//! LwM2M TLV (content format 11542).
//!
//! ```text
//!  7 6   5   4 3   2 1 0
//! +---+----+-----+-------+------------+------------+-------+
//! |Typ|IdW |LenT | Len   | Id (8/16)  | Len (0-24) | Value |
//! +---+----+-----+-------+------------+------------+-------+
//! ```
//!
//! `IdW` selects an 8 or 16 bit identifier; `LenT` is 0 when the length
//! fits in the low three bits, otherwise the width in bytes of an explicit
//! length field.

use super::*;
use byteorder::{BigEndian, ByteOrder};

/// The four TLV entry types.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TlvKind {
    /// `00`: object instance containing resources.
    ObjectInstance,
    /// `01`: one instance of a multiple resource.
    ResourceInstance,
    /// `10`: multiple resource containing resource instances.
    MultipleResource,
    /// `11`: single resource with a value.
    Resource,
}

impl TlvKind {
    fn bits(self) -> u8 {
        match self {
            TlvKind::ObjectInstance => 0b00,
            TlvKind::ResourceInstance => 0b01,
            TlvKind::MultipleResource => 0b10,
            TlvKind::Resource => 0b11,
        }
    }

    fn from_bits(bits: u8) -> TlvKind {
        match bits & 0b11 {
            0b00 => TlvKind::ObjectInstance,
            0b01 => TlvKind::ResourceInstance,
            0b10 => TlvKind::MultipleResource,
            _ => TlvKind::Resource,
        }
    }

    /// True for the two types whose payload is a nested TLV list.
    pub fn is_container(self) -> bool {
        matches!(self, TlvKind::ObjectInstance | TlvKind::MultipleResource)
    }
}

/// One decoded TLV entry. Container payloads are left encoded; use
/// [`TlvEntry::children`] to descend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    /// Entry type.
    pub kind: TlvKind,
    /// Object instance, resource or resource instance id.
    pub id: u16,
    /// Raw value or nested entries.
    pub payload: Vec<u8>,
}

impl TlvEntry {
    /// A resource entry holding `value`.
    pub fn resource(id: u16, value: &Value) -> TlvEntry {
        TlvEntry {
            kind: TlvKind::Resource,
            id,
            payload: encode_value(value),
        }
    }

    /// A container entry holding `children`.
    pub fn container(kind: TlvKind, id: u16, children: &[TlvEntry]) -> TlvEntry {
        TlvEntry {
            kind,
            id,
            payload: encode(children),
        }
    }

    /// Decodes the nested entries of a container.
    pub fn children(&self) -> Result<Vec<TlvEntry>, ResponseError> {
        if !self.kind.is_container() {
            return Err(ResponseError::BadRequest);
        }
        decode(&self.payload)
    }
}

fn write_entry(out: &mut Vec<u8>, entry: &TlvEntry) {
    let len = entry.payload.len();
    let mut header = entry.kind.bits() << 6;
    let wide_id = entry.id > 0xFF;
    if wide_id {
        header |= 0x20;
    }

    let len_bytes = match len {
        0..=7 => {
            header |= len as u8;
            0
        }
        8..=0xFF => 1,
        0x100..=0xFFFF => 2,
        _ => 3,
    };
    header |= (len_bytes as u8) << 3;
    out.push(header);

    if wide_id {
        out.extend_from_slice(&entry.id.to_be_bytes());
    } else {
        out.push(entry.id as u8);
    }

    if len_bytes > 0 {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, len as u32);
        out.extend_from_slice(&buf[4 - len_bytes..]);
    }
    out.extend_from_slice(&entry.payload);
}

/// Encodes a list of entries.
pub fn encode(entries: &[TlvEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        write_entry(&mut out, entry);
    }
    out
}

/// Decodes a list of entries. Truncated input is a `BadRequest`.
pub fn decode(mut buf: &[u8]) -> Result<Vec<TlvEntry>, ResponseError> {
    let mut entries = Vec::new();

    while !buf.is_empty() {
        let header = buf[0];
        let id_len = if header & 0x20 != 0 { 2 } else { 1 };
        let len_bytes = ((header >> 3) & 0b11) as usize;
        let fixed = 1 + id_len + len_bytes;
        if buf.len() < fixed {
            return Err(ResponseError::BadRequest);
        }

        let id = if id_len == 2 {
            BigEndian::read_u16(&buf[1..3])
        } else {
            buf[1] as u16
        };

        let len = if len_bytes == 0 {
            (header & 0b111) as usize
        } else {
            BigEndian::read_uint(&buf[1 + id_len..fixed], len_bytes) as usize
        };

        if buf.len() < fixed + len {
            return Err(ResponseError::BadRequest);
        }

        entries.push(TlvEntry {
            kind: TlvKind::from_bits(header >> 6),
            id,
            payload: buf[fixed..fixed + len].to_vec(),
        });
        buf = &buf[fixed + len..];
    }

    Ok(entries)
}

fn encode_int(x: i64) -> Vec<u8> {
    if let Ok(x) = i8::try_from(x) {
        vec![x as u8]
    } else if let Ok(x) = i16::try_from(x) {
        x.to_be_bytes().to_vec()
    } else if let Ok(x) = i32::try_from(x) {
        x.to_be_bytes().to_vec()
    } else {
        x.to_be_bytes().to_vec()
    }
}

/// Encodes a value as a TLV resource payload.
pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Integer(x) | Value::Time(x) => encode_int(*x),
        Value::Unsigned(x) => match i64::try_from(*x) {
            Ok(x) => encode_int(x),
            Err(_) => x.to_be_bytes().to_vec(),
        },
        Value::Float(x) => {
            let narrow = *x as f32;
            if narrow as f64 == *x {
                narrow.to_be_bytes().to_vec()
            } else {
                x.to_be_bytes().to_vec()
            }
        }
        Value::Boolean(x) => vec![*x as u8],
        Value::String(x) => x.as_bytes().to_vec(),
        Value::Opaque(x) => x.clone(),
        Value::ObjLink(oid, iid) => {
            let mut buf = [0u8; 4];
            BigEndian::write_u16(&mut buf[..2], *oid);
            BigEndian::write_u16(&mut buf[2..], *iid);
            buf.to_vec()
        }
    }
}

/// Decodes a TLV resource payload as a value of the given kind.
pub fn decode_value(kind: ValueKind, bytes: &[u8]) -> Result<Value, ResponseError> {
    let bad = ResponseError::BadRequest;
    Ok(match kind {
        ValueKind::Integer | ValueKind::Time => {
            let x = match bytes.len() {
                1 => bytes[0] as i8 as i64,
                2 | 4 | 8 => BigEndian::read_int(bytes, bytes.len()),
                _ => return Err(bad),
            };
            if kind == ValueKind::Time {
                Value::Time(x)
            } else {
                Value::Integer(x)
            }
        }
        ValueKind::Unsigned => match bytes.len() {
            1 | 2 | 4 | 8 => Value::Unsigned(BigEndian::read_uint(bytes, bytes.len())),
            _ => return Err(bad),
        },
        ValueKind::Float => match bytes.len() {
            4 => Value::Float(BigEndian::read_f32(bytes) as f64),
            8 => Value::Float(BigEndian::read_f64(bytes)),
            _ => return Err(bad),
        },
        ValueKind::Boolean => match bytes {
            [0] => Value::Boolean(false),
            [1] => Value::Boolean(true),
            _ => return Err(bad),
        },
        ValueKind::String => {
            Value::String(String::from_utf8(bytes.to_vec()).map_err(|_| bad)?)
        }
        ValueKind::Opaque => Value::Opaque(bytes.to_vec()),
        ValueKind::ObjLink => {
            if bytes.len() != 4 {
                return Err(bad);
            }
            Value::ObjLink(
                BigEndian::read_u16(&bytes[..2]),
                BigEndian::read_u16(&bytes[2..]),
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_resource() {
        let entry = TlvEntry::resource(3, &Value::Integer(1));
        assert_eq!(vec![0xC1, 0x03, 0x01], encode(&[entry.clone()]));
        assert_eq!(vec![entry], decode(&[0xC1, 0x03, 0x01]).unwrap());
    }

    #[test]
    fn wide_id_and_explicit_length() {
        let entry = TlvEntry::resource(300, &Value::from("Open Mobile Alliance"));
        let bytes = encode(&[entry.clone()]);
        assert_eq!(&[0xE8u8, 0x01, 0x2C, 20], &bytes[..4]);
        assert_eq!(vec![entry], decode(&bytes).unwrap());
    }

    #[test]
    fn nested_instance() {
        let links = TlvEntry::container(
            TlvKind::MultipleResource,
            13,
            &[
                TlvEntry {
                    kind: TlvKind::ResourceInstance,
                    id: 0,
                    payload: encode_value(&Value::ObjLink(33629, 1)),
                },
            ],
        );
        let instance = TlvEntry::container(
            TlvKind::ObjectInstance,
            0,
            &[TlvEntry::resource(3, &Value::Integer(2)), links.clone()],
        );
        let bytes = encode(&[instance]);

        let decoded = decode(&bytes).unwrap();
        let children = decoded[0].children().unwrap();
        assert_eq!(2, children.len());
        assert_eq!(links, children[1]);
        let link = &children[1].children().unwrap()[0];
        assert_eq!(
            Value::ObjLink(33629, 1),
            decode_value(ValueKind::ObjLink, &link.payload).unwrap()
        );
    }

    #[test]
    fn integer_widths() {
        assert_eq!(vec![0x7F], encode_value(&Value::Integer(127)));
        assert_eq!(vec![0x00, 0x80], encode_value(&Value::Integer(128)));
        assert_eq!(vec![0xFF], encode_value(&Value::Integer(-1)));
        assert_eq!(
            Value::Integer(-2),
            decode_value(ValueKind::Integer, &[0xFF, 0xFE]).unwrap()
        );
        assert_eq!(
            Err(ResponseError::BadRequest),
            decode_value(ValueKind::Integer, &[0, 0, 0])
        );
    }

    #[test]
    fn truncated() {
        assert_eq!(Err(ResponseError::BadRequest), decode(&[0xC8, 0x03, 0x05, 0x01]));
        assert_eq!(Err(ResponseError::BadRequest), decode(&[0xE0]));
    }
}
