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

//! Low-level message codec functions for the UDP (RFC 7252) and TCP (RFC 8323) framings.

use super::*;
use crate::option::MAX_OPTION_VALUE_SIZE;

/// Selects the wire framing of a CoAP message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Framing {
    /// RFC 7252: 4-byte header with version, type, token length, code and message id.
    Udp,

    /// RFC 8323: length/token-length nibble byte with extended length, then code.
    Tcp,
}

const COAP_VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;

/// Calculates the encoded size of a CoAP option.
pub fn calc_option_size(prev_key: OptionNumber, key: OptionNumber, mut value_len: usize) -> usize {
    if value_len >= 269 {
        value_len += 2;
    } else if value_len >= 13 {
        value_len += 1;
    }

    let option_delta = key.0 - prev_key.0;

    if option_delta >= 269 {
        value_len += 3;
    } else if option_delta >= 13 {
        value_len += 2;
    } else {
        value_len += 1;
    }

    value_len
}

/// Splits a delta or length into its nibble and extension bytes.
fn nibble_and_extension(value: usize, ext: &mut Vec<u8>) -> u8 {
    if value >= 269 {
        let rest = (value - 269) as u16;
        ext.extend_from_slice(&rest.to_be_bytes());
        14
    } else if value >= 13 {
        ext.push((value - 13) as u8);
        13
    } else {
        value as u8
    }
}

/// Appends one option, including its value, to `buffer`.
pub fn encode_option(
    buffer: &mut Vec<u8>,
    prev_key: OptionNumber,
    key: OptionNumber,
    value: &[u8],
) -> Result<(), Error> {
    if prev_key > key {
        return Err(Error::InvalidMessage);
    }

    if value.len() > MAX_OPTION_VALUE_SIZE {
        warn!("value_len:{}, max:{}", value.len(), MAX_OPTION_VALUE_SIZE);
        return Err(Error::InvalidMessage);
    }

    let mut ext = Vec::with_capacity(4);
    let delta_nibble = nibble_and_extension((key.0 - prev_key.0) as usize, &mut ext);
    let len_nibble = nibble_and_extension(value.len(), &mut ext);

    buffer.push((delta_nibble << 4) | len_nibble);
    buffer.extend_from_slice(&ext);
    buffer.extend_from_slice(value);

    Ok(())
}

/// Reads the extended form of a delta or length nibble.
fn read_extended(nibble: u8, iter: &mut core::slice::Iter<'_, u8>) -> Result<usize, Error> {
    let mut next = || iter.next().copied().ok_or(Error::InvalidMessage);
    match nibble {
        13 => Ok(13 + next()? as usize),
        14 => {
            let msb = next()? as usize;
            let lsb = next()? as usize;
            Ok(269 + ((msb << 8) | lsb))
        }
        15 => Err(Error::InvalidMessage),
        n => Ok(n as usize),
    }
}

/// Decodes one option from a `core::slice::Iter`, which can be obtained from a byte slice.
/// The iterator is then advanced to the next option.
///
/// Will return `Ok(None)` if it either encounters the end-of-options marker (0xFF) or if the
/// given iterator has been fully consumed. The marker itself is consumed.
pub fn decode_option<'a>(
    iter: &mut core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
) -> Result<Option<(OptionNumber, &'a [u8])>, Error> {
    let header = match iter.next() {
        Some(x) => *x,
        None => return Ok(None),
    };

    if header == PAYLOAD_MARKER {
        return Ok(None);
    }

    let key_delta = read_extended(header >> 4, iter)?;
    let len = read_extended(header & 0xF, iter)?;

    let number = last_option.0 as usize + key_delta;
    if number > u16::MAX as usize {
        // Don't let the key wrap.
        return Err(Error::InvalidMessage);
    }

    let rest = iter.as_slice();
    if rest.len() < len {
        return Err(Error::InvalidMessage);
    }

    let value = &rest[..len];
    *iter = rest[len..].iter();

    Ok(Some((OptionNumber(number as u16), value)))
}

/// Encodes the options, marker and payload shared by both framings.
fn encode_body(msg: &CoapMessage, buffer: &mut Vec<u8>) -> Result<(), Error> {
    let mut options: Vec<&CoapOption> = msg.options.iter().collect();
    options.sort_by_key(|opt| opt.number);

    let mut prev = OptionNumber(0);
    for opt in options {
        encode_option(buffer, prev, opt.number, &opt.value)?;
        prev = opt.number;
    }

    if !msg.payload.is_empty() {
        buffer.push(PAYLOAD_MARKER);
        buffer.extend_from_slice(&msg.payload);
    }

    Ok(())
}

/// Decodes options, marker and payload from what follows the token.
fn decode_body(body: &[u8], msg: &mut CoapMessage) -> Result<(), Error> {
    let mut iter = body.iter();
    let mut last = OptionNumber(0);

    while let Some((number, value)) = decode_option(&mut iter, last)? {
        msg.options.push(CoapOption {
            number,
            value: value.to_vec(),
        });
        last = number;
    }

    let consumed = body.len() - iter.as_slice().len();
    if consumed > 0 && body[consumed - 1] == PAYLOAD_MARKER {
        let payload = iter.as_slice();
        if payload.is_empty() {
            // A marker followed by a zero-length payload is a format error.
            return Err(Error::InvalidMessage);
        }
        msg.payload = payload.to_vec();
    }

    Ok(())
}

/// Serializes `msg` with the given framing.
///
/// Fails with [`Error::InvalidMessage`] if a UDP message lacks its type or
/// message id, or if an option cannot be represented.
pub fn encode(msg: &CoapMessage, framing: Framing) -> Result<Vec<u8>, Error> {
    let token = msg.token.as_bytes();
    if token.len() > MsgToken::MAX_LEN {
        return Err(Error::InvalidMessage);
    }

    let mut body = Vec::with_capacity(msg.payload.len() + 16);
    encode_body(msg, &mut body)?;

    let mut out = Vec::with_capacity(body.len() + token.len() + 6);

    match framing {
        Framing::Udp => {
            let msg_type = msg.msg_type.ok_or(Error::InvalidMessage)?;
            let msg_id = msg.msg_id.ok_or(Error::InvalidMessage)?;
            out.push((COAP_VERSION << 6) | ((msg_type as u8) << 4) | token.len() as u8);
            out.push(msg.code.0);
            out.extend_from_slice(&msg_id.to_be_bytes());
        }
        Framing::Tcp => {
            let len = body.len();
            let (nibble, ext): (u8, Vec<u8>) = if len < 13 {
                (len as u8, vec![])
            } else if len < 269 {
                (13, vec![(len - 13) as u8])
            } else if len < 65805 {
                (14, ((len - 269) as u16).to_be_bytes().to_vec())
            } else {
                let rest = u32::try_from(len - 65805).map_err(|_| Error::InvalidMessage)?;
                (15, rest.to_be_bytes().to_vec())
            };
            out.push((nibble << 4) | token.len() as u8);
            out.extend_from_slice(&ext);
            out.push(msg.code.0);
        }
    }

    out.extend_from_slice(token);
    out.extend_from_slice(&body);

    Ok(out)
}

/// Parses a single message with the given framing. The whole buffer must be
/// consumed by the message.
pub fn decode(buf: &[u8], framing: Framing) -> Result<CoapMessage, Error> {
    let mut msg = CoapMessage::default();

    let rest = match framing {
        Framing::Udp => {
            if buf.len() < 4 {
                return Err(Error::InvalidMessage);
            }
            if buf[0] >> 6 != COAP_VERSION {
                return Err(Error::InvalidMessage);
            }
            let tkl = (buf[0] & 0xF) as usize;
            if tkl > MsgToken::MAX_LEN || buf.len() < 4 + tkl {
                return Err(Error::InvalidMessage);
            }
            msg.msg_type = MsgType::try_from((buf[0] >> 4) & 0b11);
            msg.code = MsgCode(buf[1]);
            msg.msg_id = Some(u16::from_be_bytes([buf[2], buf[3]]));
            msg.token = MsgToken::new(&buf[4..4 + tkl])?;

            let rest = &buf[4 + tkl..];
            if msg.code.is_empty() && !rest.is_empty() {
                return Err(Error::InvalidMessage);
            }
            rest
        }
        Framing::Tcp => {
            let (header_len, body_len) = tcp_header(buf)?.ok_or(Error::InvalidMessage)?;
            let tkl = (buf[0] & 0xF) as usize;
            if tkl > MsgToken::MAX_LEN {
                return Err(Error::InvalidMessage);
            }
            if buf.len() != header_len + tkl + body_len {
                return Err(Error::InvalidMessage);
            }
            msg.code = MsgCode(buf[header_len - 1]);
            msg.token = MsgToken::new(&buf[header_len..header_len + tkl])?;
            &buf[header_len + tkl..]
        }
    };

    decode_body(rest, &mut msg)?;

    Ok(msg)
}

/// Parses the length part of a TCP frame header.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the size of the
/// header (including the code byte) and the length of the options+payload part.
fn tcp_header(buf: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let first = match buf.first() {
        Some(b) => *b,
        None => return Ok(None),
    };

    let ext_len = match first >> 4 {
        13 => 1,
        14 => 2,
        15 => 4,
        _ => 0,
    };

    if buf.len() < 1 + ext_len + 1 {
        return Ok(None);
    }

    let ext = &buf[1..1 + ext_len];
    let body_len = match first >> 4 {
        13 => 13 + ext[0] as usize,
        14 => 269 + u16::from_be_bytes([ext[0], ext[1]]) as usize,
        15 => 65805 + u32::from_be_bytes([ext[0], ext[1], ext[2], ext[3]]) as usize,
        n => n as usize,
    };

    Ok(Some((1 + ext_len + 1, body_len)))
}

/// Returns the total size of the TCP frame at the start of `buf`, or `None`
/// if the header itself is not complete yet. Used to cut frames out of a
/// byte stream.
pub fn tcp_frame_len(buf: &[u8]) -> Option<usize> {
    let (header_len, body_len) = tcp_header(buf).ok()??;
    let tkl = (buf[0] & 0xF) as usize;
    Some(header_len + tkl + body_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc7252_fig16() {
        // CON GET, MID 0x7d34, Uri-Path "temperature", no token.
        let bytes = [
            0x40, 0x01, 0x7d, 0x34, 0xbb, b't', b'e', b'm', b'p', b'e', b'r', b'a', b't', b'u',
            b'r', b'e',
        ];
        let msg = decode(&bytes, Framing::Udp).unwrap();
        assert_eq!(Some(MsgType::Con), msg.msg_type);
        assert_eq!(MsgCode::GET, msg.code);
        assert_eq!(Some(0x7d34), msg.msg_id);
        assert_eq!(vec!["temperature"], msg.uri_path());
        assert_eq!(bytes.to_vec(), encode(&msg, Framing::Udp).unwrap());
    }

    #[test]
    fn rfc7252_fig17() {
        // ACK 2.05 with payload "22.3 C".
        let bytes = [
            0x60, 0x45, 0x7d, 0x34, 0xff, b'2', b'2', b'.', b'3', b' ', b'C',
        ];
        let msg = decode(&bytes, Framing::Udp).unwrap();
        assert_eq!(Some(MsgType::Ack), msg.msg_type);
        assert_eq!(MsgCode::CONTENT, msg.code);
        assert_eq!(b"22.3 C".to_vec(), msg.payload);
        assert_eq!(bytes.to_vec(), encode(&msg, Framing::Udp).unwrap());
    }

    #[test]
    fn options_sorted_on_encode() {
        let msg = CoapMessage::request(MsgCode::PUT)
            .with_msg_id(1)
            .with_option(option::CONTENT_FORMAT, ContentFormat::TEXT_PLAIN)
            .with_uri_path("5/0/1")
            .with_option(option::BLOCK1, BlockInfo::new(0, true, 0).unwrap())
            .with_payload(&b"x"[..]);
        let decoded = decode(&encode(&msg, Framing::Udp).unwrap(), Framing::Udp).unwrap();
        assert_eq!(msg.sorted(), decoded);
    }

    #[test]
    fn extended_deltas_and_lengths() {
        let long_value = vec![b'a'; 300];
        let msg = CoapMessage::request(MsgCode::POST)
            .with_msg_id(9)
            .with_option(option::SIZE1, 1024)
            .with_option(option::URI_QUERY, String::from_utf8(long_value).unwrap());
        let bytes = encode(&msg, Framing::Udp).unwrap();
        assert_eq!(msg.clone().sorted(), decode(&bytes, Framing::Udp).unwrap());
    }

    #[test]
    fn udp_decode_failures() {
        // Version 2.
        assert_eq!(
            Err(Error::InvalidMessage),
            decode(&[0x80, 0x01, 0, 1], Framing::Udp)
        );
        // Token length 9.
        assert_eq!(
            Err(Error::InvalidMessage),
            decode(&[0x49, 0x01, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0], Framing::Udp)
        );
        // Marker with empty payload.
        assert_eq!(
            Err(Error::InvalidMessage),
            decode(&[0x40, 0x01, 0, 1, 0xFF], Framing::Udp)
        );
        // Delta nibble 15 outside the marker.
        assert_eq!(
            Err(Error::InvalidMessage),
            decode(&[0x40, 0x01, 0, 1, 0xF1, 0], Framing::Udp)
        );
        // Option length past the end.
        assert_eq!(
            Err(Error::InvalidMessage),
            decode(&[0x40, 0x01, 0, 1, 0xB5, b'a'], Framing::Udp)
        );
        // Truncated header.
        assert_eq!(Err(Error::InvalidMessage), decode(&[0x40, 0x01], Framing::Udp));
    }

    #[test]
    fn udp_requires_type_and_id() {
        let msg = CoapMessage::stream(MsgCode::GET);
        assert_eq!(Err(Error::InvalidMessage), encode(&msg, Framing::Udp));
    }

    #[test]
    fn tcp_lengths() {
        for len in [0usize, 12, 13, 268, 269, 65804, 65805] {
            let mut msg = CoapMessage::stream(MsgCode::CONTENT).with_token(MsgToken::from(0xABu32));
            if len > 0 {
                // One byte for the marker.
                msg.payload = vec![0x55; len - 1];
            }
            let bytes = encode(&msg, Framing::Tcp).unwrap();
            assert_eq!(Some(bytes.len()), tcp_frame_len(&bytes), "len {}", len);
            let expect_nibble = match len {
                0..=12 => len as u8,
                13..=268 => 13,
                269..=65804 => 14,
                _ => 15,
            };
            assert_eq!(expect_nibble, bytes[0] >> 4, "len {}", len);
            assert_eq!(msg, decode(&bytes, Framing::Tcp).unwrap());
        }
    }

    #[test]
    fn tcp_truncated() {
        let msg = CoapMessage::stream(MsgCode::CONTENT).with_payload(vec![1u8; 20]);
        let bytes = encode(&msg, Framing::Tcp).unwrap();
        assert_eq!(
            Err(Error::InvalidMessage),
            decode(&bytes[..bytes.len() - 1], Framing::Tcp)
        );
        assert_eq!(None, tcp_frame_len(&bytes[..1]));
    }
}
