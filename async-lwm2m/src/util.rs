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

//! Integer helpers shared by option values, tokens and ETags.

/// Encodes an unsigned 32-bit number using the minimal number of big-endian
/// bytes. Zero encodes to an empty value, as CoAP uint options require.
pub fn encode_u32(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Attempts to decode the given big-endian integer to a `u32`.
/// Input may be up to four bytes long. If the input is larger than four
/// bytes long, returns `None`.
pub fn try_decode_u32(src: &[u8]) -> Option<u32> {
    if src.len() > 4 {
        return None;
    }
    Some(src.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Attempts to decode the given big-endian integer to a `u16`.
/// Input may be up to two bytes long. If the input is larger than two
/// bytes long, returns `None`.
pub fn try_decode_u16(src: &[u8]) -> Option<u16> {
    if src.len() > 2 {
        return None;
    }
    try_decode_u32(src).map(|x| x as u16)
}

/// Writes `bytes` as uppercase hex, used by the `Display` impls of tokens and ETags.
pub(crate) fn fmt_hex(bytes: &[u8], f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    for b in bytes {
        write!(f, "{:02X}", b)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::util::*;

    #[test]
    fn encode_decode_u32() {
        for i in vec![
            0x00, 0x01, 0x0FF, 0x100, 0x0FFFF, 0x10000, 0x0FFFFFF, 0x1000000, 0xFFFFFFFF,
        ] {
            assert_eq!(try_decode_u32(&encode_u32(i)).unwrap(), i);
        }

        assert_eq!(try_decode_u32(&[0; 5]), None);
    }

    #[test]
    fn minimal_lengths() {
        assert_eq!(Vec::<u8>::new(), encode_u32(0));
        assert_eq!(vec![0x01], encode_u32(1));
        assert_eq!(vec![0x01, 0x00], encode_u32(256));
        assert_eq!(vec![0x01, 0x00, 0x00, 0x00], encode_u32(1 << 24));
    }

    #[test]
    fn encode_decode_u16() {
        for i in (0u32..=core::u16::MAX as u32).step_by(7) {
            let enc = encode_u32(i);
            assert_eq!(try_decode_u16(&enc).unwrap(), i as u16, "enc:{:02x?}", enc);
        }

        assert_eq!(try_decode_u16(&[0; 3]), None);
    }
}
