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
use crate::util::{encode_u32, try_decode_u16, try_decode_u32};

/// Type describing the type of an option's value.
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone)]
pub enum OptionValueType {
    /// Opaque option value.
    Opaque,

    /// Option value is determined by the presence or absence of the option.
    Flag,

    /// Integer value.
    Integer,

    /// UTF8 string value.
    String,

    /// Integer value containing a `ContentFormat`.
    ContentFormat,

    /// Integer value containing a `BlockInfo`.
    Block,
}

/// Conversion between a typed option value and its wire bytes.
pub trait OptionValue: Sized {
    /// Encodes this value as option bytes.
    fn encode_value(&self) -> Vec<u8>;

    /// Decodes option bytes, returning `None` when they are not a valid encoding.
    fn decode_value(bytes: &[u8]) -> Option<Self>;
}

impl OptionValue for () {
    fn encode_value(&self) -> Vec<u8> {
        Vec::new()
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            Some(())
        } else {
            None
        }
    }
}

impl OptionValue for u32 {
    fn encode_value(&self) -> Vec<u8> {
        encode_u32(*self)
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        try_decode_u32(bytes)
    }
}

impl OptionValue for u16 {
    fn encode_value(&self) -> Vec<u8> {
        encode_u32(*self as u32)
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        try_decode_u16(bytes)
    }
}

impl OptionValue for String {
    fn encode_value(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

impl OptionValue for Vec<u8> {
    fn encode_value(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        Some(bytes.to_vec())
    }
}

impl OptionValue for ETag {
    fn encode_value(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > ETag::MAX_COAP_LEN {
            None
        } else {
            Some(ETag::new(bytes))
        }
    }
}

impl OptionValue for ContentFormat {
    fn encode_value(&self) -> Vec<u8> {
        encode_u32(self.0 as u32)
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        try_decode_u16(bytes).map(ContentFormat)
    }
}

impl OptionValue for BlockInfo {
    fn encode_value(&self) -> Vec<u8> {
        encode_u32(self.0)
    }

    fn decode_value(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > 3 {
            return None;
        }
        try_decode_u32(bytes).and_then(|x| BlockInfo(x).valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_values() {
        let block = BlockInfo::new(1, true, 6).unwrap();
        assert_eq!(vec![0x1E], block.encode_value());
        assert_eq!(Some(block), BlockInfo::decode_value(&[0x1E]));
        assert_eq!(None, BlockInfo::decode_value(&[0x17]));
        assert_eq!(None, BlockInfo::decode_value(&[0, 0, 0, 1]));
    }

    #[test]
    fn flag_values() {
        assert_eq!(Some(()), <()>::decode_value(&[]));
        assert_eq!(None, <()>::decode_value(&[0]));
    }
}
