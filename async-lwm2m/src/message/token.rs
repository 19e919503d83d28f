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

use crate::util::{encode_u32, fmt_hex};
use crate::Error;
use core::ops::Deref;
use rand::Rng;

/// Type for holding the value of a CoAP message token.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct MsgToken {
    len: u8,
    bytes: [u8; 8],
}

impl MsgToken {
    /// Maximum token length on the wire.
    pub const MAX_LEN: usize = 8;

    /// Constant representing an empty token.
    pub const EMPTY: MsgToken = MsgToken {
        len: 0u8,
        bytes: [0; 8],
    };

    /// Creates a new token from the given byte slice, failing with
    /// [`Error::InvalidMessage`] if it is longer than eight bytes.
    pub fn new(x: &[u8]) -> Result<MsgToken, Error> {
        if x.len() > Self::MAX_LEN {
            return Err(Error::InvalidMessage);
        }
        let mut bytes = [0u8; 8];
        bytes[..x.len()].copy_from_slice(x);
        Ok(MsgToken {
            len: x.len() as u8,
            bytes,
        })
    }

    /// Draws a random token of `len` bytes (clamped to eight).
    pub fn random<R: Rng>(rng: &mut R, len: usize) -> MsgToken {
        let len = len.min(Self::MAX_LEN);
        let mut bytes = [0u8; 8];
        rng.fill(&mut bytes[..len]);
        MsgToken {
            len: len as u8,
            bytes,
        }
    }

    /// Returns the length of this token.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the length of this token is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a byte slice containing this token.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for MsgToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(self.as_bytes(), f)
    }
}

impl Default for MsgToken {
    fn default() -> Self {
        MsgToken::EMPTY
    }
}

impl Deref for MsgToken {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl core::cmp::PartialEq<[u8]> for MsgToken {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl core::convert::From<u32> for MsgToken {
    fn from(x: u32) -> Self {
        let encoded = encode_u32(x);
        let mut bytes = [0u8; 8];
        bytes[..encoded.len()].copy_from_slice(&encoded);
        MsgToken {
            len: encoded.len() as u8,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn lengths() {
        assert_eq!(Err(Error::InvalidMessage), MsgToken::new(&[0; 9]));
        assert_eq!(8, MsgToken::new(&[1; 8]).unwrap().len());
        assert_eq!(&[0x12, 0x34][..], MsgToken::from(0x1234u32).as_bytes());
        assert!(MsgToken::from(0u32).is_empty());
    }

    #[test]
    fn random_tokens_differ() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = MsgToken::random(&mut rng, 8);
        let b = MsgToken::random(&mut rng, 8);
        assert_eq!(8, a.len());
        assert_ne!(a, b);
    }
}
