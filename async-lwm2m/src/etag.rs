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

use crate::util::fmt_hex;
use core::ops::Deref;

/// Resource-version marker for a download: the CoAP ETag option value, or an
/// HTTP entity tag with its weakness flag.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Ord, PartialOrd, Default)]
pub struct ETag {
    bytes: Vec<u8>,
    weak: bool,
}

impl ETag {
    /// Describes the maximum length of a CoAP ETag option (8 bytes).
    pub const MAX_COAP_LEN: usize = 8;

    /// Creates a new strong ETag from the given byte slice.
    pub fn new(x: &[u8]) -> ETag {
        ETag {
            bytes: x.to_vec(),
            weak: false,
        }
    }

    /// Creates an ETag with an explicit weakness flag.
    pub fn with_weak(x: &[u8], weak: bool) -> ETag {
        ETag {
            bytes: x.to_vec(),
            weak,
        }
    }

    /// Parses an HTTP `ETag` header value such as `"abc"` or `W/"abc"`.
    pub fn from_http_header(value: &str) -> Option<ETag> {
        let value = value.trim();
        let (weak, rest) = match value.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let inner = rest.strip_prefix('"')?.strip_suffix('"')?;
        Some(ETag {
            bytes: inner.as_bytes().to_vec(),
            weak,
        })
    }

    /// Formats this tag for an HTTP `If-Match` header.
    pub fn to_http_header(&self) -> String {
        let quoted = format!("\"{}\"", String::from_utf8_lossy(&self.bytes));
        if self.weak {
            format!("W/{}", quoted)
        } else {
            quoted
        }
    }

    /// Returns the length of this ETag in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the length of this ETag is zero.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns true for HTTP weak validators.
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Returns true if this tag can travel in a CoAP ETag option.
    pub fn fits_coap(&self) -> bool {
        !self.weak && !self.bytes.is_empty() && self.bytes.len() <= Self::MAX_COAP_LEN
    }

    /// Returns the value of this ETag as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Weak comparison, as used when deciding whether a resumed download may
    /// continue: the opaque values must match, weakness is ignored.
    pub fn weak_eq(&self, other: &ETag) -> bool {
        self.bytes == other.bytes
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.weak {
            f.write_str("W/")?;
        }
        fmt_hex(&self.bytes, f)
    }
}

impl Deref for ETag {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl core::convert::From<&[u8]> for ETag {
    fn from(x: &[u8]) -> Self {
        ETag::new(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_headers() {
        let strong = ETag::from_http_header("\"v1-abc\"").unwrap();
        assert_eq!(false, strong.is_weak());
        assert_eq!(b"v1-abc", strong.as_bytes());
        assert_eq!("\"v1-abc\"", strong.to_http_header());

        let weak = ETag::from_http_header(" W/\"v1-abc\"").unwrap();
        assert_eq!(true, weak.is_weak());
        assert!(weak.weak_eq(&strong));
        assert_ne!(weak, strong);
        assert_eq!("W/\"v1-abc\"", weak.to_http_header());

        assert_eq!(None, ETag::from_http_header("v1-abc"));
    }

    #[test]
    fn coap_fit() {
        assert!(ETag::new(&[1, 2, 3]).fits_coap());
        assert!(!ETag::new(&[0; 9]).fits_coap());
        assert_eq!("0A0B", ETag::new(&[10, 11]).to_string());
    }
}
