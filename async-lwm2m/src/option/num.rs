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
use crate::util::{fmt_hex, try_decode_u16, try_decode_u32};

/// A CoAP option number.
///
/// Odd numbers are critical: a receiver that does not know one must reject
/// the message. Bit 1 marks options a proxy may not forward blindly.
#[derive(Copy, Eq, PartialEq, Hash, Clone, Ord, PartialOrd, Default)]
pub struct OptionNumber(pub u16);

/// The options this crate knows, with their names and value formats.
const REGISTRY: &[(OptionNumber, &str, OptionValueType)] = &[
    (OptionNumber::IF_MATCH, "If-Match", OptionValueType::Opaque),
    (OptionNumber::URI_HOST, "Uri-Host", OptionValueType::String),
    (OptionNumber::ETAG, "ETag", OptionValueType::Opaque),
    (OptionNumber::IF_NONE_MATCH, "If-None-Match", OptionValueType::Flag),
    (OptionNumber::OBSERVE, "Observe", OptionValueType::Integer),
    (OptionNumber::URI_PORT, "Uri-Port", OptionValueType::Integer),
    (OptionNumber::LOCATION_PATH, "Location-Path", OptionValueType::String),
    (OptionNumber::URI_PATH, "Uri-Path", OptionValueType::String),
    (OptionNumber::CONTENT_FORMAT, "Content-Format", OptionValueType::ContentFormat),
    (OptionNumber::MAX_AGE, "Max-Age", OptionValueType::Integer),
    (OptionNumber::URI_QUERY, "Uri-Query", OptionValueType::String),
    (OptionNumber::ACCEPT, "Accept", OptionValueType::ContentFormat),
    (OptionNumber::LOCATION_QUERY, "Location-Query", OptionValueType::String),
    (OptionNumber::BLOCK2, "Block2", OptionValueType::Block),
    (OptionNumber::BLOCK1, "Block1", OptionValueType::Block),
    (OptionNumber::SIZE2, "Size2", OptionValueType::Integer),
    (OptionNumber::PROXY_URI, "Proxy-Uri", OptionValueType::String),
    (OptionNumber::SIZE1, "Size1", OptionValueType::Integer),
];

impl OptionNumber {
    /// If-Match, RFC 7252.
    pub const IF_MATCH: OptionNumber = OptionNumber(1);
    /// Uri-Host.
    pub const URI_HOST: OptionNumber = OptionNumber(3);
    /// ETag.
    pub const ETAG: OptionNumber = OptionNumber(4);
    /// If-None-Match.
    pub const IF_NONE_MATCH: OptionNumber = OptionNumber(5);
    /// Observe, RFC 7641.
    pub const OBSERVE: OptionNumber = OptionNumber(6);
    /// Uri-Port.
    pub const URI_PORT: OptionNumber = OptionNumber(7);
    /// Location-Path; carries the registration handle.
    pub const LOCATION_PATH: OptionNumber = OptionNumber(8);
    /// Uri-Path.
    pub const URI_PATH: OptionNumber = OptionNumber(11);
    /// Content-Format.
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);
    /// Max-Age.
    pub const MAX_AGE: OptionNumber = OptionNumber(14);
    /// Uri-Query; carries registration parameters and write-attributes.
    pub const URI_QUERY: OptionNumber = OptionNumber(15);
    /// Accept.
    pub const ACCEPT: OptionNumber = OptionNumber(17);
    /// Location-Query.
    pub const LOCATION_QUERY: OptionNumber = OptionNumber(20);
    /// Block2, RFC 7959.
    pub const BLOCK2: OptionNumber = OptionNumber(23);
    /// Block1, RFC 7959.
    pub const BLOCK1: OptionNumber = OptionNumber(27);
    /// Size2.
    pub const SIZE2: OptionNumber = OptionNumber(28);
    /// Proxy-Uri.
    pub const PROXY_URI: OptionNumber = OptionNumber(35);
    /// Size1.
    pub const SIZE1: OptionNumber = OptionNumber(60);

    fn entry(self) -> Option<&'static (OptionNumber, &'static str, OptionValueType)> {
        REGISTRY.iter().find(|(number, _, _)| *number == self)
    }

    /// True for critical options.
    pub fn is_critical(self) -> bool {
        self.0 & 1 == 1
    }

    /// True for options marked unsafe to forward.
    pub fn is_un_safe(self) -> bool {
        self.0 & 2 == 2
    }

    /// The value format of this option; opaque when unknown.
    pub fn option_value_type(self) -> OptionValueType {
        self.entry()
            .map(|(_, _, kind)| *kind)
            .unwrap_or(OptionValueType::Opaque)
    }

    /// True if this library knows how to act on the option.
    /// Critical options outside this set must be rejected with 4.02.
    pub fn is_recognized(self) -> bool {
        self.entry().is_some()
    }

    /// The registered name, if known.
    pub fn static_name(self) -> Option<&'static str> {
        self.entry().map(|(_, name, _)| *name)
    }

    /// Writes the option name and its value rendered by value format, as
    /// used in message logs.
    pub fn fmt_with_value(self, f: &mut std::fmt::Formatter<'_>, value: &[u8]) -> std::fmt::Result {
        write!(f, "{}", self)?;
        let rendered = match self.option_value_type() {
            OptionValueType::Opaque | OptionValueType::Flag => {
                if !value.is_empty() {
                    f.write_str(":")?;
                    fmt_hex(value, f)?;
                }
                return Ok(());
            }
            OptionValueType::Integer => try_decode_u32(value).map(|i| i.to_string()),
            OptionValueType::Block => try_decode_u32(value).map(|i| BlockInfo(i).to_string()),
            OptionValueType::ContentFormat => {
                try_decode_u16(value).map(|i| ContentFormat(i).to_string())
            }
            OptionValueType::String => std::str::from_utf8(value).ok().map(|s| format!("{:?}", s)),
        };
        match rendered {
            Some(text) => write!(f, ":{}", text),
            None => f.write_str("ERR"),
        }
    }
}

impl core::fmt::Display for OptionNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(name) = self.static_name() {
            return f.write_str(name);
        }
        let class = if self.is_critical() { "Crit" } else { "Opt" };
        let safety = if self.is_un_safe() { "UnSafe-" } else { "" };
        write!(f, "{}-{}{}", class, safety, self.0)
    }
}

impl core::fmt::Debug for OptionNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({})", self.0, self)
    }
}
