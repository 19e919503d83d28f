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

/// A type for representing a CoAP Content Format value.
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone, Ord, PartialOrd)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    /// From IETF-RFC7252.
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);

    /// From IETF-RFC7252.
    pub const APPLICATION_LINK_FORMAT: ContentFormat = ContentFormat(40);

    /// From IETF-RFC7252.
    pub const APPLICATION_OCTET_STREAM: ContentFormat = ContentFormat(42);

    /// From IETF-RFC7252.
    pub const APPLICATION_JSON: ContentFormat = ContentFormat(50);

    /// From IETF-RFC7049 Concise Binary Object Representation (CBOR)
    pub const APPLICATION_CBOR: ContentFormat = ContentFormat(60);

    /// JSON-formatted RFC8428 Sensor Measurement Lists (SenML)
    pub const APPLICATION_SENML_JSON: ContentFormat = ContentFormat(110);

    /// CBOR-formatted RFC8428 Sensor Measurement Lists (SenML)
    pub const APPLICATION_SENML_CBOR: ContentFormat = ContentFormat(112);

    /// Pre-registration number of LwM2M TLV used by LwM2M 1.0 clients.
    pub const LWM2M_TLV_LEGACY: ContentFormat = ContentFormat(1542);

    /// Pre-registration number of LwM2M JSON used by LwM2M 1.0 clients.
    pub const LWM2M_JSON_LEGACY: ContentFormat = ContentFormat(1543);

    /// Pre-registration number of opaque LwM2M content.
    pub const LWM2M_OPAQUE_LEGACY: ContentFormat = ContentFormat(1544);

    /// Registered number of LwM2M TLV.
    pub const LWM2M_TLV: ContentFormat = ContentFormat(11542);

    /// Registered number of LwM2M JSON.
    pub const LWM2M_JSON: ContentFormat = ContentFormat(11543);

    /// Registered number of LwM2M CBOR.
    pub const LWM2M_CBOR: ContentFormat = ContentFormat(11544);

    /// Returns the MIME name of this content format as a `&'static str`, if possible.
    pub fn static_name(self) -> Option<&'static str> {
        Some(match self {
            Self::TEXT_PLAIN => "text/plain;charset=utf-8",
            Self::APPLICATION_LINK_FORMAT => "application/link-format",
            Self::APPLICATION_OCTET_STREAM => "application/octet-stream",
            Self::APPLICATION_JSON => "application/json",
            Self::APPLICATION_CBOR => "application/cbor",
            Self::APPLICATION_SENML_JSON => "application/senml+json",
            Self::APPLICATION_SENML_CBOR => "application/senml+cbor",
            Self::LWM2M_TLV_LEGACY | Self::LWM2M_TLV => "application/vnd.oma.lwm2m+tlv",
            Self::LWM2M_JSON_LEGACY | Self::LWM2M_JSON => "application/vnd.oma.lwm2m+json",
            Self::LWM2M_OPAQUE_LEGACY => "application/vnd.oma.lwm2m+opaque",
            Self::LWM2M_CBOR => "application/vnd.oma.lwm2m+cbor",
            _ => return None,
        })
    }

    /// Collapses the pre-registration LwM2M numbers onto their registered equivalents.
    pub fn canonical(self) -> ContentFormat {
        match self {
            Self::LWM2M_TLV_LEGACY => Self::LWM2M_TLV,
            Self::LWM2M_JSON_LEGACY => Self::LWM2M_JSON,
            Self::LWM2M_OPAQUE_LEGACY => Self::APPLICATION_OCTET_STREAM,
            other => other,
        }
    }

    /// Returns true if this content format is known to contain UTF8.
    pub fn is_utf8(self) -> bool {
        match self {
            Self::TEXT_PLAIN => true,
            Self::APPLICATION_LINK_FORMAT => true,
            _ => self.is_json(),
        }
    }

    /// Returns true if this content format is known to contain JSON.
    pub fn is_json(self) -> bool {
        matches!(
            self.canonical(),
            Self::APPLICATION_JSON | Self::APPLICATION_SENML_JSON | Self::LWM2M_JSON
        )
    }

    /// Returns true if this content format is known to contain CBOR.
    pub fn is_cbor(self) -> bool {
        matches!(
            self,
            Self::APPLICATION_CBOR | Self::APPLICATION_SENML_CBOR | Self::LWM2M_CBOR
        )
    }
}

impl core::fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(name) = self.static_name() {
            f.write_str(name)
        } else {
            write!(f, "application/x-coap-{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_numbers() {
        assert_eq!(ContentFormat::LWM2M_TLV, ContentFormat(1542).canonical());
        assert_eq!(ContentFormat::LWM2M_JSON, ContentFormat(1543).canonical());
        assert_eq!(ContentFormat(11544), ContentFormat::LWM2M_CBOR.canonical());
        assert!(ContentFormat(1543).is_json());
        assert!(ContentFormat::APPLICATION_SENML_CBOR.is_cbor());
        assert_eq!("application/x-coap-999", ContentFormat(999).to_string());
    }
}
