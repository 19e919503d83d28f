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

use std::fmt::{Debug, Display, Formatter};

/// A CoAP message code, `class.detail`.
///
/// Stored as the raw wire byte so that codes this library does not name
/// still survive a decode/encode cycle.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct MsgCode(pub u8);

impl MsgCode {
    /// Builds a code from its class and detail parts.
    pub const fn new(class: u8, detail: u8) -> MsgCode {
        MsgCode(((class & 0x7) << 5) | (detail & 0x1F))
    }

    /// Empty message code. Only used for ping requests, resets, and empty acknowledgements.
    pub const EMPTY: MsgCode = MsgCode::new(0, 0);

    /// CoAP GET method.
    pub const GET: MsgCode = MsgCode::new(0, 1);

    /// CoAP POST method.
    pub const POST: MsgCode = MsgCode::new(0, 2);

    /// CoAP PUT method.
    pub const PUT: MsgCode = MsgCode::new(0, 3);

    /// CoAP DELETE method.
    pub const DELETE: MsgCode = MsgCode::new(0, 4);

    /// CoAP FETCH method.
    pub const FETCH: MsgCode = MsgCode::new(0, 5);

    /// CoAP iPATCH method.
    pub const IPATCH: MsgCode = MsgCode::new(0, 7);

    /// 2.01 Created.
    pub const CREATED: MsgCode = MsgCode::new(2, 1);

    /// 2.02 Deleted.
    pub const DELETED: MsgCode = MsgCode::new(2, 2);

    /// 2.03 Valid.
    pub const VALID: MsgCode = MsgCode::new(2, 3);

    /// 2.04 Changed.
    pub const CHANGED: MsgCode = MsgCode::new(2, 4);

    /// 2.05 Content.
    pub const CONTENT: MsgCode = MsgCode::new(2, 5);

    /// 2.31 Continue.
    pub const CONTINUE: MsgCode = MsgCode::new(2, 31);

    /// 4.00 Bad Request.
    pub const BAD_REQUEST: MsgCode = MsgCode::new(4, 0);

    /// 4.01 Unauthorized.
    pub const UNAUTHORIZED: MsgCode = MsgCode::new(4, 1);

    /// 4.02 Bad Option.
    pub const BAD_OPTION: MsgCode = MsgCode::new(4, 2);

    /// 4.03 Forbidden.
    pub const FORBIDDEN: MsgCode = MsgCode::new(4, 3);

    /// 4.04 Not Found.
    pub const NOT_FOUND: MsgCode = MsgCode::new(4, 4);

    /// 4.05 Method Not Allowed.
    pub const METHOD_NOT_ALLOWED: MsgCode = MsgCode::new(4, 5);

    /// 4.06 Not Acceptable.
    pub const NOT_ACCEPTABLE: MsgCode = MsgCode::new(4, 6);

    /// 4.08 Request Entity Incomplete.
    pub const REQUEST_ENTITY_INCOMPLETE: MsgCode = MsgCode::new(4, 8);

    /// 4.12 Precondition Failed.
    pub const PRECONDITION_FAILED: MsgCode = MsgCode::new(4, 12);

    /// 4.13 Request Entity Too Large.
    pub const REQUEST_ENTITY_TOO_LARGE: MsgCode = MsgCode::new(4, 13);

    /// 4.15 Unsupported Content-Format.
    pub const UNSUPPORTED_CONTENT_FORMAT: MsgCode = MsgCode::new(4, 15);

    /// 5.00 Internal Server Error.
    pub const INTERNAL_SERVER_ERROR: MsgCode = MsgCode::new(5, 0);

    /// 5.01 Not Implemented.
    pub const NOT_IMPLEMENTED: MsgCode = MsgCode::new(5, 1);

    /// 5.03 Service Unavailable.
    pub const SERVICE_UNAVAILABLE: MsgCode = MsgCode::new(5, 3);

    /// 5.04 Gateway Timeout.
    pub const GATEWAY_TIMEOUT: MsgCode = MsgCode::new(5, 4);

    /// 7.01 CSM signal (TCP framing only).
    pub const CSM: MsgCode = MsgCode::new(7, 1);

    /// 7.02 Ping signal (TCP framing only).
    pub const PING: MsgCode = MsgCode::new(7, 2);

    /// 7.03 Pong signal (TCP framing only).
    pub const PONG: MsgCode = MsgCode::new(7, 3);

    /// 7.04 Release signal (TCP framing only).
    pub const RELEASE: MsgCode = MsgCode::new(7, 4);

    /// 7.05 Abort signal (TCP framing only).
    pub const ABORT: MsgCode = MsgCode::new(7, 5);

    /// The class part of the code (the digit before the dot).
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The detail part of the code (the two digits after the dot).
    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Returns true if this is the empty code.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn in_class(self, class: u8) -> bool {
        !self.is_empty() && self.class() == class
    }

    /// Returns true for request methods (0.01 and up).
    pub fn is_method(self) -> bool {
        self.in_class(0)
    }

    /// Returns true for 2.xx codes.
    pub fn is_success(self) -> bool {
        self.in_class(2)
    }

    /// Returns true for 4.xx and 5.xx codes.
    pub fn is_error(self) -> bool {
        self.in_class(4) || self.in_class(5)
    }

    /// Returns true for any response class.
    pub fn is_response(self) -> bool {
        self.is_success() || self.is_error()
    }

    /// Signals only exist over reliable transports (class 7).
    pub fn is_signal(self) -> bool {
        self.in_class(7)
    }

    /// Human-readable name for the codes this library names.
    pub fn static_name(self) -> Option<&'static str> {
        Some(match self {
            MsgCode::EMPTY => "Empty",
            MsgCode::GET => "GET",
            MsgCode::POST => "POST",
            MsgCode::PUT => "PUT",
            MsgCode::DELETE => "DELETE",
            MsgCode::FETCH => "FETCH",
            MsgCode::IPATCH => "iPATCH",
            MsgCode::CREATED => "Created",
            MsgCode::DELETED => "Deleted",
            MsgCode::VALID => "Valid",
            MsgCode::CHANGED => "Changed",
            MsgCode::CONTENT => "Content",
            MsgCode::CONTINUE => "Continue",
            MsgCode::BAD_REQUEST => "Bad Request",
            MsgCode::UNAUTHORIZED => "Unauthorized",
            MsgCode::BAD_OPTION => "Bad Option",
            MsgCode::FORBIDDEN => "Forbidden",
            MsgCode::NOT_FOUND => "Not Found",
            MsgCode::METHOD_NOT_ALLOWED => "Method Not Allowed",
            MsgCode::NOT_ACCEPTABLE => "Not Acceptable",
            MsgCode::REQUEST_ENTITY_INCOMPLETE => "Request Entity Incomplete",
            MsgCode::PRECONDITION_FAILED => "Precondition Failed",
            MsgCode::REQUEST_ENTITY_TOO_LARGE => "Request Entity Too Large",
            MsgCode::UNSUPPORTED_CONTENT_FORMAT => "Unsupported Content-Format",
            MsgCode::INTERNAL_SERVER_ERROR => "Internal Server Error",
            MsgCode::NOT_IMPLEMENTED => "Not Implemented",
            MsgCode::SERVICE_UNAVAILABLE => "Service Unavailable",
            MsgCode::GATEWAY_TIMEOUT => "Gateway Timeout",
            MsgCode::CSM => "CSM",
            MsgCode::PING => "Ping",
            MsgCode::PONG => "Pong",
            MsgCode::RELEASE => "Release",
            MsgCode::ABORT => "Abort",
            _ => return None,
        })
    }
}

impl Display for MsgCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl Debug for MsgCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.static_name() {
            Some(name) => write!(f, "{} {}", self, name),
            None => write!(f, "{}", self),
        }
    }
}

impl core::convert::From<MsgCode> for u8 {
    fn from(code: MsgCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(0x45, MsgCode::CONTENT.0);
        assert_eq!(0x5F, MsgCode::CONTINUE.0);
        assert_eq!(0xA3, MsgCode::SERVICE_UNAVAILABLE.0);
        assert!(MsgCode::GET.is_method());
        assert!(!MsgCode::EMPTY.is_method());
        assert!(MsgCode::NOT_FOUND.is_response());
        assert!(MsgCode::PING.is_signal());
        assert!(!MsgCode::new(3, 1).is_response());
        assert!(MsgCode::new(5, 9).is_error());
        assert_eq!("4.08", MsgCode::REQUEST_ENTITY_INCOMPLETE.to_string());
        assert_eq!("2.31 Continue", format!("{:?}", MsgCode::CONTINUE));
    }
}
