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

use crate::message::MsgCode;
use std::fmt::{Debug, Display, Formatter};

/// Type for errors encountered while encoding, sending or receiving CoAP messages.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// One or more of the supplied arguments are not valid for the given operation.
    InvalidArgument,

    /// There is not enough space in the given buffer to complete the operation.
    OutOfSpace,

    /// The bytes do not form a well-formed CoAP message for the selected framing.
    InvalidMessage,

    /// A message template still carries a wildcard where a concrete value is required.
    PlaceholderRemaining,

    /// The [message code][crate::message::MsgCode] does not belong to a known class.
    UnknownMessageCode,

    /// An option value was malformed or not acceptable at this point of a transfer.
    BadOption,

    /// Operation timed out waiting for a response.
    ResponseTimeout,

    /// The transport failed, the handshake failed, or the exchange ran past its deadline.
    ConnectionLost,

    /// This operation has been cancelled.
    Cancelled,

    /// The transaction was reset by the peer.
    Reset,

    /// The remote resource changed while it was being transferred.
    ResourceChanged,

    /// An I/O error occurred while performing this operation.
    IOError,

    /// Unable to look up the given host because it was not found.
    HostNotFound,

    /// The given URI scheme is not supported by the associated transport.
    UnsupportedUriScheme,

    /// The transport has no peer to send to.
    NotConnected,

    /// An unspecified error has occurred.
    Unspecified,
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Error::ConnectionLost,
            ErrorKind::NotConnected => Error::NotConnected,
            ErrorKind::TimedOut => Error::ResponseTimeout,
            _ => Error::IOError,
        }
    }
}

impl std::convert::From<Error> for core::fmt::Error {
    fn from(_: Error) -> Self {
        core::fmt::Error
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl Default for Error {
    fn default() -> Self {
        Error::Unspecified
    }
}

/// Protocol-level failure answered inline to the peer that caused it.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, thiserror::Error)]
pub enum ResponseError {
    /// 4.00
    #[error("4.00 Bad Request")]
    BadRequest,

    /// 4.01
    #[error("4.01 Unauthorized")]
    Unauthorized,

    /// 4.02
    #[error("4.02 Bad Option")]
    BadOption,

    /// 4.04
    #[error("4.04 Not Found")]
    NotFound,

    /// 4.05
    #[error("4.05 Method Not Allowed")]
    MethodNotAllowed,

    /// 4.06
    #[error("4.06 Not Acceptable")]
    NotAcceptable,

    /// 4.08
    #[error("4.08 Request Entity Incomplete")]
    RequestEntityIncomplete,

    /// 4.12
    #[error("4.12 Precondition Failed")]
    PreconditionFailed,

    /// 4.13
    #[error("4.13 Request Entity Too Large")]
    RequestEntityTooLarge,

    /// 4.15
    #[error("4.15 Unsupported Content-Format")]
    UnsupportedContentFormat,

    /// 5.00
    #[error("5.00 Internal Server Error")]
    InternalServerError,

    /// 5.01
    #[error("5.01 Not Implemented")]
    NotImplemented,

    /// 5.03
    #[error("5.03 Service Unavailable")]
    ServiceUnavailable,
}

impl ResponseError {
    /// The response code carried on the wire for this error.
    pub fn msg_code(self) -> MsgCode {
        match self {
            ResponseError::BadRequest => MsgCode::BAD_REQUEST,
            ResponseError::Unauthorized => MsgCode::UNAUTHORIZED,
            ResponseError::BadOption => MsgCode::BAD_OPTION,
            ResponseError::NotFound => MsgCode::NOT_FOUND,
            ResponseError::MethodNotAllowed => MsgCode::METHOD_NOT_ALLOWED,
            ResponseError::NotAcceptable => MsgCode::NOT_ACCEPTABLE,
            ResponseError::RequestEntityIncomplete => MsgCode::REQUEST_ENTITY_INCOMPLETE,
            ResponseError::PreconditionFailed => MsgCode::PRECONDITION_FAILED,
            ResponseError::RequestEntityTooLarge => MsgCode::REQUEST_ENTITY_TOO_LARGE,
            ResponseError::UnsupportedContentFormat => MsgCode::UNSUPPORTED_CONTENT_FORMAT,
            ResponseError::InternalServerError => MsgCode::INTERNAL_SERVER_ERROR,
            ResponseError::NotImplemented => MsgCode::NOT_IMPLEMENTED,
            ResponseError::ServiceUnavailable => MsgCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Maps an error response code back onto this enum.
    pub fn from_msg_code(code: MsgCode) -> Option<ResponseError> {
        Some(match code {
            MsgCode::BAD_REQUEST => ResponseError::BadRequest,
            MsgCode::UNAUTHORIZED => ResponseError::Unauthorized,
            MsgCode::BAD_OPTION => ResponseError::BadOption,
            MsgCode::NOT_FOUND => ResponseError::NotFound,
            MsgCode::METHOD_NOT_ALLOWED => ResponseError::MethodNotAllowed,
            MsgCode::NOT_ACCEPTABLE => ResponseError::NotAcceptable,
            MsgCode::REQUEST_ENTITY_INCOMPLETE => ResponseError::RequestEntityIncomplete,
            MsgCode::PRECONDITION_FAILED => ResponseError::PreconditionFailed,
            MsgCode::REQUEST_ENTITY_TOO_LARGE => ResponseError::RequestEntityTooLarge,
            MsgCode::UNSUPPORTED_CONTENT_FORMAT => ResponseError::UnsupportedContentFormat,
            MsgCode::INTERNAL_SERVER_ERROR => ResponseError::InternalServerError,
            MsgCode::NOT_IMPLEMENTED => ResponseError::NotImplemented,
            MsgCode::SERVICE_UNAVAILABLE => ResponseError::ServiceUnavailable,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(Error::ConnectionLost, Error::from(reset));

        let other = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(Error::IOError, Error::from(other));
    }

    #[test]
    fn response_codes() {
        assert_eq!("4.05", ResponseError::MethodNotAllowed.msg_code().to_string());
        assert_eq!("5.03", ResponseError::ServiceUnavailable.msg_code().to_string());
        assert_eq!(
            Some(ResponseError::RequestEntityIncomplete),
            ResponseError::from_msg_code(MsgCode::REQUEST_ENTITY_INCOMPLETE)
        );
        assert_eq!(None, ResponseError::from_msg_code(MsgCode::CONTENT));
    }
}
