//! Wire-visible error codes and identity validation errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("host id must be nonzero")]
    ZeroHostId,
    #[error("channel id must be nonzero")]
    ZeroChannelId,
}

/// Error classification carried on the wire in ERROR frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame referenced a channel id the hub has not provisioned.
    UnknownChannel,
    /// First application frame was neither a header nor a trusted
    /// replication frame.
    UnsupportedPayload,
    /// Body failed to decode in the negotiated wire format.
    MalformedPayload,
    /// Well-formed message arriving in a state that forbids it.
    InvalidRequest,
    /// Resource bound hit (connection cap, reorder buffer).
    Overloaded,
    /// Node is draining; writes are no longer accepted.
    ShuttingDown,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownChannel => "unknown_channel",
            ErrorCode::UnsupportedPayload => "unsupported_payload",
            ErrorCode::MalformedPayload => "malformed_payload",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::ShuttingDown => "shutting_down",
            ErrorCode::Internal => "internal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unknown_channel" => Some(ErrorCode::UnknownChannel),
            "unsupported_payload" => Some(ErrorCode::UnsupportedPayload),
            "malformed_payload" => Some(ErrorCode::MalformedPayload),
            "invalid_request" => Some(ErrorCode::InvalidRequest),
            "overloaded" => Some(ErrorCode::Overloaded),
            "shutting_down" => Some(ErrorCode::ShuttingDown),
            "internal" => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an ERROR frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrips_through_str() {
        for code in [
            ErrorCode::UnknownChannel,
            ErrorCode::UnsupportedPayload,
            ErrorCode::MalformedPayload,
            ErrorCode::InvalidRequest,
            ErrorCode::Overloaded,
            ErrorCode::ShuttingDown,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("no_such_code"), None);
    }
}
