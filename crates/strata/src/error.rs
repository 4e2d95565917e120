// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the strata middleware.
//!
//! Three families of failure exist:
//! - Configuration and programming errors, returned at the call site.
//! - Startup failures of the interprocess portal, carrying a [`StatusCode`].
//! - Per-message codec failures ([`CodecError`]), logged and dropped by the
//!   receive path rather than surfaced to the application.

use std::fmt;
use thiserror::Error;

/// Machine-readable status for portal startup and connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The manager could not be reached before the startup timeout.
    ConnectionFailed,
    /// The manager was reached but never provided the socket configuration.
    StartupTimedOut,
    /// The bus connection was lost after the portal became ready.
    Disconnected,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::ConnectionFailed => "CONNECTION_FAILED",
            StatusCode::StartupTimedOut => "STARTUP_TIMED_OUT",
            StatusCode::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to encode or decode one message payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("JSON codec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protobuf decode: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("protobuf encode: {0}")]
    ProtobufEncode(#[from] prost::EncodeError),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // Programming errors
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("scheme mismatch: {0} is not a concrete marshalling scheme")]
    SchemeMismatch(i32),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    // Portal lifecycle
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("startup timed out: {0}")]
    StartupTimedOut(String),

    #[error("portal is not ready ({0})")]
    NotReady(&'static str),

    // Runtime
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("thread error: {0}")]
    Thread(String),
}

impl Error {
    /// Status code for lifecycle failures, `None` for everything else.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::ConnectionFailed(_) => Some(StatusCode::ConnectionFailed),
            Error::StartupTimedOut(_) => Some(StatusCode::StartupTimedOut),
            Error::NotReady(_) => Some(StatusCode::Disconnected),
            _ => None,
        }
    }

    pub(crate) fn from_status(code: StatusCode, detail: String) -> Self {
        match code {
            StatusCode::ConnectionFailed => Error::ConnectionFailed(detail),
            StatusCode::StartupTimedOut => Error::StartupTimedOut(detail),
            StatusCode::Disconnected => Error::ConnectionFailed(detail),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = Error::StartupTimedOut("no reply".into());
        assert_eq!(err.status_code(), Some(StatusCode::StartupTimedOut));
        assert_eq!(
            Error::Config("bad".into()).status_code(),
            None,
            "config errors carry no status"
        );
        assert_eq!(StatusCode::ConnectionFailed.to_string(), "CONNECTION_FAILED");
    }

    #[test]
    fn test_codec_error_converts() {
        let bad = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        let err: Error = CodecError::from(bad).into();
        assert!(matches!(err, Error::Codec(CodecError::Utf8(_))));
    }
}
