//! Error taxonomy for the HSP runtime.
//!
//! Every variant maps to a stable [`ErrorCode`] string so peers written in
//! other languages can match on NACK `error_code` values.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ids::RequestId;

/// Stable, cross-language error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "HSP_DECODE_ERROR")]
    Decode,
    #[serde(rename = "HSP_SCHEMA_ERROR")]
    Schema,
    #[serde(rename = "HSP_UNSUPPORTED_VERSION")]
    UnsupportedVersion,
    #[serde(rename = "HSP_PUBLISH_TIMEOUT")]
    PublishTimeout,
    #[serde(rename = "HSP_TRANSPORT_UNAVAILABLE")]
    TransportUnavailable,
    #[serde(rename = "HSP_TRANSPORT")]
    Transport,
    #[serde(rename = "HSP_DUPLICATE_REQUEST")]
    DuplicateRequest,
    #[serde(rename = "HSP_UNKNOWN_REQUEST")]
    UnknownRequest,
    #[serde(rename = "HSP_TIMEOUT")]
    Timeout,
    #[serde(rename = "HSP_CANCELLED")]
    Cancelled,
    #[serde(rename = "HSP_NACKED")]
    Nacked,
    #[serde(rename = "HSP_TRUST_REJECTED")]
    TrustRejected,
    #[serde(rename = "HSP_HANDLER_FAILED")]
    HandlerFailed,
    #[serde(rename = "HSP_CONFIG")]
    Config,
    #[serde(rename = "HSP_IO")]
    Io,
    #[serde(rename = "HSP_CLOSED")]
    Closed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "HSP_DECODE_ERROR",
            Self::Schema => "HSP_SCHEMA_ERROR",
            Self::UnsupportedVersion => "HSP_UNSUPPORTED_VERSION",
            Self::PublishTimeout => "HSP_PUBLISH_TIMEOUT",
            Self::TransportUnavailable => "HSP_TRANSPORT_UNAVAILABLE",
            Self::Transport => "HSP_TRANSPORT",
            Self::DuplicateRequest => "HSP_DUPLICATE_REQUEST",
            Self::UnknownRequest => "HSP_UNKNOWN_REQUEST",
            Self::Timeout => "HSP_TIMEOUT",
            Self::Cancelled => "HSP_CANCELLED",
            Self::Nacked => "HSP_NACKED",
            Self::TrustRejected => "HSP_TRUST_REJECTED",
            Self::HandlerFailed => "HSP_HANDLER_FAILED",
            Self::Config => "HSP_CONFIG",
            Self::Io => "HSP_IO",
            Self::Closed => "HSP_CLOSED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by HSP components.
#[derive(Debug, Clone, Error)]
pub enum HspError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("publish timed out after {timeout_ms}ms on {transport}")]
    PublishTimeout { transport: String, timeout_ms: u64 },
    #[error("no transport available: {0}")]
    TransportUnavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request {0} is already outstanding")]
    DuplicateRequest(RequestId),
    #[error("request {0} is not outstanding")]
    UnknownRequest(RequestId),
    #[error("request {0} timed out")]
    Timeout(RequestId),
    #[error("request {0} was cancelled")]
    Cancelled(RequestId),
    #[error("peer rejected message ({code}): {message}")]
    Nacked { code: String, message: String },
    #[error("handler failed: {0}")]
    HandlerFailed(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("closed: {0}")]
    Closed(String),
}

impl HspError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::Decode,
            Self::Schema(_) => ErrorCode::Schema,
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            Self::PublishTimeout { .. } => ErrorCode::PublishTimeout,
            Self::TransportUnavailable(_) => ErrorCode::TransportUnavailable,
            Self::Transport(_) => ErrorCode::Transport,
            Self::DuplicateRequest(_) => ErrorCode::DuplicateRequest,
            Self::UnknownRequest(_) => ErrorCode::UnknownRequest,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::Nacked { .. } => ErrorCode::Nacked,
            Self::HandlerFailed(_) => ErrorCode::HandlerFailed,
            Self::Config(_) => ErrorCode::Config,
            Self::Io(_) => ErrorCode::Io,
            Self::Closed(_) => ErrorCode::Closed,
        }
    }

    pub fn transport(error: impl fmt::Display) -> Self {
        Self::Transport(error.to_string())
    }

    pub fn handler(error: impl fmt::Display) -> Self {
        Self::HandlerFailed(error.to_string())
    }
}

impl From<std::io::Error> for HspError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Convenience result type for HSP operations.
pub type HspResult<T> = Result<T, HspError>;
