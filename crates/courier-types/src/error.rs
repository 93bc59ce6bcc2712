//! Error taxonomy shared by callers, handlers and the dispatcher.
//!
//! Once an error crosses the transport it is a plain value
//! ([`ErrorPayload`]). On either side of the wire it is surfaced as a
//! [`BusError`], which handlers may also return to signal a coded failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed set of error codes.
///
/// The bus itself only emits `NotFound`, `Timeout`, `Internal` and the
/// caller-local `Aborted`. Every other code originates in a handler and is
/// passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed or missing caller input.
    BadRequest,
    /// No handler registered for the request type.
    NotFound,
    /// No terminal reply arrived within the caller's deadline.
    Timeout,
    /// Transport delivery failure or unhandled handler failure.
    Internal,
    /// A dependency the handler needed was not ready.
    Unavailable,
    /// Handler-local authorization failure.
    PermissionDenied,
    /// The caller cancelled the call through its abort signal.
    Aborted,
}

impl ErrorCode {
    /// Wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::NotFound => "NotFound",
            Self::Timeout => "Timeout",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::PermissionDenied => "PermissionDenied",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error value carried inside an `ok:false` response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// A coded bus error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct BusError {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    pub details: Option<serde_json::Value>,
}

impl BusError {
    /// Create an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, message)
    }

    /// Convert into the on-wire error value.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}

impl From<ErrorPayload> for BusError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            code: payload.code,
            message: payload.message,
            details: payload.details,
        }
    }
}

impl From<BusError> for ErrorPayload {
    fn from(err: BusError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            details: err.details,
        }
    }
}

/// Alias for Result with BusError.
pub type BusResult<T> = Result<T, BusError>;
