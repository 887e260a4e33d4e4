//! Errors returned by capability handlers across the invocation boundary.

use serde::{Deserialize, Serialize};

/// Structured error a handler returns from `invoke`.
///
/// The orchestrator treats every variant as a failed attempt for retry
/// purposes; the distinction is carried through to events and metrics so
/// callers can tell bad input from an unavailable backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerError {
    /// The input payload did not match the handler's declared schema.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// The backing service is unreachable or refused the call.
    #[error("handler unavailable: {reason}")]
    Unavailable { reason: String },

    /// The handler gave up on its own deadline.
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Any other failure, including panics inside the handler task.
    #[error("handler failed: {message}")]
    Failed { message: String },
}

impl HandlerError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Short machine-readable kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::Unavailable { .. } => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Failed { .. } => "failed",
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(err.to_string())
    }
}
