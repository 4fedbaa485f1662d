//! Pipeline error types and error classification
//!
//! Every failure is classified into an [`ErrorKind`] that decides what the
//! pipeline does next:
//! - **Transient**: network timeout or throttling, retried with exponential backoff
//! - **Permanent**: malformed input or authorization denial, never retried
//! - **ReceiptExpired**: the receipt token lapsed, the message is abandoned locally
//!   and the queue redelivers it later

use serde::Serialize;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Classification of a failure, used for retry decisions and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary failure, retried up to the attempt ceiling.
    Transient,
    /// Unrecoverable for this delivery attempt, no retry.
    Permanent,
    /// The receipt token is no longer valid.
    ReceiptExpired,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// Outcome label used in logs and metrics, e.g. `failed:transient`.
    pub fn failure_label(&self) -> String {
        format!("failed:{}", self)
    }
}

/// Pipeline errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Network timeout, throttling or a temporarily unavailable endpoint
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Malformed input, invalid key or authorization denial
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Receipt token is no longer valid
    #[error("Receipt expired: {0}")]
    ReceiptExpired(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        PipelineError::TransientIo(message.into())
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        PipelineError::Permanent(message.into())
    }

    /// Create a receipt-expired error
    pub fn receipt_expired(message: impl Into<String>) -> Self {
        PipelineError::ReceiptExpired(message.into())
    }

    /// Create an error of the given kind
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        match kind {
            ErrorKind::Transient => Self::transient(message),
            ErrorKind::Permanent => Self::permanent(message),
            ErrorKind::ReceiptExpired => Self::receipt_expired(message),
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::TransientIo(_) => ErrorKind::Transient,
            PipelineError::Permanent(_) => ErrorKind::Permanent,
            PipelineError::ReceiptExpired(_) => ErrorKind::ReceiptExpired,
            PipelineError::Config(_) => ErrorKind::Permanent,
        }
    }

    /// Check if this error should trigger a retry
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Permanent(format!("serialization error: {}", err))
    }
}

impl From<core_config::ConfigError> for PipelineError {
    fn from(err: core_config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}
