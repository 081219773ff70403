//! Error types for replication flows
//!
//! One tagged error covers the whole orchestration surface: remote activity
//! failures, cancellation, configuration problems and state persistence.
//! Classification (`kind`, `is_retriable`) drives the retry loop in
//! [`crate::activity`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error classification used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried within activity budgets (network, lock conflicts, rate limits)
    Transient,
    /// Activity exhausted its retry budget
    Timeout,
    /// Schema incompatibility, auth, permission denied
    NonRetryable,
    /// Context cancellation
    Cancelled,
    /// Synchronous validation failure
    Config,
}

/// Flow orchestration errors.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Transient failure, safe to retry
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent failure, retrying cannot help
    #[error("non-retryable error: {0}")]
    NonRetryable(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Activity exhausted its retry budget
    #[error("activity {activity} failed after {attempts} attempts: {last_error}")]
    ActivityExhausted {
        activity: String,
        attempts: u32,
        last_error: String,
    },

    /// Flow context was cancelled
    #[error("flow cancelled")]
    Cancelled,

    /// State persistence error
    #[error("state error: {0}")]
    State(String),

    /// Child workflow failure
    #[error("child workflow {workflow_id} failed: {source}")]
    Child {
        workflow_id: String,
        #[source]
        source: Box<FlowError>,
    },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a non-retryable error
    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a state persistence error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Wrap a child workflow failure
    pub fn child(workflow_id: impl Into<String>, source: FlowError) -> Self {
        Self::Child {
            workflow_id: workflow_id.into(),
            source: Box::new(source),
        }
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::State(_) => true,

            // I/O errors may be retriable
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::Child { source, .. } => source.is_retriable(),

            Self::NonRetryable(_)
            | Self::Config(_)
            | Self::ActivityExhausted { .. }
            | Self::Cancelled
            | Self::Json(_) => false,
        }
    }

    /// Get the error kind for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::State(_) => ErrorKind::Transient,
            Self::ActivityExhausted { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Child { source, .. } => source.kind(),
            Self::Io(_) if self.is_retriable() => ErrorKind::Transient,
            Self::NonRetryable(_) | Self::Json(_) | Self::Io(_) => ErrorKind::NonRetryable,
        }
    }

    /// Check whether the error is (or wraps) a cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
