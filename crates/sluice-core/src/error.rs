//! Engine error types
//!
//! Includes error classification for retry decisions at the job-scheduling
//! layer: transient transport failures back off and retry, data failures
//! surface as batch errors requiring resolution.

use serde::{Deserialize, Serialize};
use sluice_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Staging,
    Routing,
    Loading,
    Transport,
    Lock,
    Configuration,
    Protocol,
    Sql,
    Other,
}

/// Replication engine errors
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Wire format error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Staging area failure
    #[error("staging error: {0}")]
    Staging(String),

    /// A lookup that may legitimately miss. Recoverable; callers decide
    /// whether absence is an error in their context.
    #[error("not found: {0}")]
    NotFound(String),

    /// Router/partitioner failure
    #[error("routing error: {0}")]
    Routing(String),

    /// Batch apply failure at the destination
    #[error("load error for batch {batch_id}: {message}")]
    Loading { batch_id: u64, message: String },

    /// Transport-level failure (connection, HTTP status)
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection refused by peer
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Cluster lock could not be acquired or released
    #[error("lock error: {0}")]
    Lock(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// SQL execution failure at the destination
    #[error("sql error: {0}")]
    Sql(String),

    /// Unique/primary key violation; drives fallback insert→update
    #[error("unique key violation: {0}")]
    UniqueViolation(String),

    /// Destination deadlock, retriable
    #[error("deadlock detected: {0}")]
    DeadlockDetected(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SluiceError {
    pub fn staging(msg: impl Into<String>) -> Self {
        Self::Staging(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    pub fn loading(batch_id: u64, msg: impl Into<String>) -> Self {
        Self::Loading {
            batch_id,
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn sql(msg: impl Into<String>) -> Self {
        Self::Sql(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed when the job runs
    /// again; the batch keeps its current status in the meantime.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::ConnectionRefused(_)
            | Self::Timeout(_)
            | Self::DeadlockDetected(_) => true,

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

            Self::Sql(msg) => {
                msg.contains("deadlock")
                    || msg.contains("lock wait timeout")
                    || msg.contains("connection")
            }

            Self::Protocol(_)
            | Self::Staging(_)
            | Self::NotFound(_)
            | Self::Routing(_)
            | Self::Loading { .. }
            | Self::Lock(_)
            | Self::Config(_)
            | Self::UniqueViolation(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Staging(_) => ErrorCategory::Staging,
            Self::Routing(_) => ErrorCategory::Routing,
            Self::Loading { .. } => ErrorCategory::Loading,
            Self::Transport(_) | Self::ConnectionRefused(_) | Self::Timeout(_) => {
                ErrorCategory::Transport
            }
            Self::Lock(_) => ErrorCategory::Lock,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Sql(_) | Self::UniqueViolation(_) | Self::DeadlockDetected(_) => {
                ErrorCategory::Sql
            }
            Self::Json(_) => ErrorCategory::Protocol,
            Self::Io(_) => ErrorCategory::Staging,
            Self::NotFound(_) | Self::Other(_) => ErrorCategory::Other,
        }
    }
}
