//! Wire protocol error types

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while reading or writing the batch wire format
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line did not parse as the token it claims to be
    #[error("malformed wire line {line_no}: {reason}")]
    Malformed { line_no: u64, reason: String },

    /// A numeric argument (batch id, stat value) failed to parse
    #[error("invalid number in wire line {line_no}: {value}")]
    InvalidNumber { line_no: u64, value: String },

    /// Unknown binary encoding name
    #[error("unknown binary encoding: {0}")]
    UnknownEncoding(String),

    /// Data row arrived before any batch/table framing
    #[error("out of order wire line {line_no}: {reason}")]
    OutOfOrder { line_no: u64, reason: String },

    /// Underlying I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed(line_no: u64, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line_no,
            reason: reason.into(),
        }
    }

    pub fn out_of_order(line_no: u64, reason: impl Into<String>) -> Self {
        Self::OutOfOrder {
            line_no,
            reason: reason.into(),
        }
    }
}
