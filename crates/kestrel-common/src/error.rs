//! Error types for KestrelDB.

use crate::types::TypeId;
use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in KestrelDB storage operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Parse errors
    #[error("Parse error: cannot parse '{text}' as {type_id}")]
    Parse { type_id: TypeId, text: String },

    // Encoding errors
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Field {field} out of bounds: offset {offset} + {len} exceeds buffer of {buffer_len} bytes")]
    FieldOutOfBounds {
        field: usize,
        offset: usize,
        len: usize,
        buffer_len: usize,
    },

    #[error("Buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: TypeId, actual: TypeId },

    // I/O operation errors
    #[error("{kind} on index {index} failed: {reason}")]
    IoOperationFailed {
        kind: String,
        index: String,
        reason: String,
    },

    #[error("I/O operation {0} was cancelled")]
    OperationCancelled(u64),

    #[error("I/O scheduler is shut down")]
    SchedulerShutdown,

    // On-disk format errors
    #[error("Component corrupted: {path}, reason: {reason}")]
    ComponentCorrupted { path: String, reason: String },

    #[error("WAL corrupted at offset {offset}: {reason}")]
    WalCorrupted { offset: u64, reason: String },

    // Lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Duplicate key")]
    DuplicateKey,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Creates a parse error for the given type and offending input.
    pub fn parse(type_id: TypeId, text: impl Into<String>) -> Self {
        KestrelError::Parse {
            type_id,
            text: text.into(),
        }
    }

    /// Returns true if this is a text parsing failure.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, KestrelError::Parse { .. })
    }

    /// Returns true if this indicates a schema or buffer mismatch in the codec.
    pub fn is_encoding_error(&self) -> bool {
        matches!(
            self,
            KestrelError::Encoding(_)
                | KestrelError::FieldOutOfBounds { .. }
                | KestrelError::BufferTooShort { .. }
                | KestrelError::TypeMismatch { .. }
        )
    }

    /// Returns true if this is an open/close pairing violation.
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(self, KestrelError::Lifecycle(_))
    }

    /// Returns true if a background flush or merge failed.
    pub fn is_io_operation_failure(&self) -> bool {
        matches!(self, KestrelError::IoOperationFailed { .. })
    }
}
