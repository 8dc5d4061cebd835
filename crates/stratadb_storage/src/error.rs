//! Error types for storage engines.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in a storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error from the underlying engine.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The storage location could not be opened.
    #[error("cannot open storage: {message}")]
    Unopenable {
        /// Description of the failure.
        message: String,
    },

    /// A handle was used outside the required transaction state.
    #[error("invalid transaction state: {message}")]
    InvalidState {
        /// Description of the state violation.
        message: String,
    },
}

impl StorageError {
    /// Creates an unopenable-storage error.
    pub fn unopenable(message: impl Into<String>) -> Self {
        Self::Unopenable {
            message: message.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}
