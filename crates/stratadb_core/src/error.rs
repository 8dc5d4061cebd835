//! Error types for stratadb core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in stratadb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] stratadb_storage::StorageError),

    /// Codec error while (de)serializing an object or metadata value.
    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// Another database instance is already open on this storage
    /// location within this process.
    #[error("database already open at {path}")]
    AlreadyOpen {
        /// The contested storage location (main file path).
        path: String,
    },

    /// An extension is persisted under this name with a different
    /// implementing class.
    #[error("extension {name:?} persisted as class {persisted:?}, registered as {registered:?}")]
    ExtensionClassMismatch {
        /// Extension name.
        name: String,
        /// Class identifier found in the persisted record.
        persisted: String,
        /// Class identifier of the instance being registered.
        registered: String,
    },

    /// A read-write transaction body requested rollback.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Reason for the rollback.
        reason: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a transaction-aborted error, rolling back the enclosing
    /// read-write transaction when returned from its body.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
