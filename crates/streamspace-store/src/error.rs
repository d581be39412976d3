//! Error types for the storage layer.

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record was not found.
    #[error("record not found")]
    NotFound,

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An index entry could not be decoded back into an identifier.
    #[error("corrupt index key in {cf}: {reason}")]
    CorruptKey {
        /// Column family holding the key.
        cf: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

impl StoreError {
    /// Returns true if the backing database itself failed, as opposed to a
    /// missing record.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
