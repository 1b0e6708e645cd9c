//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The target record is locked and cannot be overwritten.
    #[error("record is locked: {0}")]
    Locked(String),

    /// Entity not found.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A lock guarding the in-memory tables was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Returns true for the entity-level refusal that sync absorbs as a skip.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}
