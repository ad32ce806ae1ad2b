//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error for key {key}: {source}")]
    Serialization {
        /// The key being read or written.
        key: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The key is not usable by this backend.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// The stored data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The backend rejects writes (quota exceeded, read-only medium).
    #[error("storage is read-only")]
    ReadOnly,
}
