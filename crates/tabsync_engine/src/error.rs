//! Error types for the sync engine.

use tabsync_protocol::{ProtocolError, SyncStatus};
use tabsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote backend rejected or failed an operation.
    #[error("backend error: {message}")]
    Backend {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An envelope or payload could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The cross-context channel is closed or unavailable.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Invalid status transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current status.
        from: SyncStatus,
        /// Attempted target status.
        to: SyncStatus,
    },

    /// The backend is unreachable.
    #[error("not connected to backend")]
    NotConnected,

    /// The context has been destroyed.
    #[error("sync context destroyed")]
    Destroyed,
}

impl SyncError {
    /// Creates a retryable backend error.
    pub fn backend_retryable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable backend error.
    pub fn backend_fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Backend { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            SyncError::Storage(_) => true,
            _ => false,
        }
    }
}

/// Failure posting to the cross-context channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The endpoint was closed.
    #[error("channel {0:?} is closed")]
    Closed(String),

    /// The environment has no cross-context channel.
    #[error("cross-context channel unavailable")]
    Unavailable,
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
