//! Error types for protocol encoding and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload does not match the shape required by its event kind.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// The declared event kind.
        kind: &'static str,
        /// The decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// The envelope is structurally valid JSON but violates a protocol rule.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl ProtocolError {
    /// Creates an envelope validation error.
    pub fn invalid_envelope(message: impl Into<String>) -> Self {
        Self::InvalidEnvelope(message.into())
    }
}
