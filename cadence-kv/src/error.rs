//! Error types for KV operations.

use thiserror::Error;

/// Errors surfaced by a KV backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend rejected or failed the command.
    #[error("KV backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded as the expected type.
    #[error("KV value decode error for {key}: {reason}")]
    Decode { key: String, reason: String },

    /// The backend is unreachable.
    #[error("KV connection error: {0}")]
    Connection(String),
}

impl From<redis::RedisError> for KvError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_connection_refusal() || error.is_connection_dropped() || error.is_timeout() {
            Self::Connection(error.to_string())
        } else {
            Self::Backend(error.to_string())
        }
    }
}

/// Result alias for KV operations.
pub type Result<T> = std::result::Result<T, KvError>;
