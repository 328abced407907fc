//! Typed errors for store operations.

use cadence_common::error::StateError;
use thiserror::Error;

/// Errors surfaced by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation lost a conditional update (another worker won, or the
    /// caller no longer owns the row).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A domain state machine rejected the operation.
    #[error(transparent)]
    State(#[from] StateError),

    /// A stored value could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The backend failed the query.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Decode(format!("column {index}: {source}"))
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
