//! Adapter construction errors.
//!
//! Send-path failures never surface as errors: they are normalized into
//! [`crate::SendOutcome`] so the worker's failure policy sees every
//! provider the same way.

use thiserror::Error;

/// Errors raised while building an adapter.
#[derive(Debug, Error)]
pub enum EspError {
    /// The sending profile references an adapter kind nobody registered.
    #[error("Unknown ESP type: {0}")]
    UnknownEspType(String),

    /// The adapter's configuration is unusable.
    #[error("Invalid ESP configuration: {0}")]
    InvalidConfiguration(String),
}
