//! Throttle-tier errors.

use thiserror::Error;

/// Errors from the gating tier.
///
/// Callers on the send path treat these as fail-open: a gate that cannot
/// answer does not block the send.
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// The KV store could not execute the counter step.
    #[error(transparent)]
    Kv(#[from] cadence_kv::KvError),

    /// The relational store could not serve throttle configuration.
    #[error("Throttle config store error: {0}")]
    Store(#[from] cadence_store::StoreError),

    /// The recipient address has no usable domain.
    #[error("Malformed recipient address: {0}")]
    MalformedAddress(String),
}

/// Result alias for throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
