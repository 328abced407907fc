//! Typed error handling for the send pipeline.
//!
//! The send path distinguishes four fates for a queue row:
//! - transient failures retry until the attempts run out
//! - permanent failures dead-letter immediately
//! - rate denials requeue without consuming an attempt
//! - policy rejects skip the row and are never retried
//!
//! Side services (throttle manager, agent decisions, rate limiter) fail
//! open: their errors are logged and the send proceeds.

use thiserror::Error;

/// Subsystem errors for the scheduler and periodic workers.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The relational store failed.
    #[error(transparent)]
    Store(#[from] cadence_store::StoreError),

    /// The KV store failed.
    #[error(transparent)]
    Kv(#[from] cadence_kv::KvError),

    /// The gating tier failed.
    #[error(transparent)]
    Throttle(#[from] cadence_throttle::ThrottleError),

    /// An adapter could not be built or resolved.
    #[error(transparent)]
    Esp(#[from] cadence_esp::EspError),
}
