#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! The gating tier: everything that can say "not yet" to a send.
//!
//! Three layers, consulted on every message:
//!
//! - [`rate_limiter`]: raw per-ESP second/minute/day quotas and a
//!   per-destination-domain minute cap, enforced by atomic multi-window
//!   counters in the KV store.
//! - [`manager`]: the per-organization envelope (ISP families, domain
//!   rules, org globals) with automatic backpressure on bounce/complaint
//!   feedback.
//! - [`backpressure`]: a queue-depth circuit with hysteresis that defers
//!   new campaign materialization when workers fall behind.
//!
//! Gates fail open: a KV outage must degrade throughput control, never
//! stall the pipeline.

pub mod backpressure;
pub mod error;
pub mod isp;
pub mod manager;
pub mod rate_limiter;

pub use backpressure::{BackpressureConfig, BackpressureMonitor};
pub use error::ThrottleError;
pub use manager::{ThrottleDecision, ThrottleManager, ThrottleManagerConfig};
pub use rate_limiter::{EspLimits, RateDecision, RateLimitConfig, RateLimiter};
