#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! The send pipeline: scheduler, worker pool, and the feedback loops
//! around them.
//!
//! Control flow: the [`scheduler`] materializes due campaigns into queue
//! rows (running the [`agent`] preprocessor first when enabled), the
//! [`worker`] pool claims and delivers them through ESP adapters, and the
//! [`metrics`]/[`abtest`]/[`cleanup`] tasks observe outcomes and feed back
//! into throttle configuration. Each role is an independent periodic task
//! driven by a `serve(shutdown)` loop; all of them delegate to `run_cycle`
//! methods that tests drive directly.

pub mod abtest;
pub mod agent;
pub mod cleanup;
pub mod content;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod suppression;
pub mod worker;

pub use abtest::AbTestWorker;
pub use agent::AgentPreprocessor;
pub use cleanup::{CleanupConfig, CleanupWorker, RetentionConfig};
pub use content::ContentCache;
pub use error::DeliveryError;
pub use metrics::{AutoTuneConfig, AutoTuner, MetricsCollector};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use suppression::SuppressionHub;
pub use worker::{EspRegistry, TrackingSettings, WorkerContext, WorkerPool, WorkerPoolConfig};
