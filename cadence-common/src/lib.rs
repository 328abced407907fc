#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod abtest;
pub mod address;
pub mod audience;
pub mod campaign;
pub mod decision;
pub mod error;
pub mod events;
pub mod ids;
pub mod logging;
pub mod queue;
pub mod throttle;

pub use address::EmailAddress;
pub use campaign::{Campaign, CampaignState, ThrottleSpeed};
pub use queue::{QueueRow, QueueStatus};
pub use tracing;

/// Control signal broadcast to every long-running task.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
