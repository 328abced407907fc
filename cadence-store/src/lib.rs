#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Relational-store boundary.
//!
//! The pipeline talks to its durable store through the capability traits in
//! [`store`]; two backends satisfy them: [`PgStore`] for production and
//! [`MemoryStore`] for tests and single-node development. Column names in
//! the Postgres backend are contractual with the wider system; physical
//! layout is not.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod segment;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{
    AbTestStore, AudienceStore, CampaignStore, DecisionStore, EventStore, MaintenanceStore,
    ProfileStore, QueueStore, Store, SuppressionStore, ThrottleConfigStore, WorkerStore,
};
pub use types::{CampaignRowStats, ContentPatch, NewQueueRow, WorkerRecord};
