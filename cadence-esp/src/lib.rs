#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Uniform capability set over delivery providers.
//!
//! Every provider is an [`EspAdapter`]: `send` one message, optionally
//! `send_batch` many, and declare batch/payload caps for the grouper.
//! Failures are surfaced in the returned outcome, never raised; retry
//! policy belongs to the send worker, so adapters never retry internally.

pub mod adapter;
pub mod batch;
pub mod error;
pub mod http;
pub mod message;
pub mod mock;

pub use adapter::{BatchOutcome, EspAdapter, SendOutcome};
pub use batch::group_for_batching;
pub use error::EspError;
pub use http::HttpEspAdapter;
pub use message::OutboundMessage;
pub use mock::MockEspAdapter;
