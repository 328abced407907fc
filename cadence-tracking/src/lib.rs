#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Signed engagement tracking.
//!
//! Every outbound HTML body gets a 1x1 open pixel, click-redirect links,
//! and a one-click unsubscribe header, all pointing at a companion tracking
//! service. Each URL embeds a `|`-separated identity payload and a
//! truncated HMAC so the service can reject tampered links without a
//! database round-trip.

pub mod error;
pub mod inject;
pub mod links;
pub mod merge;
pub mod signer;

pub use error::TrackingError;
pub use inject::{InjectedMessage, inject_tracking, tracking_headers};
pub use links::{TrackingData, TrackingLinks};
pub use merge::substitute_merge_fields;
pub use signer::Signer;
