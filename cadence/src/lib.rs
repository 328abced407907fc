#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Top-level wiring for the Cadence delivery pipeline.

pub mod controller;

pub use controller::Cadence;
