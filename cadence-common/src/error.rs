//! Foundational error types shared across the workspace.

use thiserror::Error;

/// Errors produced while parsing or normalizing email addresses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The input contains no `@` separator.
    #[error("Invalid email address (no '@'): {0}")]
    MissingAt(String),

    /// The input has nothing before the `@`.
    #[error("Invalid email address (empty local part): {0}")]
    EmptyLocalPart(String),

    /// The domain part is empty or not a plausible hostname.
    #[error("Invalid email address (bad domain): {0}")]
    InvalidDomain(String),
}

/// Errors produced by illegal state-machine transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// The requested campaign transition is not part of the state machine.
    #[error("Illegal campaign transition: {from} -> {to}")]
    IllegalCampaignTransition { from: String, to: String },

    /// Content mutation was attempted inside the edit-lock window.
    #[error("Campaign content is locked for editing ({minutes_to_send} minutes before send)")]
    EditLocked { minutes_to_send: i64 },

    /// The requested queue-row transition is not part of the state machine.
    #[error("Illegal queue transition: {from} -> {to}")]
    IllegalQueueTransition { from: String, to: String },
}
