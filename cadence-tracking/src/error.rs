//! Tracking errors.

use thiserror::Error;

/// Errors raised while building or verifying tracking artifacts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackingError {
    /// The payload is not valid URL-safe base64.
    #[error("Invalid tracking payload encoding")]
    InvalidEncoding,

    /// The payload decodes but does not follow the `|`-separated grammar.
    #[error("Malformed tracking payload: {0}")]
    MalformedPayload(String),

    /// The MAC does not match the payload under the configured key.
    #[error("Tracking signature mismatch")]
    SignatureMismatch,
}
