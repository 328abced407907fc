//! The [`EspAdapter`] trait and its outcome types.

use async_trait::async_trait;

use crate::message::OutboundMessage;

/// Result of a single-message send.
///
/// Network failures, HTTP errors, and provider error documents are all
/// normalized here; `success == false` with a reason, never a panic or a
/// propagated error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    /// Provider-assigned message id on success.
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    /// A successful send.
    #[must_use]
    pub fn ok(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
        }
    }

    /// A failed send.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a batch send: per-message outcomes mapped 1:1 to the input.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: Option<String>,
    pub results: Vec<SendOutcome>,
}

impl BatchOutcome {
    /// Messages the provider accepted.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Messages the provider rejected.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.results.len() - self.accepted()
    }
}

/// Capability set every delivery provider exposes.
#[async_trait]
pub trait EspAdapter: Send + Sync {
    /// Adapter key, matching sending profiles' `esp_type`.
    fn esp_type(&self) -> &str;

    /// Largest batch the provider accepts; `1` means no native batching.
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Largest request payload the provider accepts, in bytes.
    fn max_payload_bytes(&self) -> usize {
        5 * 1024 * 1024
    }

    /// Deliver one message.
    async fn send(&self, message: &OutboundMessage) -> SendOutcome;

    /// Deliver a batch. The default implementation loops [`send`] for
    /// providers without a native batch endpoint; results map 1:1 to the
    /// input order either way.
    ///
    /// [`send`]: EspAdapter::send
    async fn send_batch(&self, messages: &[OutboundMessage]) -> BatchOutcome {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.send(message).await);
        }
        BatchOutcome {
            batch_id: None,
            results,
        }
    }
}
