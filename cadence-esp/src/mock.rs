//! Scriptable in-process adapter for tests.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    adapter::{EspAdapter, SendOutcome},
    message::OutboundMessage,
};

/// An [`EspAdapter`] that records every message and replays scripted
/// outcomes.
///
/// Unscripted sends succeed with a generated message id. Recipients added
/// via [`fail_recipient`] fail on every attempt, which is how the retry /
/// dead-letter paths are exercised.
///
/// [`fail_recipient`]: MockEspAdapter::fail_recipient
#[derive(Debug, Default)]
pub struct MockEspAdapter {
    esp_type: String,
    max_batch_size: usize,
    sent: Mutex<Vec<OutboundMessage>>,
    scripted: Mutex<VecDeque<SendOutcome>>,
    failing_recipients: Mutex<HashSet<String>>,
}

impl MockEspAdapter {
    /// A mock with no native batching.
    #[must_use]
    pub fn new(esp_type: impl Into<String>) -> Self {
        Self {
            esp_type: esp_type.into(),
            max_batch_size: 1,
            ..Self::default()
        }
    }

    /// A mock that advertises a native batch size.
    #[must_use]
    pub fn with_batch_size(esp_type: impl Into<String>, max_batch_size: usize) -> Self {
        Self {
            esp_type: esp_type.into(),
            max_batch_size: max_batch_size.max(1),
            ..Self::default()
        }
    }

    /// Queue an outcome for the next unmatched send.
    pub fn script_outcome(&self, outcome: SendOutcome) {
        self.scripted.lock().push_back(outcome);
    }

    /// Make every send to `address` fail with a transient-looking error.
    pub fn fail_recipient(&self, address: &str) {
        self.failing_recipients
            .lock()
            .insert(address.to_ascii_lowercase());
    }

    /// Every message delivered so far, in order.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    /// Count of delivered messages.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl EspAdapter for MockEspAdapter {
    fn esp_type(&self) -> &str {
        &self.esp_type
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        if self
            .failing_recipients
            .lock()
            .contains(message.to.as_str())
        {
            return SendOutcome::failure("connection reset by provider");
        }

        if let Some(outcome) = self.scripted.lock().pop_front() {
            if outcome.success {
                self.sent.lock().push(message.clone());
            }
            return outcome;
        }

        self.sent.lock().push(message.clone());
        SendOutcome::ok(format!("mock-{}", ulid::Ulid::new()))
    }
}
