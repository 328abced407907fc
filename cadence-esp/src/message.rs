//! The provider-agnostic outbound message.

use cadence_common::{
    EmailAddress,
    ids::{CampaignId, QueueRowId, SubscriberId},
};
use serde::{Deserialize, Serialize};

/// One fully rendered message, ready for a provider.
///
/// By the time a message reaches an adapter every pipeline concern is
/// already applied: merge fields substituted, tracking injected, headers
/// attached. Adapters only translate and transmit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: EmailAddress,
    pub to_name: Option<String>,
    pub from_email: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    /// Extra message headers (`List-Unsubscribe`, `X-Job`, ...).
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    // Pipeline identity, carried for result mapping and event recording.
    pub campaign_id: CampaignId,
    pub queue_row_id: QueueRowId,
    pub subscriber_id: SubscriberId,
}

impl OutboundMessage {
    /// Rough wire-size estimate used by the batch grouper.
    ///
    /// Counts the variable-length parts plus a fixed per-message envelope
    /// overhead; providers with hard payload caps get a safety margin from
    /// the grouper, not from this estimate.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        const ENVELOPE_OVERHEAD: usize = 512;

        self.subject.len()
            + self.html.as_deref().map_or(0, str::len)
            + self.text.as_deref().map_or(0, str::len)
            + self
                .headers
                .iter()
                .map(|(name, value)| name.len() + value.len() + 4)
                .sum::<usize>()
            + ENVELOPE_OVERHEAD
    }
}
