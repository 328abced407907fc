//! Value types exchanged across the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_common::{
    address::EmailAddress,
    ids::{CampaignId, QueueRowId, SubscriberId, WorkerId},
};

/// Insert shape for one queue row.
///
/// The store assigns `status = queued`, zero attempts, and the uniqueness
/// guard on `(campaign_id, subscriber_id)`; a duplicate insert is silently
/// dropped.
#[derive(Debug, Clone)]
pub struct NewQueueRow {
    pub id: QueueRowId,
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub recipient: EmailAddress,
    pub substitutions: Option<serde_json::Map<String, serde_json::Value>>,
    pub variant_subject: Option<String>,
    pub variant_html: Option<String>,
    pub variant_text: Option<String>,
    pub variant_from_name: Option<String>,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Campaign content fields that may be mutated before the edit lock closes.
#[derive(Debug, Clone, Default)]
pub struct ContentPatch {
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub preheader: Option<String>,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub reply_to: Option<String>,
}

impl ContentPatch {
    /// Whether the patch changes anything.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.subject.is_none()
            && self.html_body.is_none()
            && self.text_body.is_none()
            && self.preheader.is_none()
            && self.from_name.is_none()
            && self.from_email.is_none()
            && self.reply_to.is_none()
    }
}

/// Per-status row counts for one campaign's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRowStats {
    pub total: u64,
    pub queued: u64,
    pub claimed: u64,
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl CampaignRowStats {
    /// Rows that can still change state.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.queued + self.claimed + self.failed
    }

    /// Whether every owned row has reached a terminal state.
    #[must_use]
    pub const fn all_terminal(&self) -> bool {
        self.total > 0 && self.pending() == 0
    }
}

/// One registered send worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}
