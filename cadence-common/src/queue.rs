//! Per-recipient queue rows: the unit of work a send worker claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    address::EmailAddress,
    error::StateError,
    ids::{CampaignId, QueueRowId, SubscriberId, WorkerId},
};

/// State of a queue row.
///
/// ```text
/// queued -> claimed -> sent
///                   -> skipped
///                   -> failed -> (re-claimed) -> ... -> dead_letter
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Claimed,
    Sent,
    Skipped,
    Failed,
    DeadLetter,
}

impl QueueStatus {
    /// Whether no worker will ever touch this row again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Skipped | Self::DeadLetter)
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Sent => "sent",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "claimed" => Some(Self::Claimed),
            "sent" => Some(Self::Sent),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// Reason a row was skipped without an ESP call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Suppressed,
    GlobalSuppressed,
    AgentSuppress,
    AgentDefer,
    MalformedAddress,
}

impl SkipReason {
    /// Storage representation, also used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Suppressed => "suppressed",
            Self::GlobalSuppressed => "global_suppressed",
            Self::AgentSuppress => "agent_suppress",
            Self::AgentDefer => "agent_defer",
            Self::MalformedAddress => "malformed_address",
        }
    }
}

/// One delivery unit for one recipient of one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: QueueRowId,
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub recipient: EmailAddress,

    /// Per-recipient merge values substituted into subject/html/text.
    #[serde(default)]
    pub substitutions: Option<serde_json::Map<String, serde_json::Value>>,

    /// Subject/html/text overrides chosen by A/B assignment, if any.
    pub variant_subject: Option<String>,
    pub variant_html: Option<String>,
    pub variant_text: Option<String>,
    pub variant_from_name: Option<String>,

    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueStatus,

    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub skip_reason: Option<String>,
    /// Provider message id once the row reaches `sent`.
    pub message_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl QueueRow {
    /// Whether a claim made at `claimed_at` has expired by `now`.
    #[must_use]
    pub fn claim_expired_at(&self, now: DateTime<Utc>, claim_expiry: chrono::Duration) -> bool {
        self.status == QueueStatus::Claimed
            && self
                .claimed_at
                .is_some_and(|claimed| now - claimed > claim_expiry)
    }

    /// Validate a status transition.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::IllegalQueueTransition`] when the queue state
    /// machine forbids the move.
    pub fn validate_transition(from: QueueStatus, to: QueueStatus) -> Result<(), StateError> {
        let legal = matches!(
            (from, to),
            (QueueStatus::Queued, QueueStatus::Claimed)
                | (
                    QueueStatus::Claimed,
                    QueueStatus::Sent
                        | QueueStatus::Skipped
                        | QueueStatus::Failed
                        | QueueStatus::DeadLetter
                        | QueueStatus::Queued
                )
                | (QueueStatus::Failed, QueueStatus::Claimed | QueueStatus::DeadLetter)
        );

        if legal {
            Ok(())
        } else {
            Err(StateError::IllegalQueueTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}
