//! Subscribers, segments, and per-recipient intelligence profiles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    address::EmailAddress,
    ids::{ListId, OrgId, SegmentId, SubscriberId},
};

/// Subscription status of a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    #[default]
    Active,
    Unsubscribed,
    Bounced,
    Complained,
}

/// One recipient record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub org_id: OrgId,
    pub email: EmailAddress,
    pub name: Option<String>,
    pub status: SubscriberStatus,
    #[serde(default)]
    pub list_ids: Vec<ListId>,
    /// Free-form per-recipient fields, addressable from segments as
    /// `custom.<key>`.
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Comparison operator usable in a segment condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

/// One `(field, operator, value)` predicate over subscribers.
///
/// `field` is either a built-in column (`email`, `name`, `status`) or a
/// `custom.<key>` reference into [`Subscriber::custom_fields`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// An ordered conjunction of conditions defining a dynamic audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub org_id: OrgId,
    pub name: String,
    pub conditions: Vec<SegmentCondition>,
}

/// Mailbox health as reported by feedback signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailboxState {
    #[default]
    Healthy,
    Degraded,
    Full,
}

/// Per-recipient engagement intelligence consumed by the agent
/// preprocessor and the send-time optimizer.
///
/// The pipeline only reads these profiles; building them is an external
/// concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientProfile {
    pub subscriber_id: SubscriberId,

    /// Engagement score in `[0, 1]`.
    pub engagement_score: f64,
    pub total_sends: u64,
    pub total_opens: u64,
    /// Open-rate trend over the trailing window, roughly `[-1, 1]`.
    pub engagement_trend: f64,
    pub open_rate: f64,

    pub consecutive_bounces: u32,
    pub has_complained: bool,
    pub mailbox_state: MailboxState,
    pub send_suspended_until: Option<DateTime<Utc>>,
    pub last_open_at: Option<DateTime<Utc>>,
    pub first_seen_at: Option<DateTime<Utc>>,

    /// Best send hour in UTC, when known.
    pub optimal_hour: Option<u8>,
    pub optimal_hour_confidence: f64,

    /// Preference score for image-rich content in `[0, 1]`.
    pub image_preference: f64,
    /// Preference score for personalized content in `[0, 1]`.
    pub personalization_preference: f64,
    pub has_purchased: bool,
}
