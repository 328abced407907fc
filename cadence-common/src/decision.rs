//! Agent send decisions: per-recipient classification produced before a
//! campaign's rows are consumed by the workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CampaignId, SubscriberId};

/// What the agent decided to do with one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    SendNow,
    SendLater,
    Defer,
    Suppress,
}

impl Classification {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SendNow => "send_now",
            Self::SendLater => "send_later",
            Self::Defer => "defer",
            Self::Suppress => "suppress",
        }
    }
}

/// How content should be shaped for this recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentStrategy {
    TextPersonalized,
    #[default]
    TextGeneric,
    ImagePersonalized,
    ImageGeneric,
}

impl ContentStrategy {
    /// Whether the HTML (image) part should be kept.
    #[must_use]
    pub const fn prefers_html(self) -> bool {
        matches!(self, Self::ImagePersonalized | Self::ImageGeneric)
    }

    /// Whether merge-field personalization should be applied.
    #[must_use]
    pub const fn is_personalized(self) -> bool {
        matches!(self, Self::TextPersonalized | Self::ImagePersonalized)
    }
}

/// One per-recipient decision, durable in the relational store with a hot
/// JSON copy in the KV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub classification: Classification,
    pub content_strategy: ContentStrategy,
    /// Send priority in `[0, 100]`.
    pub priority: u8,
    /// Best send hour in UTC, `[0, 23]`.
    pub optimal_hour: u8,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
}

/// The slim KV representation workers read on the send path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlimDecision {
    #[serde(rename = "c")]
    pub classification: Classification,
    #[serde(rename = "s")]
    pub content_strategy: ContentStrategy,
    #[serde(rename = "p")]
    pub priority: u8,
    #[serde(rename = "h")]
    pub optimal_hour: u8,
}

impl From<&AgentDecision> for SlimDecision {
    fn from(decision: &AgentDecision) -> Self {
        Self {
            classification: decision.classification,
            content_strategy: decision.content_strategy,
            priority: decision.priority,
            optimal_hour: decision.optimal_hour,
        }
    }
}

/// Campaign-level tally published alongside the per-recipient decisions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub send_now: u64,
    pub send_later: u64,
    pub defer: u64,
    pub suppress: u64,
    pub total: u64,
}

impl DecisionSummary {
    /// Count one decision into the summary.
    pub const fn record(&mut self, classification: Classification) {
        match classification {
            Classification::SendNow => self.send_now += 1,
            Classification::SendLater => self.send_later += 1,
            Classification::Defer => self.defer += 1,
            Classification::Suppress => self.suppress += 1,
        }
        self.total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slim_decision_is_compact() {
        let slim = SlimDecision {
            classification: Classification::SendNow,
            content_strategy: ContentStrategy::ImagePersonalized,
            priority: 80,
            optimal_hour: 10,
        };
        let json = serde_json::to_string(&slim).unwrap();
        assert_eq!(
            json,
            r#"{"c":"send_now","s":"image_personalized","p":80,"h":10}"#
        );
    }

    #[test]
    fn summary_tallies() {
        let mut summary = DecisionSummary::default();
        summary.record(Classification::SendNow);
        summary.record(Classification::SendNow);
        summary.record(Classification::Suppress);
        assert_eq!(summary.send_now, 2);
        assert_eq!(summary.suppress, 1);
        assert_eq!(summary.total, 3);
    }

    #[test]
    fn strategy_flags() {
        assert!(ContentStrategy::ImageGeneric.prefers_html());
        assert!(!ContentStrategy::TextGeneric.prefers_html());
        assert!(ContentStrategy::TextPersonalized.is_personalized());
        assert!(!ContentStrategy::ImageGeneric.is_personalized());
    }
}
