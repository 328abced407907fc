//! A/B test variants and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CampaignId, VariantId};

/// Metric the test optimizes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    #[default]
    Opens,
    Clicks,
    Conversions,
}

/// Lifecycle of a variant within a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariantState {
    #[default]
    Active,
    Winner,
    Loser,
    Eliminated,
}

/// One variant: overrides applied to recipients assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbVariant {
    pub id: VariantId,
    pub campaign_id: CampaignId,
    pub name: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// The control variant is the comparison baseline for the Z-test.
    #[serde(default)]
    pub is_control: bool,
    pub state: VariantState,

    pub assigned: u64,
    pub opens: u64,
    pub clicks: u64,
    pub conversions: u64,
}

impl AbVariant {
    /// Successes on the configured target metric.
    #[must_use]
    pub const fn successes(&self, metric: TargetMetric) -> u64 {
        match metric {
            TargetMetric::Opens => self.opens,
            TargetMetric::Clicks => self.clicks,
            TargetMetric::Conversions => self.conversions,
        }
    }
}

/// Test-level configuration attached to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub campaign_id: CampaignId,
    pub target_metric: TargetMetric,
    pub min_sample_size: u64,
    /// Required confidence, e.g. `0.95`.
    pub confidence_threshold: f64,
    pub decided_at: Option<DateTime<Utc>>,
}
