//! Tracking events, campaign counters, and alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CampaignId, OrgId, SubscriberId};

/// Kind of engagement/outcome event recorded against a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventKind {
    Sent,
    Delivered,
    Open,
    Click,
    Bounce,
    Complaint,
    Unsubscribe,
}

impl TrackingEventKind {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Open => "open",
            Self::Click => "click",
            Self::Bounce => "bounce",
            Self::Complaint => "complaint",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// One recorded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub kind: TrackingEventKind,
    /// Provider message id, when the event maps to one.
    pub message_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Cumulative per-campaign outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub sent: u64,
    pub delivered: u64,
    pub opens: u64,
    pub unique_opens: u64,
    pub clicks: u64,
    pub unique_clicks: u64,
    pub bounces: u64,
    pub complaints: u64,
    pub unsubscribes: u64,
}

impl CampaignCounters {
    /// Per-field difference against an earlier snapshot, saturating at zero.
    #[must_use]
    pub const fn delta_since(&self, earlier: &Self) -> Self {
        Self {
            sent: self.sent.saturating_sub(earlier.sent),
            delivered: self.delivered.saturating_sub(earlier.delivered),
            opens: self.opens.saturating_sub(earlier.opens),
            unique_opens: self.unique_opens.saturating_sub(earlier.unique_opens),
            clicks: self.clicks.saturating_sub(earlier.clicks),
            unique_clicks: self.unique_clicks.saturating_sub(earlier.unique_clicks),
            bounces: self.bounces.saturating_sub(earlier.bounces),
            complaints: self.complaints.saturating_sub(earlier.complaints),
            unsubscribes: self.unsubscribes.saturating_sub(earlier.unsubscribes),
        }
    }

    /// Bounce rate over sends, `0.0` when nothing was sent.
    #[must_use]
    pub fn bounce_rate(&self) -> f64 {
        rate(self.bounces, self.sent)
    }

    /// Complaint rate over sends, `0.0` when nothing was sent.
    #[must_use]
    pub fn complaint_rate(&self) -> f64 {
        rate(self.complaints, self.sent)
    }

    /// Unique-open rate over sends, `0.0` when nothing was sent.
    #[must_use]
    pub fn open_rate(&self) -> f64 {
        rate(self.unique_opens, self.sent)
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// One appended realtime metrics row (cumulative plus interval deltas).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMetricsRow {
    pub campaign_id: CampaignId,
    pub cumulative: CampaignCounters,
    pub delta: CampaignCounters,
    pub recorded_at: DateTime<Utc>,
}

/// Severity of a campaign alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Operator-facing alert raised by the auto-tuner or A/B selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignAlert {
    pub org_id: OrgId,
    pub campaign_id: CampaignId,
    pub severity: AlertSeverity,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_saturates() {
        let earlier = CampaignCounters {
            sent: 10,
            ..CampaignCounters::default()
        };
        let later = CampaignCounters {
            sent: 25,
            opens: 4,
            ..CampaignCounters::default()
        };
        let delta = later.delta_since(&earlier);
        assert_eq!(delta.sent, 15);
        assert_eq!(delta.opens, 4);

        // A reset counter never produces an underflowed delta.
        let reset = CampaignCounters::default();
        assert_eq!(reset.delta_since(&later).sent, 0);
    }

    #[test]
    fn rates_handle_zero_sends() {
        let counters = CampaignCounters::default();
        assert!((counters.bounce_rate() - 0.0).abs() < f64::EPSILON);

        let counters = CampaignCounters {
            sent: 200,
            bounces: 10,
            complaints: 1,
            unique_opens: 50,
            ..CampaignCounters::default()
        };
        assert!((counters.bounce_rate() - 0.05).abs() < 1e-9);
        assert!((counters.complaint_rate() - 0.005).abs() < 1e-9);
        assert!((counters.open_rate() - 0.25).abs() < 1e-9);
    }
}
