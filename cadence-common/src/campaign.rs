//! Campaign domain model and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::StateError,
    ids::{CampaignId, ListId, OrgId, SegmentId, SendingProfileId, SuppressionListId},
};

/// Lifecycle state of a campaign.
///
/// ```text
/// draft -> scheduled -> preparing -> sending -> completed
///                                            -> completed_with_errors
///                                            -> failed
/// ```
///
/// `paused` is reachable from `scheduled`/`preparing`/`sending`; `cancelled`
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Draft,
    Scheduled,
    Preparing,
    Sending,
    Paused,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl CampaignState {
    /// Whether no further transitions are possible from this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed | Self::Cancelled
        )
    }

    /// Whether the ordinary state machine permits `self -> to`.
    ///
    /// Cancellation is handled separately: it is legal from every
    /// non-terminal state.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Draft, Self::Scheduled)
            | (Self::Scheduled, Self::Preparing | Self::Sending | Self::Paused)
            | (Self::Preparing, Self::Sending | Self::Paused | Self::Completed)
            | (
                Self::Sending,
                Self::Completed | Self::CompletedWithErrors | Self::Failed | Self::Paused,
            )
            | (Self::Paused, Self::Scheduled | Self::Sending) => true,
            (from, Self::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Validate a transition, returning a typed error on violation.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::IllegalCampaignTransition`] when the state
    /// machine forbids the move.
    pub fn transition_to(self, to: Self) -> Result<Self, StateError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(StateError::IllegalCampaignTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Preparing => "preparing",
            Self::Sending => "sending",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "scheduled" => Some(Self::Scheduled),
            "preparing" => Some(Self::Preparing),
            "sending" => Some(Self::Sending),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Coarse send-pacing tier chosen by the campaign author.
///
/// Maps to the claim priority of every queue row the campaign produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleSpeed {
    Instant,
    Gentle,
    #[default]
    Moderate,
    Careful,
}

impl ThrottleSpeed {
    /// Queue priority for rows produced under this tier.
    #[must_use]
    pub const fn priority(self) -> i32 {
        match self {
            Self::Instant => 10,
            Self::Gentle => 7,
            Self::Moderate => 5,
            Self::Careful => 3,
        }
    }
}

/// Weighted split of a campaign across several sending profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EspQuota {
    pub profile_id: SendingProfileId,
    /// Share of recipients routed to this profile, 0-100.
    pub percent: u8,
}

/// Audience source: a static list or a stored segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    List(ListId),
    Segment(SegmentId),
}

/// One authored message plus its delivery configuration and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub org_id: OrgId,
    pub name: String,

    // Content
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub preheader: Option<String>,
    pub from_name: String,
    pub from_email: String,
    pub reply_to: Option<String>,

    // Routing
    pub audience: Audience,
    pub sending_profile_id: Option<SendingProfileId>,
    #[serde(default)]
    pub esp_quotas: Vec<EspQuota>,
    #[serde(default)]
    pub suppression_list_ids: Vec<SuppressionListId>,
    pub max_recipients: Option<u64>,

    // Scheduling
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub throttle_speed: ThrottleSpeed,
    #[serde(default)]
    pub ai_send_time: bool,
    #[serde(default)]
    pub auto_optimize: bool,
    /// Whether the agent preprocessor classifies this campaign's audience.
    #[serde(default)]
    pub agent_enabled: bool,

    pub state: CampaignState,
    #[serde(default)]
    pub sent_count: u64,
    #[serde(default)]
    pub total_recipients: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Whether `scheduled_at` falls within the edit-lock window at `now`.
    #[must_use]
    pub fn is_edit_locked_at(&self, now: DateTime<Utc>, edit_lock: chrono::Duration) -> bool {
        !self.state.is_terminal() && self.scheduled_at - now <= edit_lock
    }
}

/// Credentials and routing for one ESP account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingProfile {
    pub id: SendingProfileId,
    pub org_id: OrgId,
    /// Adapter key, e.g. `"sendgrid"` or `"ses"`. Opaque to the pipeline.
    pub esp_type: String,
    pub endpoint: String,
    pub api_key: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Content a worker renders for one campaign, resolved once and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContent {
    pub org_id: OrgId,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub preheader: Option<String>,
    pub from_name: String,
    pub from_email: String,
    pub reply_to: Option<String>,
    pub sending_profile_id: Option<SendingProfileId>,
    pub suppression_list_ids: Vec<SuppressionListId>,
    pub esp_type: String,
}

impl CampaignContent {
    /// Derive worker-facing content from a campaign and its resolved profile.
    #[must_use]
    pub fn from_campaign(campaign: &Campaign, esp_type: &str) -> Self {
        Self {
            org_id: campaign.org_id,
            subject: campaign.subject.clone(),
            html: campaign.html_body.clone(),
            text: campaign.text_body.clone(),
            preheader: campaign.preheader.clone(),
            from_name: campaign.from_name.clone(),
            from_email: campaign.from_email.clone(),
            reply_to: campaign.reply_to.clone(),
            sending_profile_id: campaign.sending_profile_id,
            suppression_list_ids: campaign.suppression_list_ids.clone(),
            esp_type: esp_type.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut state = CampaignState::Draft;
        for next in [
            CampaignState::Scheduled,
            CampaignState::Preparing,
            CampaignState::Sending,
            CampaignState::Completed,
        ] {
            state = state.transition_to(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn cancel_allowed_from_any_non_terminal_state() {
        for state in [
            CampaignState::Draft,
            CampaignState::Scheduled,
            CampaignState::Preparing,
            CampaignState::Sending,
            CampaignState::Paused,
        ] {
            assert!(state.can_transition_to(CampaignState::Cancelled), "{state:?}");
        }

        for state in [
            CampaignState::Completed,
            CampaignState::CompletedWithErrors,
            CampaignState::Failed,
            CampaignState::Cancelled,
        ] {
            assert!(!state.can_transition_to(CampaignState::Cancelled), "{state:?}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(
            CampaignState::Completed
                .transition_to(CampaignState::Sending)
                .is_err()
        );
        assert!(
            CampaignState::Cancelled
                .transition_to(CampaignState::Scheduled)
                .is_err()
        );
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(
            CampaignState::Draft
                .transition_to(CampaignState::Sending)
                .is_err()
        );
    }

    #[test]
    fn throttle_speed_priorities() {
        assert_eq!(ThrottleSpeed::Instant.priority(), 10);
        assert_eq!(ThrottleSpeed::Gentle.priority(), 7);
        assert_eq!(ThrottleSpeed::Moderate.priority(), 5);
        assert_eq!(ThrottleSpeed::Careful.priority(), 3);
    }

    #[test]
    fn state_round_trips_storage_form() {
        for state in [
            CampaignState::Draft,
            CampaignState::Scheduled,
            CampaignState::Preparing,
            CampaignState::Sending,
            CampaignState::Paused,
            CampaignState::Completed,
            CampaignState::CompletedWithErrors,
            CampaignState::Failed,
            CampaignState::Cancelled,
        ] {
            assert_eq!(CampaignState::from_str_opt(state.as_str()), Some(state));
        }
        assert_eq!(CampaignState::from_str_opt("bogus"), None);
    }
}
