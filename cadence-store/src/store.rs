//! Capability traits over the relational store.
//!
//! The pipeline's components each depend on the narrowest trait that covers
//! them; backends implement the lot. The umbrella [`Store`] trait exists so
//! wiring code can hold one `Arc<dyn Store>`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use cadence_common::{
    abtest::{AbTest, AbVariant, VariantState},
    audience::{RecipientProfile, Subscriber},
    campaign::{Campaign, CampaignState, SendingProfile},
    decision::AgentDecision,
    events::{CampaignAlert, CampaignCounters, RealtimeMetricsRow, TrackingEvent},
    ids::{
        CampaignId, ListId, OrgId, QueueRowId, SegmentId, SendingProfileId, SubscriberId,
        SuppressionListId, VariantId, WorkerId,
    },
    queue::{QueueRow, QueueStatus},
    throttle::{DailyDomainStats, OrgThrottleConfig},
};

use crate::{
    error::Result,
    types::{CampaignRowStats, ContentPatch, NewQueueRow, WorkerRecord},
};

/// Campaign lifecycle and sending-profile resolution.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Load one campaign.
    async fn campaign(&self, id: CampaignId) -> Result<Campaign>;

    /// Move every `scheduled` campaign whose send time falls within the
    /// edit-lock horizon to `preparing`, closing its edit window. Returns
    /// the number promoted.
    async fn promote_due_campaigns(&self, horizon: DateTime<Utc>) -> Result<u64>;

    /// The `N` earliest campaigns in `{scheduled, preparing}` due at `now`,
    /// ordered by `scheduled_at` ascending.
    async fn due_campaigns(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Campaign>>;

    /// Conditionally transition `id` from any of `from` to `to`. Returns
    /// `false` when the campaign was not in an eligible state (another
    /// worker won the race, or the operator intervened).
    async fn try_transition(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
    ) -> Result<bool>;

    /// Apply a content patch, rejecting it inside the edit-lock window.
    async fn update_campaign_content(
        &self,
        id: CampaignId,
        patch: ContentPatch,
        now: DateTime<Utc>,
        edit_lock: chrono::Duration,
    ) -> Result<()>;

    /// Rewrite live content (A/B winner promotion). Not subject to the
    /// edit lock: remaining sends must pick the winning copy up.
    async fn rewrite_live_content(
        &self,
        id: CampaignId,
        subject: Option<&str>,
        from_name: Option<&str>,
    ) -> Result<()>;

    /// Stamp a terminal outcome.
    async fn complete_campaign(
        &self,
        id: CampaignId,
        state: CampaignState,
        sent_count: u64,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Add to the campaign's running sent counter.
    async fn add_sent_count(&self, id: CampaignId, n: u64) -> Result<()>;

    /// Record the materialized audience size.
    async fn set_total_recipients(&self, id: CampaignId, n: u64) -> Result<()>;

    /// Campaigns currently in `state`.
    async fn campaigns_in_state(&self, state: CampaignState, limit: u64) -> Result<Vec<Campaign>>;

    /// Load one sending profile.
    async fn sending_profile(&self, id: SendingProfileId) -> Result<SendingProfile>;

    /// The org's default sending profile, when one is marked.
    async fn default_sending_profile(&self, org: OrgId) -> Result<Option<SendingProfile>>;

    /// Cancel from any non-terminal state. Returns whether a transition
    /// happened.
    async fn cancel_campaign(&self, id: CampaignId) -> Result<bool> {
        self.try_transition(
            id,
            &[
                CampaignState::Draft,
                CampaignState::Scheduled,
                CampaignState::Preparing,
                CampaignState::Sending,
                CampaignState::Paused,
            ],
            CampaignState::Cancelled,
        )
        .await
    }

    /// Pause an active campaign. Returns whether a transition happened.
    async fn pause_campaign(&self, id: CampaignId) -> Result<bool> {
        self.try_transition(
            id,
            &[
                CampaignState::Scheduled,
                CampaignState::Preparing,
                CampaignState::Sending,
            ],
            CampaignState::Paused,
        )
        .await
    }
}

/// The durable per-recipient work queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert rows as `queued`, silently dropping `(campaign, recipient)`
    /// duplicates. Returns the number actually inserted.
    async fn enqueue_rows(&self, rows: Vec<NewQueueRow>) -> Result<u64>;

    /// Atomically claim up to `limit` due rows for `worker`, ordered by
    /// `(priority DESC, scheduled_at ASC)`, skipping rows claimed by
    /// others. `failed` rows are claimable again alongside `queued` ones.
    async fn claim_batch(
        &self,
        worker: WorkerId,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueRow>>;

    /// Return rows whose claim is older than `claim_expiry` to `queued`.
    /// Returns the number reclaimed.
    async fn release_expired_claims(
        &self,
        now: DateTime<Utc>,
        claim_expiry: chrono::Duration,
    ) -> Result<u64>;

    /// Terminal success. Only the claiming worker may call this.
    async fn mark_sent(&self, id: QueueRowId, worker: WorkerId, message_id: &str) -> Result<()>;

    /// Terminal policy skip. Only the claiming worker may call this.
    async fn mark_skipped(&self, id: QueueRowId, worker: WorkerId, reason: &str) -> Result<()>;

    /// Record a failed attempt; promotes to `dead_letter` once
    /// `attempts + 1 >= max_retries`. Returns the resulting status.
    async fn mark_failed(
        &self,
        id: QueueRowId,
        worker: WorkerId,
        error: &str,
        max_retries: u32,
    ) -> Result<QueueStatus>;

    /// Put a claimed row back to `queued` without counting an attempt
    /// (rate-denied path), optionally pushing `scheduled_at` forward.
    async fn restore_queued(
        &self,
        id: QueueRowId,
        worker: WorkerId,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Per-status counts for one campaign.
    async fn row_stats(&self, campaign: CampaignId) -> Result<CampaignRowStats>;

    /// Rows in `{queued, claimed}` across every campaign.
    async fn queue_depth(&self) -> Result<u64>;

    /// All rows for a campaign. Observability/control surface.
    async fn rows_for_campaign(&self, campaign: CampaignId) -> Result<Vec<QueueRow>>;

    /// Drop A/B variant overrides from the campaign's not-yet-terminal
    /// rows, so remaining sends fall back to the campaign's (rewritten)
    /// live content. Returns the number of rows touched.
    async fn clear_variant_overrides(&self, campaign: CampaignId) -> Result<u64>;
}

/// Audience resolution: lists, segments.
#[async_trait]
pub trait AudienceStore: Send + Sync {
    /// Active subscribers on a static list, capped at `cap` when given.
    async fn list_recipients(&self, list: ListId, cap: Option<u64>) -> Result<Vec<Subscriber>>;

    /// Active subscribers matching every condition of a stored segment.
    async fn segment_recipients(
        &self,
        segment: SegmentId,
        cap: Option<u64>,
    ) -> Result<Vec<Subscriber>>;
}

/// Per-recipient intelligence profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Profiles for the given subscribers; absent profiles are omitted.
    async fn profiles_for(&self, ids: &[SubscriberId]) -> Result<Vec<RecipientProfile>>;

    /// The audience-wide best send hour: the most common confident
    /// per-recipient optimal hour, when any exist.
    async fn audience_best_hour(&self, org: OrgId) -> Result<Option<u8>>;
}

/// Suppression lookups.
#[async_trait]
pub trait SuppressionStore: Send + Sync {
    /// Every normalized address on the global suppression set. Loaded once
    /// into the in-process hub; this is not a per-send query.
    async fn load_global_suppression(&self) -> Result<Vec<String>>;

    /// Whether `md5_hash` appears on any of the given named lists.
    async fn any_list_contains(
        &self,
        lists: &[SuppressionListId],
        md5_hash: &str,
    ) -> Result<bool>;
}

/// Durable agent decisions.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Insert a batch of decisions (the preprocessor writes 500 at a time).
    async fn insert_decisions(&self, decisions: &[AgentDecision]) -> Result<()>;

    /// Flag the decision for `(campaign, subscriber)` as executed.
    async fn mark_decision_executed(
        &self,
        campaign: CampaignId,
        subscriber: SubscriberId,
    ) -> Result<()>;

    /// Load one decision.
    async fn decision(
        &self,
        campaign: CampaignId,
        subscriber: SubscriberId,
    ) -> Result<Option<AgentDecision>>;
}

/// Outcome events, metrics rows, alerts.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one tracking event.
    async fn record_event(&self, event: &TrackingEvent) -> Result<()>;

    /// Cumulative outcome counters for a campaign.
    async fn campaign_counters(&self, campaign: CampaignId) -> Result<CampaignCounters>;

    /// Append a realtime metrics row.
    async fn append_metrics_row(&self, row: &RealtimeMetricsRow) -> Result<()>;

    /// Metrics rows for a campaign recorded at or after `since`, oldest
    /// first. Feeds the auto-tuner's trailing window.
    async fn metrics_rows_since(
        &self,
        campaign: CampaignId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RealtimeMetricsRow>>;

    /// Raise a campaign alert.
    async fn insert_alert(&self, alert: &CampaignAlert) -> Result<()>;
}

/// Per-org throttle envelopes and their daily statistics.
#[async_trait]
pub trait ThrottleConfigStore: Send + Sync {
    /// The org's throttle envelope, when configured.
    async fn throttle_config(&self, org: OrgId) -> Result<Option<OrgThrottleConfig>>;

    /// Create or replace the org's envelope.
    async fn put_throttle_config(&self, config: &OrgThrottleConfig) -> Result<()>;

    /// Accumulate one day's outcome counts for `(org, domain)`.
    async fn record_daily_stat(
        &self,
        org: OrgId,
        domain: &str,
        day: NaiveDate,
        sent: u64,
        bounced: u64,
        complained: u64,
    ) -> Result<()>;

    /// Daily stats for `(org, domain)` on or after `since`.
    async fn daily_stats_since(
        &self,
        org: OrgId,
        domain: &str,
        since: NaiveDate,
    ) -> Result<Vec<DailyDomainStats>>;
}

/// A/B tests and variants.
#[async_trait]
pub trait AbTestStore: Send + Sync {
    /// The campaign's test configuration, when it has one.
    async fn ab_test(&self, campaign: CampaignId) -> Result<Option<AbTest>>;

    /// Every variant of the campaign's test.
    async fn variants(&self, campaign: CampaignId) -> Result<Vec<AbVariant>>;

    /// Record one recipient's assignment and bump the variant's counter.
    async fn record_assignment(&self, variant: VariantId, subscriber: SubscriberId) -> Result<()>;

    /// Update a variant's lifecycle state.
    async fn set_variant_state(&self, variant: VariantId, state: VariantState) -> Result<()>;

    /// Stamp the test as decided.
    async fn mark_test_decided(&self, campaign: CampaignId, at: DateTime<Utc>) -> Result<()>;

    /// Accumulate outcome counts onto a variant (fed by event ingestion).
    async fn add_variant_stats(
        &self,
        variant: VariantId,
        opens: u64,
        clicks: u64,
        conversions: u64,
    ) -> Result<()>;
}

/// Worker registry.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Register a worker at startup.
    async fn register_worker(&self, record: &WorkerRecord) -> Result<()>;

    /// Refresh a worker's heartbeat.
    async fn worker_heartbeat(&self, id: WorkerId, at: DateTime<Utc>) -> Result<()>;

    /// Remove a worker at shutdown.
    async fn deregister_worker(&self, id: WorkerId) -> Result<()>;
}

/// Bounded retention deletes. Every method removes at most `limit` rows and
/// returns the number affected; the cleanup worker loops until zero.
#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    /// `{sent, skipped}` queue rows finished before `cutoff`.
    async fn delete_terminal_queue_rows(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64>;

    /// `dead_letter` queue rows finished before `cutoff`.
    async fn delete_dead_letter_rows(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64>;

    /// Executed agent decisions older than `cutoff`.
    async fn delete_executed_decisions(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64>;

    /// Tracking events older than `cutoff`.
    async fn delete_tracking_events(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64>;
}

/// The full store surface, plus the advisory-lock fallback used by the
/// distributed lock manager.
pub trait Store:
    CampaignStore
    + QueueStore
    + AudienceStore
    + ProfileStore
    + SuppressionStore
    + DecisionStore
    + EventStore
    + ThrottleConfigStore
    + AbTestStore
    + WorkerStore
    + MaintenanceStore
    + cadence_kv::AdvisoryLocker
{
}

impl<T> Store for T where
    T: CampaignStore
        + QueueStore
        + AudienceStore
        + ProfileStore
        + SuppressionStore
        + DecisionStore
        + EventStore
        + ThrottleConfigStore
        + AbTestStore
        + WorkerStore
        + MaintenanceStore
        + cadence_kv::AdvisoryLocker
{
}
