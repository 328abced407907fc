//! In-memory store backend.
//!
//! Implements every store capability over a single `RwLock`-guarded state,
//! with the same observable semantics as the Postgres backend: conditional
//! transitions, claim ownership enforcement, and idempotent enqueue. The
//! entire workspace's test suites run against this backend.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;

use cadence_common::{
    abtest::{AbTest, AbVariant, VariantState},
    audience::{RecipientProfile, Segment, Subscriber, SubscriberStatus},
    campaign::{Campaign, CampaignState, SendingProfile},
    decision::AgentDecision,
    error::StateError,
    events::{
        CampaignAlert, CampaignCounters, RealtimeMetricsRow, TrackingEvent, TrackingEventKind,
    },
    ids::{
        CampaignId, ListId, OrgId, QueueRowId, SegmentId, SendingProfileId, SubscriberId,
        SuppressionListId, VariantId, WorkerId,
    },
    queue::{QueueRow, QueueStatus},
    throttle::{DailyDomainStats, OrgThrottleConfig},
};
use cadence_kv::{AdvisoryLocker, KvError};

use crate::{
    error::{Result, StoreError},
    segment,
    store::{
        AbTestStore, AudienceStore, CampaignStore, DecisionStore, EventStore, MaintenanceStore,
        ProfileStore, QueueStore, SuppressionStore, ThrottleConfigStore, WorkerStore,
    },
    types::{CampaignRowStats, ContentPatch, NewQueueRow, WorkerRecord},
};

#[derive(Debug, Default)]
struct Inner {
    campaigns: HashMap<CampaignId, Campaign>,
    queue: HashMap<QueueRowId, QueueRow>,
    queue_pairs: HashSet<(CampaignId, SubscriberId)>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    segments: HashMap<SegmentId, Segment>,
    profiles: HashMap<SubscriberId, RecipientProfile>,
    global_suppression: HashSet<String>,
    list_suppression: HashMap<SuppressionListId, HashSet<String>>,
    decisions: HashMap<(CampaignId, SubscriberId), AgentDecision>,
    events: Vec<TrackingEvent>,
    metrics_rows: Vec<RealtimeMetricsRow>,
    alerts: Vec<CampaignAlert>,
    throttle_configs: HashMap<OrgId, OrgThrottleConfig>,
    daily_stats: HashMap<(OrgId, String, NaiveDate), DailyDomainStats>,
    ab_tests: HashMap<CampaignId, AbTest>,
    variants: HashMap<VariantId, AbVariant>,
    assignments: Vec<(VariantId, SubscriberId)>,
    sending_profiles: HashMap<SendingProfileId, SendingProfile>,
    workers: HashMap<WorkerId, WorkerRecord>,
    advisory_locks: HashSet<String>,
}

/// A process-local [`crate::Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding surface. Campaign authoring, subscriber CRUD, and suppression
    // ingestion are external collaborators; tests and tools use these to
    // stand in for them.

    /// Insert or replace a campaign.
    pub fn insert_campaign(&self, campaign: Campaign) {
        self.inner.write().campaigns.insert(campaign.id, campaign);
    }

    /// Insert or replace a subscriber.
    pub fn insert_subscriber(&self, subscriber: Subscriber) {
        self.inner
            .write()
            .subscribers
            .insert(subscriber.id, subscriber);
    }

    /// Insert or replace a segment definition.
    pub fn insert_segment(&self, segment: Segment) {
        self.inner.write().segments.insert(segment.id, segment);
    }

    /// Insert or replace a recipient profile.
    pub fn insert_profile(&self, profile: RecipientProfile) {
        self.inner
            .write()
            .profiles
            .insert(profile.subscriber_id, profile);
    }

    /// Add a normalized address to the global suppression set.
    pub fn add_global_suppression(&self, address: &str) {
        self.inner
            .write()
            .global_suppression
            .insert(address.trim().to_ascii_lowercase());
    }

    /// Add an MD5 entry to a named suppression list.
    pub fn add_list_suppression(&self, list: SuppressionListId, md5_hash: &str) {
        self.inner
            .write()
            .list_suppression
            .entry(list)
            .or_default()
            .insert(md5_hash.to_string());
    }

    /// Insert or replace a sending profile.
    pub fn insert_sending_profile(&self, profile: SendingProfile) {
        self.inner
            .write()
            .sending_profiles
            .insert(profile.id, profile);
    }

    /// Attach an A/B test to a campaign.
    pub fn insert_ab_test(&self, test: AbTest) {
        self.inner.write().ab_tests.insert(test.campaign_id, test);
    }

    /// Insert or replace a variant.
    pub fn insert_variant(&self, variant: AbVariant) {
        self.inner.write().variants.insert(variant.id, variant);
    }

    fn owned_claimed_row<'a>(
        inner: &'a mut Inner,
        id: QueueRowId,
        worker: WorkerId,
    ) -> Result<&'a mut QueueRow> {
        let row = inner
            .queue
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("queue row {id}")))?;
        if row.status != QueueStatus::Claimed || row.claimed_by != Some(worker) {
            return Err(StoreError::Conflict(format!(
                "queue row {id} not claimed by {worker}"
            )));
        }
        Ok(row)
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.inner
            .read()
            .campaigns
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))
    }

    async fn promote_due_campaigns(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut promoted = 0;
        for campaign in inner.campaigns.values_mut() {
            if campaign.state == CampaignState::Scheduled && campaign.scheduled_at <= horizon {
                campaign.state = CampaignState::Preparing;
                campaign.updated_at = Utc::now();
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn due_campaigns(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Campaign>> {
        let inner = self.inner.read();
        let mut due: Vec<Campaign> = inner
            .campaigns
            .values()
            .filter(|c| {
                matches!(c.state, CampaignState::Scheduled | CampaignState::Preparing)
                    && c.scheduled_at <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn try_transition(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("campaign {id}")));
        };
        if from.contains(&campaign.state) {
            campaign.state = to;
            campaign.updated_at = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn update_campaign_content(
        &self,
        id: CampaignId,
        patch: ContentPatch,
        now: DateTime<Utc>,
        edit_lock: chrono::Duration,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("campaign {id}")));
        };

        if campaign.is_edit_locked_at(now, edit_lock) {
            return Err(StoreError::State(StateError::EditLocked {
                minutes_to_send: (campaign.scheduled_at - now).num_minutes(),
            }));
        }

        if let Some(subject) = patch.subject {
            campaign.subject = subject;
        }
        if let Some(html) = patch.html_body {
            campaign.html_body = html;
        }
        if let Some(text) = patch.text_body {
            campaign.text_body = text;
        }
        if let Some(preheader) = patch.preheader {
            campaign.preheader = Some(preheader);
        }
        if let Some(from_name) = patch.from_name {
            campaign.from_name = from_name;
        }
        if let Some(from_email) = patch.from_email {
            campaign.from_email = from_email;
        }
        if let Some(reply_to) = patch.reply_to {
            campaign.reply_to = Some(reply_to);
        }
        campaign.updated_at = now;
        Ok(())
    }

    async fn rewrite_live_content(
        &self,
        id: CampaignId,
        subject: Option<&str>,
        from_name: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("campaign {id}")));
        };
        if let Some(subject) = subject {
            campaign.subject = subject.to_string();
        }
        if let Some(from_name) = from_name {
            campaign.from_name = from_name.to_string();
        }
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_campaign(
        &self,
        id: CampaignId,
        state: CampaignState,
        sent_count: u64,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("campaign {id}")));
        };
        campaign.state = state;
        campaign.sent_count = sent_count;
        campaign.completed_at = Some(completed_at);
        campaign.updated_at = completed_at;
        Ok(())
    }

    async fn add_sent_count(&self, id: CampaignId, n: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("campaign {id}")));
        };
        campaign.sent_count += n;
        Ok(())
    }

    async fn set_total_recipients(&self, id: CampaignId, n: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("campaign {id}")));
        };
        campaign.total_recipients = n;
        Ok(())
    }

    async fn campaigns_in_state(
        &self,
        state: CampaignState,
        limit: u64,
    ) -> Result<Vec<Campaign>> {
        let inner = self.inner.read();
        let mut campaigns: Vec<Campaign> = inner
            .campaigns
            .values()
            .filter(|c| c.state == state)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.id);
        campaigns.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(campaigns)
    }

    async fn sending_profile(&self, id: SendingProfileId) -> Result<SendingProfile> {
        self.inner
            .read()
            .sending_profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("sending profile {id}")))
    }

    async fn default_sending_profile(&self, org: OrgId) -> Result<Option<SendingProfile>> {
        Ok(self
            .inner
            .read()
            .sending_profiles
            .values()
            .find(|p| p.org_id == org && p.is_default)
            .cloned())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue_rows(&self, rows: Vec<NewQueueRow>) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut inserted = 0;
        for row in rows {
            let pair = (row.campaign_id, row.subscriber_id);
            if !inner.queue_pairs.insert(pair) {
                continue;
            }
            inner.queue.insert(
                row.id,
                QueueRow {
                    id: row.id,
                    campaign_id: row.campaign_id,
                    subscriber_id: row.subscriber_id,
                    recipient: row.recipient,
                    substitutions: row.substitutions,
                    variant_subject: row.variant_subject,
                    variant_html: row.variant_html,
                    variant_text: row.variant_text,
                    variant_from_name: row.variant_from_name,
                    priority: row.priority,
                    scheduled_at: row.scheduled_at,
                    status: QueueStatus::Queued,
                    claimed_by: None,
                    claimed_at: None,
                    attempts: 0,
                    last_error: None,
                    skip_reason: None,
                    message_id: None,
                    created_at: Utc::now(),
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        worker: WorkerId,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueRow>> {
        let mut inner = self.inner.write();

        // Rows whose campaign has left `sending` (paused, cancelled) are
        // not claimable; rows without a stored campaign are, which keeps
        // queue-level tooling usable on its own.
        let campaigns = &inner.campaigns;
        let mut eligible: Vec<(i32, DateTime<Utc>, QueueRowId)> = inner
            .queue
            .values()
            .filter(|row| {
                matches!(row.status, QueueStatus::Queued | QueueStatus::Failed)
                    && row.scheduled_at <= now
                    && campaigns
                        .get(&row.campaign_id)
                        .is_none_or(|c| c.state == CampaignState::Sending)
            })
            .map(|row| (row.priority, row.scheduled_at, row.id))
            .collect();

        // Claim order: priority first, then earliest due.
        eligible.sort_by(|(pa, sa, _), (pb, sb, _)| pb.cmp(pa).then(sa.cmp(sb)));
        eligible.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, id) in eligible {
            if let Some(row) = inner.queue.get_mut(&id) {
                row.status = QueueStatus::Claimed;
                row.claimed_by = Some(worker);
                row.claimed_at = Some(now);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_expired_claims(
        &self,
        now: DateTime<Utc>,
        claim_expiry: chrono::Duration,
    ) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut released = 0;
        for row in inner.queue.values_mut() {
            if row.claim_expired_at(now, claim_expiry) {
                row.status = QueueStatus::Queued;
                row.claimed_by = None;
                row.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn mark_sent(&self, id: QueueRowId, worker: WorkerId, message_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let row = Self::owned_claimed_row(&mut inner, id, worker)?;
        row.status = QueueStatus::Sent;
        row.message_id = Some(message_id.to_string());
        Ok(())
    }

    async fn mark_skipped(&self, id: QueueRowId, worker: WorkerId, reason: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let row = Self::owned_claimed_row(&mut inner, id, worker)?;
        row.status = QueueStatus::Skipped;
        row.skip_reason = Some(reason.to_string());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: QueueRowId,
        worker: WorkerId,
        error: &str,
        max_retries: u32,
    ) -> Result<QueueStatus> {
        let mut inner = self.inner.write();
        let row = Self::owned_claimed_row(&mut inner, id, worker)?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        row.claimed_by = None;
        row.claimed_at = None;
        row.status = if row.attempts >= max_retries {
            QueueStatus::DeadLetter
        } else {
            QueueStatus::Failed
        };
        Ok(row.status)
    }

    async fn restore_queued(
        &self,
        id: QueueRowId,
        worker: WorkerId,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let row = Self::owned_claimed_row(&mut inner, id, worker)?;
        row.status = QueueStatus::Queued;
        row.claimed_by = None;
        row.claimed_at = None;
        if let Some(at) = not_before {
            row.scheduled_at = at;
        }
        Ok(())
    }

    async fn row_stats(&self, campaign: CampaignId) -> Result<CampaignRowStats> {
        let inner = self.inner.read();
        let mut stats = CampaignRowStats::default();
        for row in inner.queue.values().filter(|r| r.campaign_id == campaign) {
            stats.total += 1;
            match row.status {
                QueueStatus::Queued => stats.queued += 1,
                QueueStatus::Claimed => stats.claimed += 1,
                QueueStatus::Sent => stats.sent += 1,
                QueueStatus::Skipped => stats.skipped += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::DeadLetter => stats.dead_letter += 1,
            }
        }
        Ok(stats)
    }

    async fn queue_depth(&self) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner
            .queue
            .values()
            .filter(|r| matches!(r.status, QueueStatus::Queued | QueueStatus::Claimed))
            .count() as u64)
    }

    async fn rows_for_campaign(&self, campaign: CampaignId) -> Result<Vec<QueueRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<QueueRow> = inner
            .queue
            .values()
            .filter(|r| r.campaign_id == campaign)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn clear_variant_overrides(&self, campaign: CampaignId) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut touched = 0;
        for row in inner
            .queue
            .values_mut()
            .filter(|r| r.campaign_id == campaign && !r.status.is_terminal())
        {
            if row.variant_subject.is_some()
                || row.variant_html.is_some()
                || row.variant_text.is_some()
                || row.variant_from_name.is_some()
            {
                row.variant_subject = None;
                row.variant_html = None;
                row.variant_text = None;
                row.variant_from_name = None;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[async_trait]
impl AudienceStore for MemoryStore {
    async fn list_recipients(&self, list: ListId, cap: Option<u64>) -> Result<Vec<Subscriber>> {
        let inner = self.inner.read();
        let mut subscribers: Vec<Subscriber> = inner
            .subscribers
            .values()
            .filter(|s| s.status == SubscriberStatus::Active && s.list_ids.contains(&list))
            .cloned()
            .collect();
        subscribers.sort_by_key(|s| s.id);
        if let Some(cap) = cap {
            subscribers.truncate(usize::try_from(cap).unwrap_or(usize::MAX));
        }
        Ok(subscribers)
    }

    async fn segment_recipients(
        &self,
        segment: SegmentId,
        cap: Option<u64>,
    ) -> Result<Vec<Subscriber>> {
        let inner = self.inner.read();
        let definition = inner
            .segments
            .get(&segment)
            .ok_or_else(|| StoreError::NotFound(format!("segment {segment}")))?;

        let mut subscribers: Vec<Subscriber> = inner
            .subscribers
            .values()
            .filter(|s| {
                s.org_id == definition.org_id
                    && s.status == SubscriberStatus::Active
                    && segment::matches_all(s, &definition.conditions)
            })
            .cloned()
            .collect();
        subscribers.sort_by_key(|s| s.id);
        if let Some(cap) = cap {
            subscribers.truncate(usize::try_from(cap).unwrap_or(usize::MAX));
        }
        Ok(subscribers)
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn profiles_for(&self, ids: &[SubscriberId]) -> Result<Vec<RecipientProfile>> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| inner.profiles.get(id))
            .cloned()
            .collect())
    }

    async fn audience_best_hour(&self, org: OrgId) -> Result<Option<u8>> {
        let inner = self.inner.read();
        let mut histogram = [0_u64; 24];
        for profile in inner.profiles.values() {
            let in_org = inner
                .subscribers
                .get(&profile.subscriber_id)
                .is_some_and(|s| s.org_id == org);
            if !in_org || profile.optimal_hour_confidence < 0.5 {
                continue;
            }
            if let Some(hour) = profile.optimal_hour {
                if let Some(slot) = histogram.get_mut(usize::from(hour)) {
                    *slot += 1;
                }
            }
        }
        let (best, count) = histogram
            .iter()
            .enumerate()
            .max_by_key(|(_, count)| **count)
            .unwrap_or((0, &0));
        if *count == 0 {
            Ok(None)
        } else {
            Ok(u8::try_from(best).ok())
        }
    }
}

#[async_trait]
impl SuppressionStore for MemoryStore {
    async fn load_global_suppression(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .global_suppression
            .iter()
            .cloned()
            .collect())
    }

    async fn any_list_contains(
        &self,
        lists: &[SuppressionListId],
        md5_hash: &str,
    ) -> Result<bool> {
        let inner = self.inner.read();
        Ok(lists.iter().any(|list| {
            inner
                .list_suppression
                .get(list)
                .is_some_and(|entries| entries.contains(md5_hash))
        }))
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn insert_decisions(&self, decisions: &[AgentDecision]) -> Result<()> {
        let mut inner = self.inner.write();
        for decision in decisions {
            inner
                .decisions
                .insert((decision.campaign_id, decision.subscriber_id), decision.clone());
        }
        Ok(())
    }

    async fn mark_decision_executed(
        &self,
        campaign: CampaignId,
        subscriber: SubscriberId,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(decision) = inner.decisions.get_mut(&(campaign, subscriber)) {
            decision.executed = true;
        }
        Ok(())
    }

    async fn decision(
        &self,
        campaign: CampaignId,
        subscriber: SubscriberId,
    ) -> Result<Option<AgentDecision>> {
        Ok(self
            .inner
            .read()
            .decisions
            .get(&(campaign, subscriber))
            .cloned())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn record_event(&self, event: &TrackingEvent) -> Result<()> {
        self.inner.write().events.push(event.clone());
        Ok(())
    }

    async fn campaign_counters(&self, campaign: CampaignId) -> Result<CampaignCounters> {
        let inner = self.inner.read();
        let mut counters = CampaignCounters::default();
        let mut openers: HashSet<SubscriberId> = HashSet::new();
        let mut clickers: HashSet<SubscriberId> = HashSet::new();

        for event in inner.events.iter().filter(|e| e.campaign_id == campaign) {
            match event.kind {
                TrackingEventKind::Sent => counters.sent += 1,
                TrackingEventKind::Delivered => counters.delivered += 1,
                TrackingEventKind::Open => {
                    counters.opens += 1;
                    openers.insert(event.subscriber_id);
                }
                TrackingEventKind::Click => {
                    counters.clicks += 1;
                    clickers.insert(event.subscriber_id);
                }
                TrackingEventKind::Bounce => counters.bounces += 1,
                TrackingEventKind::Complaint => counters.complaints += 1,
                TrackingEventKind::Unsubscribe => counters.unsubscribes += 1,
            }
        }
        counters.unique_opens = openers.len() as u64;
        counters.unique_clicks = clickers.len() as u64;
        Ok(counters)
    }

    async fn append_metrics_row(&self, row: &RealtimeMetricsRow) -> Result<()> {
        self.inner.write().metrics_rows.push(row.clone());
        Ok(())
    }

    async fn metrics_rows_since(
        &self,
        campaign: CampaignId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RealtimeMetricsRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<RealtimeMetricsRow> = inner
            .metrics_rows
            .iter()
            .filter(|r| r.campaign_id == campaign && r.recorded_at >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.recorded_at);
        Ok(rows)
    }

    async fn insert_alert(&self, alert: &CampaignAlert) -> Result<()> {
        self.inner.write().alerts.push(alert.clone());
        Ok(())
    }
}

#[async_trait]
impl ThrottleConfigStore for MemoryStore {
    async fn throttle_config(&self, org: OrgId) -> Result<Option<OrgThrottleConfig>> {
        Ok(self.inner.read().throttle_configs.get(&org).cloned())
    }

    async fn put_throttle_config(&self, config: &OrgThrottleConfig) -> Result<()> {
        self.inner
            .write()
            .throttle_configs
            .insert(config.org_id, config.clone());
        Ok(())
    }

    async fn record_daily_stat(
        &self,
        org: OrgId,
        domain: &str,
        day: NaiveDate,
        sent: u64,
        bounced: u64,
        complained: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .daily_stats
            .entry((org, domain.to_string(), day))
            .or_insert(DailyDomainStats {
                day,
                sent: 0,
                bounced: 0,
                complained: 0,
            });
        entry.sent += sent;
        entry.bounced += bounced;
        entry.complained += complained;
        Ok(())
    }

    async fn daily_stats_since(
        &self,
        org: OrgId,
        domain: &str,
        since: NaiveDate,
    ) -> Result<Vec<DailyDomainStats>> {
        let inner = self.inner.read();
        let mut stats: Vec<DailyDomainStats> = inner
            .daily_stats
            .iter()
            .filter(|((o, d, day), _)| *o == org && d == domain && *day >= since)
            .map(|(_, stat)| *stat)
            .collect();
        stats.sort_by_key(|s| s.day);
        Ok(stats)
    }
}

#[async_trait]
impl AbTestStore for MemoryStore {
    async fn ab_test(&self, campaign: CampaignId) -> Result<Option<AbTest>> {
        Ok(self.inner.read().ab_tests.get(&campaign).cloned())
    }

    async fn variants(&self, campaign: CampaignId) -> Result<Vec<AbVariant>> {
        let inner = self.inner.read();
        let mut variants: Vec<AbVariant> = inner
            .variants
            .values()
            .filter(|v| v.campaign_id == campaign)
            .cloned()
            .collect();
        variants.sort_by_key(|v| v.id);
        Ok(variants)
    }

    async fn record_assignment(&self, variant: VariantId, subscriber: SubscriberId) -> Result<()> {
        let mut inner = self.inner.write();
        inner.assignments.push((variant, subscriber));
        if let Some(v) = inner.variants.get_mut(&variant) {
            v.assigned += 1;
        }
        Ok(())
    }

    async fn set_variant_state(&self, variant: VariantId, state: VariantState) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(v) = inner.variants.get_mut(&variant) else {
            return Err(StoreError::NotFound(format!("variant {variant}")));
        };
        v.state = state;
        Ok(())
    }

    async fn mark_test_decided(&self, campaign: CampaignId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(test) = inner.ab_tests.get_mut(&campaign) else {
            return Err(StoreError::NotFound(format!("ab test for {campaign}")));
        };
        test.decided_at = Some(at);
        Ok(())
    }

    async fn add_variant_stats(
        &self,
        variant: VariantId,
        opens: u64,
        clicks: u64,
        conversions: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(v) = inner.variants.get_mut(&variant) else {
            return Err(StoreError::NotFound(format!("variant {variant}")));
        };
        v.opens += opens;
        v.clicks += clicks;
        v.conversions += conversions;
        Ok(())
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn register_worker(&self, record: &WorkerRecord) -> Result<()> {
        self.inner.write().workers.insert(record.id, record.clone());
        Ok(())
    }

    async fn worker_heartbeat(&self, id: WorkerId, at: DateTime<Utc>) -> Result<()> {
        if let Some(worker) = self.inner.write().workers.get_mut(&id) {
            worker.heartbeat_at = at;
        }
        Ok(())
    }

    async fn deregister_worker(&self, id: WorkerId) -> Result<()> {
        self.inner.write().workers.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl MaintenanceStore for MemoryStore {
    async fn delete_terminal_queue_rows(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let victims: Vec<QueueRowId> = inner
            .queue
            .values()
            .filter(|r| {
                matches!(r.status, QueueStatus::Sent | QueueStatus::Skipped)
                    && r.created_at < cutoff
            })
            .map(|r| r.id)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();
        for id in &victims {
            if let Some(row) = inner.queue.remove(id) {
                inner
                    .queue_pairs
                    .remove(&(row.campaign_id, row.subscriber_id));
            }
        }
        Ok(victims.len() as u64)
    }

    async fn delete_dead_letter_rows(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let victims: Vec<QueueRowId> = inner
            .queue
            .values()
            .filter(|r| r.status == QueueStatus::DeadLetter && r.created_at < cutoff)
            .map(|r| r.id)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();
        for id in &victims {
            if let Some(row) = inner.queue.remove(id) {
                inner
                    .queue_pairs
                    .remove(&(row.campaign_id, row.subscriber_id));
            }
        }
        Ok(victims.len() as u64)
    }

    async fn delete_executed_decisions(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let victims: Vec<(CampaignId, SubscriberId)> = inner
            .decisions
            .iter()
            .filter(|(_, d)| d.executed && d.created_at < cutoff)
            .map(|(key, _)| *key)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();
        for key in &victims {
            inner.decisions.remove(key);
        }
        Ok(victims.len() as u64)
    }

    async fn delete_tracking_events(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut removed = 0_u64;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        inner.events.retain(|event| {
            if removed as usize >= limit || event.occurred_at >= cutoff {
                true
            } else {
                removed += 1;
                false
            }
        });
        Ok(removed)
    }
}

#[async_trait]
impl AdvisoryLocker for MemoryStore {
    async fn try_advisory_lock(&self, name: &str) -> std::result::Result<bool, KvError> {
        Ok(self.inner.write().advisory_locks.insert(name.to_string()))
    }

    async fn release_advisory_lock(&self, name: &str) -> std::result::Result<(), KvError> {
        self.inner.write().advisory_locks.remove(name);
        Ok(())
    }
}
