//! The agent preprocessor.
//!
//! Runs once per campaign between scheduler promotion and worker
//! consumption: classifies every recipient, persists the decisions
//! durably in batches, and publishes slim JSON copies plus a campaign
//! summary to the KV store for the workers' hot path.

pub mod classify;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cadence_common::{
    EmailAddress,
    audience::Subscriber,
    decision::{AgentDecision, Classification, ContentStrategy, DecisionSummary, SlimDecision},
    ids::CampaignId,
};
use cadence_kv::{KvStore, put_json};
use cadence_store::{DecisionStore, ProfileStore, Store};

use crate::error::DeliveryError;

/// Durable insert batch size.
const DECISION_BATCH: usize = 500;

/// KV scan/delete batch size for campaign cleanup.
const KV_CLEANUP_BATCH: usize = 500;

/// Default lifetime of the hot decision copies.
const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(24 * 3600);

/// KV key for one recipient's slim decision.
#[must_use]
pub fn decision_key(campaign: CampaignId, address: &EmailAddress) -> String {
    format!("agent:decisions:{campaign}:{}", address.md5_hash())
}

/// KV key for the campaign's decision summary.
#[must_use]
pub fn summary_key(campaign: CampaignId) -> String {
    format!("agent:campaign:{campaign}:summary")
}

/// Classifies a campaign's audience ahead of the workers.
pub struct AgentPreprocessor {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    decision_ttl: Duration,
}

impl std::fmt::Debug for AgentPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPreprocessor").finish_non_exhaustive()
    }
}

impl AgentPreprocessor {
    /// A preprocessor over the given stores, with the default 24-hour
    /// decision lifetime.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            kv,
            decision_ttl: DEFAULT_DECISION_TTL,
        }
    }

    /// Override how long hot decision copies live in the KV store.
    #[must_use]
    pub const fn with_decision_ttl(mut self, ttl: Duration) -> Self {
        self.decision_ttl = ttl;
        self
    }

    /// Classify every recipient of `campaign` and publish the decisions.
    ///
    /// Recipients without an intelligence profile get no decision at all;
    /// the workers treat that as an unconditional send.
    ///
    /// # Errors
    ///
    /// Returns store/KV errors; the scheduler treats the preprocessor as a
    /// fail-open side service and proceeds with materialization anyway.
    pub async fn run_for_campaign(
        &self,
        campaign: CampaignId,
        recipients: &[Subscriber],
        now: DateTime<Utc>,
    ) -> Result<DecisionSummary, DeliveryError> {
        let ids: Vec<_> = recipients.iter().map(|s| s.id).collect();
        let profiles = self.store.profiles_for(&ids).await?;
        let by_subscriber: ahash::AHashMap<_, _> = profiles
            .into_iter()
            .map(|profile| (profile.subscriber_id, profile))
            .collect();

        let mut summary = DecisionSummary::default();
        let mut batch: Vec<AgentDecision> = Vec::with_capacity(DECISION_BATCH);

        for subscriber in recipients {
            let Some(profile) = by_subscriber.get(&subscriber.id) else {
                continue;
            };

            let classification = classify::classify(profile, now);
            summary.record(classification);

            let decision = AgentDecision {
                campaign_id: campaign,
                subscriber_id: subscriber.id,
                classification,
                content_strategy: if classification == Classification::Suppress {
                    ContentStrategy::TextGeneric
                } else {
                    classify::content_strategy(profile)
                },
                priority: classify::priority(profile),
                optimal_hour: profile.optimal_hour.unwrap_or(10),
                executed: false,
                created_at: now,
            };

            if let Err(e) = put_json(
                self.kv.as_ref(),
                &decision_key(campaign, &subscriber.email),
                &SlimDecision::from(&decision),
                self.decision_ttl,
            )
            .await
            {
                warn!(campaign = %campaign, error = %e, "failed to publish decision to KV");
            }

            batch.push(decision);
            if batch.len() >= DECISION_BATCH {
                self.store.insert_decisions(&batch).await?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.store.insert_decisions(&batch).await?;
        }

        if let Err(e) = put_json(
            self.kv.as_ref(),
            &summary_key(campaign),
            &summary,
            self.decision_ttl,
        )
        .await
        {
            warn!(campaign = %campaign, error = %e, "failed to publish decision summary");
        }

        info!(
            campaign = %campaign,
            send_now = summary.send_now,
            send_later = summary.send_later,
            defer = summary.defer,
            suppress = summary.suppress,
            "agent preprocessing complete"
        );
        Ok(summary)
    }

    /// Remove a completed campaign's hot decision keys: cursor scan plus
    /// batched deletes.
    ///
    /// # Errors
    ///
    /// Returns the KV error when the scan or a delete fails.
    pub async fn cleanup_campaign(&self, campaign: CampaignId) -> Result<u64, DeliveryError> {
        let prefix = format!("agent:decisions:{campaign}:");
        let keys = self.kv.scan_prefix(&prefix, KV_CLEANUP_BATCH).await?;

        let mut removed = 0;
        for chunk in keys.chunks(KV_CLEANUP_BATCH) {
            removed += self.kv.delete_batch(chunk).await?;
        }
        self.kv.delete(&summary_key(campaign)).await?;

        debug!(campaign = %campaign, removed, "agent decision keys cleaned up");
        Ok(removed)
    }
}
