//! The campaign scheduler.
//!
//! Single responsibility: move campaigns through their state machine and
//! fan them out into queue rows. Materialization of any one campaign is
//! serialized cluster-wide by a named distributed lock, and the
//! `{scheduled, preparing} -> sending` transition is conditional, so a
//! second scheduler that loses either race simply skips the campaign.

pub mod completion;
pub mod fanout;
pub mod sendtime;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use cadence_common::{
    Signal,
    campaign::{Audience, Campaign, CampaignState, ThrottleSpeed},
    ids::CampaignId,
};
use cadence_kv::{KvStore, LockManager};
use cadence_store::{AudienceStore, CampaignStore, Store};
use cadence_throttle::BackpressureMonitor;

use crate::{agent::AgentPreprocessor, error::DeliveryError};

pub use completion::CompletionMonitor;
pub use fanout::FanoutOutcome;

const fn default_poll_interval_secs() -> u64 {
    30
}

const fn default_select_batch() -> u64 {
    20
}

const fn default_min_preparation_minutes() -> i64 {
    15
}

const fn default_lock_ttl_secs() -> u64 {
    600
}

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Main loop cadence, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Campaigns considered per cycle.
    #[serde(default = "default_select_batch")]
    pub select_batch: u64,

    /// Edit-lock width and the earliest legal schedule offset, minutes.
    #[serde(default = "default_min_preparation_minutes")]
    pub min_preparation_minutes: i64,

    /// Materialization lock TTL, generous enough for large audiences.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            select_batch: default_select_batch(),
            min_preparation_minutes: default_min_preparation_minutes(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

/// Initial per-minute send rate for a campaign, from its pacing tier. The
/// auto-tuner adjusts it from here.
#[must_use]
pub const fn initial_rate(speed: ThrottleSpeed) -> u64 {
    match speed {
        ThrottleSpeed::Instant => 10_000,
        ThrottleSpeed::Gentle => 2_000,
        ThrottleSpeed::Moderate => 1_000,
        ThrottleSpeed::Careful => 300,
    }
}

/// KV key holding a campaign's current per-minute send rate.
#[must_use]
pub fn rate_key(campaign: CampaignId) -> String {
    format!("campaign:{campaign}:rate")
}

/// Materializes due campaigns into the work queue.
pub struct Scheduler {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    locks: LockManager,
    backpressure: Arc<BackpressureMonitor>,
    agent: Arc<AgentPreprocessor>,
    hub: Arc<crate::suppression::SuppressionHub>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// A scheduler over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        locks: LockManager,
        backpressure: Arc<BackpressureMonitor>,
        agent: Arc<AgentPreprocessor>,
        hub: Arc<crate::suppression::SuppressionHub>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            kv,
            locks,
            backpressure,
            agent,
            hub,
            config,
        }
    }

    fn edit_lock(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.min_preparation_minutes)
    }

    /// One scheduler pass at `now`: promote, select, materialize. Returns
    /// the number of campaigns this pass started.
    ///
    /// # Errors
    ///
    /// Returns the store error when promotion or selection fails; failures
    /// inside a single campaign's materialization are logged and skipped
    /// so one bad campaign cannot stall the rest.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError> {
        // Promotion closes the edit window ahead of the send.
        let promoted = self
            .store
            .promote_due_campaigns(now + self.edit_lock())
            .await?;
        if promoted > 0 {
            debug!(promoted, "campaigns promoted to preparing");
        }

        let due = self
            .store
            .due_campaigns(now, self.config.select_batch)
            .await?;

        let mut started = 0;
        for campaign in due {
            if self.backpressure.is_paused() {
                debug!(
                    campaign = %campaign.id,
                    depth = self.backpressure.depth(),
                    "backpressure active, deferring materialization"
                );
                continue;
            }

            match self.materialize_one(&campaign, now).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(campaign = %campaign.id, error = %e, "materialization failed");
                }
            }
        }

        Ok(started)
    }

    /// Materialize one campaign under its distributed lock. Returns
    /// whether this process actually started it.
    async fn materialize_one(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Result<bool, DeliveryError> {
        let lock_name = format!("campaign:{}", campaign.id);
        let Some(lock) = self
            .locks
            .acquire(&lock_name, Duration::from_secs(self.config.lock_ttl_secs))
            .await?
        else {
            debug!(campaign = %campaign.id, "another scheduler holds the lock");
            return Ok(false);
        };

        let result = self.materialize_locked(campaign, now).await;

        if let Err(e) = self.locks.release(lock).await {
            warn!(campaign = %campaign.id, error = %e, "lock release failed");
        }
        result
    }

    async fn materialize_locked(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Result<bool, DeliveryError> {
        let won = self
            .store
            .try_transition(
                campaign.id,
                &[CampaignState::Scheduled, CampaignState::Preparing],
                CampaignState::Sending,
            )
            .await?;
        if !won {
            debug!(campaign = %campaign.id, "another worker already transitioned this campaign");
            return Ok(false);
        }

        let recipients = match campaign.audience {
            Audience::List(list) => {
                self.store
                    .list_recipients(list, campaign.max_recipients)
                    .await?
            }
            Audience::Segment(segment) => {
                self.store
                    .segment_recipients(segment, campaign.max_recipients)
                    .await?
            }
        };

        if recipients.is_empty() {
            info!(campaign = %campaign.id, "campaign has no recipients, completing");
            self.store.set_total_recipients(campaign.id, 0).await?;
            self.store
                .complete_campaign(campaign.id, CampaignState::Completed, 0, now)
                .await?;
            return Ok(true);
        }

        // Agent preprocessing runs before any row is claimable; it fails
        // open so intelligence outages never block a launch.
        if campaign.agent_enabled {
            if let Err(e) = self
                .agent
                .run_for_campaign(campaign.id, &recipients, now)
                .await
            {
                warn!(campaign = %campaign.id, error = %e, "agent preprocessing failed, sending without decisions");
            }
        }

        let outcome =
            fanout::materialize(self.store.as_ref(), &self.hub, campaign, &recipients, now)
                .await?;
        // Resolved minus suppressed, not rows inserted: re-materializing
        // after a crash finds every row already present and must not
        // report zero.
        let total = (recipients.len() as u64).saturating_sub(outcome.suppressed);
        self.store.set_total_recipients(campaign.id, total).await?;

        // Seed the campaign's pacing rate for the workers and auto-tuner.
        let rate = initial_rate(campaign.throttle_speed);
        if let Err(e) = self
            .kv
            .set_ex(
                &rate_key(campaign.id),
                &rate.to_string(),
                Duration::from_secs(7 * 24 * 3600),
            )
            .await
        {
            warn!(campaign = %campaign.id, error = %e, "failed to seed campaign send rate");
        }

        info!(
            campaign = %campaign.id,
            enqueued = outcome.enqueued,
            suppressed = outcome.suppressed,
            "campaign materialized"
        );
        Ok(true)
    }

    /// Run the scheduler until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(started) if started > 0 => {
                            info!(started, "scheduler cycle complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!("scheduler cycle failed: {e}"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(_) => break,
                    }
                }
            }
        }
    }
}
