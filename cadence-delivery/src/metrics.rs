//! Realtime campaign metrics and throttle auto-tuning.
//!
//! The collector snapshots cumulative outcome counters for every sending
//! campaign on a short interval, appends a row with the interval deltas,
//! and mirrors the latest numbers into the KV store for dashboards. The
//! tuner reads the trailing window back and adjusts each auto-optimized
//! campaign's pacing rate, pausing outright on runaway complaint rates.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use cadence_common::{
    Signal,
    campaign::CampaignState,
    events::{AlertSeverity, CampaignAlert, CampaignCounters, RealtimeMetricsRow},
    ids::CampaignId,
};
use cadence_kv::{KvStore, put_json};
use cadence_store::{CampaignStore, EventStore, Store};

use crate::{
    content::ContentCache,
    error::DeliveryError,
    scheduler::{initial_rate, rate_key},
};

const COLLECT_INTERVAL: Duration = Duration::from_secs(30);
const REALTIME_MIRROR_TTL: Duration = Duration::from_secs(300);
const RATE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Snapshots per-campaign counters on an interval.
pub struct MetricsCollector {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    previous: Mutex<HashMap<CampaignId, CampaignCounters>>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// A collector over the given stores.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            kv,
            previous: Mutex::new(HashMap::new()),
        }
    }

    /// One collection pass. Returns the number of campaigns snapshotted.
    ///
    /// # Errors
    ///
    /// Returns the store error when campaigns cannot be listed; per
    /// campaign failures are logged and skipped.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError> {
        let sending = self
            .store
            .campaigns_in_state(CampaignState::Sending, 1_000)
            .await?;

        let mut collected = 0;
        for campaign in sending {
            let cumulative = match self.store.campaign_counters(campaign.id).await {
                Ok(counters) => counters,
                Err(e) => {
                    warn!(campaign = %campaign.id, error = %e, "counter aggregation failed");
                    continue;
                }
            };

            let earlier = self
                .previous
                .lock()
                .insert(campaign.id, cumulative)
                .unwrap_or_default();
            let row = RealtimeMetricsRow {
                campaign_id: campaign.id,
                cumulative,
                delta: cumulative.delta_since(&earlier),
                recorded_at: now,
            };

            if let Err(e) = self.store.append_metrics_row(&row).await {
                warn!(campaign = %campaign.id, error = %e, "metrics row append failed");
            }
            if let Err(e) = put_json(
                self.kv.as_ref(),
                &format!("campaign:{}:realtime", campaign.id),
                &cumulative,
                REALTIME_MIRROR_TTL,
            )
            .await
            {
                warn!(campaign = %campaign.id, error = %e, "realtime mirror write failed");
            }
            collected += 1;
        }

        Ok(collected)
    }

    /// Run collection until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(COLLECT_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!("metrics collection failed: {e}");
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

const fn default_tune_interval_secs() -> u64 {
    300
}

const fn default_trailing_minutes() -> i64 {
    15
}

const fn default_complaint_threshold() -> f64 {
    0.002
}

const fn default_bounce_threshold() -> f64 {
    0.05
}

const fn default_open_boost_threshold() -> f64 {
    0.10
}

const fn default_min_rate() -> u64 {
    60
}

const fn default_max_rate() -> u64 {
    20_000
}

/// Auto-tuner configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoTuneConfig {
    #[serde(default = "default_tune_interval_secs")]
    pub interval_secs: u64,

    /// Width of the trailing window the rates are computed over.
    #[serde(default = "default_trailing_minutes")]
    pub trailing_minutes: i64,

    /// Complaint rate that halves the pacing rate; double it pauses the
    /// campaign.
    #[serde(default = "default_complaint_threshold")]
    pub complaint_threshold: f64,

    /// Bounce rate that cuts the pacing rate to 70%.
    #[serde(default = "default_bounce_threshold")]
    pub bounce_threshold: f64,

    /// Open rate required (with clean bounce/complaint signals) to earn a
    /// 25% raise.
    #[serde(default = "default_open_boost_threshold")]
    pub open_boost_threshold: f64,

    /// Pacing rate clamp, messages per minute.
    #[serde(default = "default_min_rate")]
    pub min_rate: u64,

    #[serde(default = "default_max_rate")]
    pub max_rate: u64,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_tune_interval_secs(),
            trailing_minutes: default_trailing_minutes(),
            complaint_threshold: default_complaint_threshold(),
            bounce_threshold: default_bounce_threshold(),
            open_boost_threshold: default_open_boost_threshold(),
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
        }
    }
}

/// Adjusts auto-optimized campaigns' pacing from their trailing outcomes.
pub struct AutoTuner {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    content: Option<Arc<ContentCache>>,
    config: AutoTuneConfig,
}

impl std::fmt::Debug for AutoTuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoTuner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AutoTuner {
    /// A tuner; the content cache, when supplied, is invalidated for
    /// paused campaigns.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        content: Option<Arc<ContentCache>>,
        config: AutoTuneConfig,
    ) -> Self {
        Self {
            store,
            kv,
            content,
            config,
        }
    }

    /// One tuning pass. Returns the number of campaigns adjusted or
    /// paused.
    ///
    /// # Errors
    ///
    /// Returns the store error when campaigns cannot be listed.
    #[allow(clippy::too_many_lines, clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError> {
        let sending = self
            .store
            .campaigns_in_state(CampaignState::Sending, 1_000)
            .await?;

        let mut adjusted = 0;
        for campaign in sending {
            if !campaign.auto_optimize {
                continue;
            }

            let since = now - chrono::Duration::minutes(self.config.trailing_minutes);
            let rows = match self.store.metrics_rows_since(campaign.id, since).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(campaign = %campaign.id, error = %e, "trailing metrics read failed");
                    continue;
                }
            };

            let mut trailing = CampaignCounters::default();
            for row in &rows {
                trailing.sent += row.delta.sent;
                trailing.unique_opens += row.delta.unique_opens;
                trailing.bounces += row.delta.bounces;
                trailing.complaints += row.delta.complaints;
            }
            if trailing.sent == 0 {
                continue;
            }

            let complaint_rate = trailing.complaint_rate();
            let bounce_rate = trailing.bounce_rate();
            let open_rate = trailing.open_rate();

            // Runaway complaints pause the campaign outright.
            if complaint_rate > self.config.complaint_threshold * 2.0 {
                if self.store.pause_campaign(campaign.id).await? {
                    if let Some(cache) = &self.content {
                        cache.invalidate(campaign.id);
                    }
                    self.alert(
                        &campaign,
                        AlertSeverity::Critical,
                        "campaign_paused",
                        &format!(
                            "complaint rate {:.3}% exceeded twice the threshold, campaign paused",
                            complaint_rate * 100.0
                        ),
                        now,
                    )
                    .await;
                    adjusted += 1;
                }
                continue;
            }

            let factor: f64 = if complaint_rate > self.config.complaint_threshold {
                0.5
            } else if bounce_rate > self.config.bounce_threshold {
                0.7
            } else if complaint_rate < self.config.complaint_threshold * 0.5
                && bounce_rate < self.config.bounce_threshold * 0.5
                && open_rate > self.config.open_boost_threshold
            {
                1.25
            } else {
                1.0
            };

            if (factor - 1.0).abs() < f64::EPSILON {
                continue;
            }

            let current = self.current_rate(&campaign).await;
            let tuned = ((current as f64 * factor) as u64)
                .clamp(self.config.min_rate, self.config.max_rate);
            if tuned == current {
                continue;
            }

            if let Err(e) = self
                .kv
                .set_ex(&rate_key(campaign.id), &tuned.to_string(), RATE_TTL)
                .await
            {
                warn!(campaign = %campaign.id, error = %e, "rate write failed");
                continue;
            }

            info!(
                campaign = %campaign.id,
                from = current,
                to = tuned,
                factor,
                "campaign pacing adjusted"
            );
            self.alert(
                &campaign,
                AlertSeverity::Info,
                "throttle_adjustment",
                &format!("pacing adjusted from {current} to {tuned} msgs/min (factor {factor})"),
                now,
            )
            .await;
            adjusted += 1;
        }

        Ok(adjusted)
    }

    async fn current_rate(&self, campaign: &cadence_common::campaign::Campaign) -> u64 {
        match self.kv.get(&rate_key(campaign.id)).await {
            Ok(Some(raw)) => raw
                .parse()
                .unwrap_or_else(|_| initial_rate(campaign.throttle_speed)),
            Ok(None) => initial_rate(campaign.throttle_speed),
            Err(e) => {
                debug!(campaign = %campaign.id, error = %e, "rate lookup failed");
                initial_rate(campaign.throttle_speed)
            }
        }
    }

    async fn alert(
        &self,
        campaign: &cadence_common::campaign::Campaign,
        severity: AlertSeverity,
        kind: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let alert = CampaignAlert {
            org_id: campaign.org_id,
            campaign_id: campaign.id,
            severity,
            kind: kind.to_string(),
            message: message.to_string(),
            created_at: now,
        };
        if let Err(e) = self.store.insert_alert(&alert).await {
            warn!(campaign = %campaign.id, error = %e, "alert insert failed");
        }
    }

    /// Run tuning until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!("auto-tune cycle failed: {e}");
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
