//! Per-organization throttle envelope with automatic feedback control.
//!
//! Sits above the raw rate limiter: every send is checked against the
//! recipient domain's backoff deadline, its ISP family's hour/day/burst
//! triple, the domain's hour/day pair, and the org's global caps, in that
//! order. Recorded bounces and complaints tighten the envelope; a weekly
//! pass relaxes it again for domains that earned it.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cadence_common::{
    EmailAddress,
    ids::OrgId,
    throttle::{DomainLimits, DomainRule, IspRule, OrgThrottleConfig},
};
use cadence_kv::{CounterOutcome, CounterSpec, KvStore, put_json};
use cadence_store::ThrottleConfigStore;

use crate::{error::Result, isp};

const HOUR_TTL: Duration = Duration::from_secs(3600 + 300);
const DAY_TTL: Duration = Duration::from_secs(25 * 3600);
const BURST_TTL: Duration = Duration::from_secs(120);
const CONFIG_MIRROR_TTL: Duration = Duration::from_secs(300);

/// Decision for one `(org, recipient)` send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    /// Denied with a reason tag (`backoff`, `isp_hour`, `domain_day`, ...).
    Denied { reason: String },
}

impl ThrottleDecision {
    /// Whether the send may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(reason: &str) -> Self {
        Self::Denied {
            reason: reason.to_string(),
        }
    }
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

/// Feedback thresholds and backoff durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleManagerConfig {
    /// Local config-cache TTL in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Deployment-wide ISP limit overrides, applied when an org has no
    /// rule of its own. Falls back to the built-in table per family.
    #[serde(default)]
    pub default_isp_limits: HashMap<String, cadence_common::throttle::IspLimits>,

    /// Complaint rate applying a 24-hour backoff.
    #[serde(default = "defaults::complaint_backoff_rate")]
    pub complaint_backoff_rate: f64,

    /// Complaint rate reducing domain limits to a quarter.
    #[serde(default = "defaults::complaint_reduce_rate")]
    pub complaint_reduce_rate: f64,

    /// Bounce rate applying a 1-hour backoff.
    #[serde(default = "defaults::bounce_backoff_rate")]
    pub bounce_backoff_rate: f64,

    /// Bounce rate halving domain limits.
    #[serde(default = "defaults::bounce_reduce_rate")]
    pub bounce_reduce_rate: f64,

    /// 7-day bounce rate below which the raise pass adds 25%.
    #[serde(default = "defaults::raise_bounce_rate")]
    pub raise_bounce_rate: f64,

    /// Days of history the raise pass requires.
    #[serde(default = "defaults::raise_min_days")]
    pub raise_min_days: u32,
}

mod defaults {
    pub const fn complaint_backoff_rate() -> f64 {
        0.003
    }

    pub const fn complaint_reduce_rate() -> f64 {
        0.001
    }

    pub const fn bounce_backoff_rate() -> f64 {
        0.10
    }

    pub const fn bounce_reduce_rate() -> f64 {
        0.05
    }

    pub const fn raise_bounce_rate() -> f64 {
        0.02
    }

    pub const fn raise_min_days() -> u32 {
        7
    }
}

impl Default for ThrottleManagerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            default_isp_limits: HashMap::new(),
            complaint_backoff_rate: defaults::complaint_backoff_rate(),
            complaint_reduce_rate: defaults::complaint_reduce_rate(),
            bounce_backoff_rate: defaults::bounce_backoff_rate(),
            bounce_reduce_rate: defaults::bounce_reduce_rate(),
            raise_bounce_rate: defaults::raise_bounce_rate(),
            raise_min_days: defaults::raise_min_days(),
        }
    }
}

/// The layered per-org throttle manager.
pub struct ThrottleManager {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn ThrottleConfigStore>,
    config: ThrottleManagerConfig,
    cache: DashMap<OrgId, (Instant, OrgThrottleConfig)>,
}

impl std::fmt::Debug for ThrottleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ThrottleManager {
    /// A manager over the given KV and config stores.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn ThrottleConfigStore>,
        config: ThrottleManagerConfig,
    ) -> Self {
        Self {
            kv,
            store,
            config,
            cache: DashMap::new(),
        }
    }

    fn backoff_key(org: OrgId, domain: &str) -> String {
        format!("throttle:{org}:backoff:{domain}")
    }

    fn config_mirror_key(org: OrgId) -> String {
        format!("throttle:config:{org}")
    }

    fn stats_key(org: OrgId, domain: &str, kind: &str, now: DateTime<Utc>) -> String {
        format!(
            "throttle:{org}:stats:{domain}:{kind}:{}",
            now.format("%Y-%m-%d-%H")
        )
    }

    /// Load the org's envelope: local cache, KV mirror, then the store.
    async fn org_config(&self, org: OrgId, now: DateTime<Utc>) -> Result<OrgThrottleConfig> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some(entry) = self.cache.get(&org) {
            let (cached_at, config) = entry.value();
            if cached_at.elapsed() < ttl {
                return Ok(config.clone());
            }
        }

        let mirrored: Option<OrgThrottleConfig> =
            cadence_kv::get_json(self.kv.as_ref(), &Self::config_mirror_key(org))
                .await
                .unwrap_or_default();

        let config = if let Some(config) = mirrored {
            config
        } else {
            let config = self
                .store
                .throttle_config(org)
                .await?
                .unwrap_or_else(|| OrgThrottleConfig::empty(org, now));
            if let Err(e) = put_json(
                self.kv.as_ref(),
                &Self::config_mirror_key(org),
                &config,
                CONFIG_MIRROR_TTL,
            )
            .await
            {
                warn!(org = %org, error = %e, "failed to mirror throttle config");
            }
            config
        };

        self.cache.insert(org, (Instant::now(), config.clone()));
        Ok(config)
    }

    /// Drop the org's cached envelope locally and in the KV mirror.
    pub async fn invalidate(&self, org: OrgId) {
        self.cache.remove(&org);
        if let Err(e) = self.kv.delete(&Self::config_mirror_key(org)).await {
            warn!(org = %org, error = %e, "failed to invalidate throttle config mirror");
        }
    }

    /// The per-send decision for `(org, recipient)`.
    ///
    /// # Errors
    ///
    /// Returns the backend error when a counter step cannot execute; the
    /// send path treats that as fail-open.
    pub async fn check(
        &self,
        org: OrgId,
        recipient: &EmailAddress,
        n: u64,
    ) -> Result<ThrottleDecision> {
        self.check_at(org, recipient, n, Utc::now()).await
    }

    /// [`check`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns the backend error when a counter step cannot execute.
    ///
    /// [`check`]: ThrottleManager::check
    pub async fn check_at(
        &self,
        org: OrgId,
        recipient: &EmailAddress,
        n: u64,
        now: DateTime<Utc>,
    ) -> Result<ThrottleDecision> {
        let domain = recipient.domain();

        // Backoff deadline first: a backed-off domain ignores all limits.
        if let Some(raw) = self.kv.get(&Self::backoff_key(org, domain)).await? {
            if let Ok(resume_at) = raw.parse::<i64>() {
                if now.timestamp() < resume_at {
                    return Ok(ThrottleDecision::denied("backoff"));
                }
            }
        }

        let config = self.org_config(org, now).await?;
        let hour_bucket = now.format("%Y-%m-%d-%H").to_string();
        let day_bucket = now.format("%Y-%m-%d").to_string();
        let minute_bucket = now.timestamp().div_euclid(60);

        // ISP triple, atomic.
        if let Some(isp_name) = isp::isp_for_domain(domain) {
            let limits = config
                .isp_rule(isp_name)
                .map(|rule| rule.limits)
                .or_else(|| self.config.default_isp_limits.get(isp_name).copied())
                .or_else(|| isp::default_isp_limits(isp_name));

            if let Some(limits) = limits {
                let counters = [
                    CounterSpec::new(
                        format!("throttle:{org}:isp:{isp_name}:hour:{hour_bucket}"),
                        limits.hour,
                        HOUR_TTL,
                    ),
                    CounterSpec::new(
                        format!("throttle:{org}:isp:{isp_name}:daily:{day_bucket}"),
                        limits.day,
                        DAY_TTL,
                    ),
                    CounterSpec::new(
                        format!("throttle:{org}:isp:{isp_name}:burst:{minute_bucket}"),
                        limits.burst,
                        BURST_TTL,
                    ),
                ];
                match self.kv.check_and_increment(&counters, n).await? {
                    CounterOutcome::Allowed => {}
                    CounterOutcome::Denied { index: 0 } => {
                        return Ok(ThrottleDecision::denied("isp_hour"));
                    }
                    CounterOutcome::Denied { index: 1 } => {
                        return Ok(ThrottleDecision::denied("isp_day"));
                    }
                    CounterOutcome::Denied { .. } => {
                        return Ok(ThrottleDecision::denied("isp_burst"));
                    }
                }
            }
        }

        // Domain pair; defaults apply when the org has no rule.
        let domain_limits = config
            .domain_rule(domain)
            .map_or_else(DomainLimits::default, |rule| rule.limits);
        let counters = [
            CounterSpec::new(
                format!("throttle:{org}:domain:{domain}:hour:{hour_bucket}"),
                domain_limits.hour,
                HOUR_TTL,
            ),
            CounterSpec::new(
                format!("throttle:{org}:domain:{domain}:daily:{day_bucket}"),
                domain_limits.day,
                DAY_TTL,
            ),
        ];
        match self.kv.check_and_increment(&counters, n).await? {
            CounterOutcome::Allowed => {}
            CounterOutcome::Denied { index: 0 } => {
                return Ok(ThrottleDecision::denied("domain_hour"));
            }
            CounterOutcome::Denied { .. } => {
                return Ok(ThrottleDecision::denied("domain_day"));
            }
        }

        // Org-wide caps, only when configured.
        let mut org_counters = Vec::new();
        let mut org_reasons = Vec::new();
        if let Some(hour) = config.global_hour {
            org_counters.push(CounterSpec::new(
                format!("throttle:{org}:global:hour:{hour_bucket}"),
                hour,
                HOUR_TTL,
            ));
            org_reasons.push("org_hour");
        }
        if let Some(day) = config.global_day {
            org_counters.push(CounterSpec::new(
                format!("throttle:{org}:global:daily:{day_bucket}"),
                day,
                DAY_TTL,
            ));
            org_reasons.push("org_day");
        }
        if !org_counters.is_empty() {
            if let CounterOutcome::Denied { index } =
                self.kv.check_and_increment(&org_counters, n).await?
            {
                let reason = org_reasons.get(index).copied().unwrap_or("org_hour");
                return Ok(ThrottleDecision::denied(reason));
            }
        }

        Ok(ThrottleDecision::Allowed)
    }

    /// Record a delivered message for `(org, domain)`.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the counter or stats writes.
    pub async fn record_sent(&self, org: OrgId, domain: &str) -> Result<()> {
        self.record_sent_at(org, domain, Utc::now()).await
    }

    /// [`record_sent`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the counter or stats writes.
    ///
    /// [`record_sent`]: ThrottleManager::record_sent
    pub async fn record_sent_at(&self, org: OrgId, domain: &str, now: DateTime<Utc>) -> Result<()> {
        self.kv
            .increment_ex(&Self::stats_key(org, domain, "sent", now), 1, HOUR_TTL)
            .await?;
        self.store
            .record_daily_stat(org, domain, now.date_naive(), 1, 0, 0)
            .await?;
        Ok(())
    }

    /// Record a bounce and re-evaluate the domain's envelope.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the counter or stats writes.
    pub async fn record_bounce(&self, org: OrgId, domain: &str) -> Result<()> {
        self.record_bounce_at(org, domain, Utc::now()).await
    }

    /// [`record_bounce`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the counter or stats writes.
    ///
    /// [`record_bounce`]: ThrottleManager::record_bounce
    pub async fn record_bounce_at(
        &self,
        org: OrgId,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.kv
            .increment_ex(&Self::stats_key(org, domain, "bounce", now), 1, HOUR_TTL)
            .await?;
        self.store
            .record_daily_stat(org, domain, now.date_naive(), 0, 1, 0)
            .await?;
        self.auto_adjust(org, domain, now).await
    }

    /// Record a complaint and re-evaluate the domain's envelope.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the counter or stats writes.
    pub async fn record_complaint(&self, org: OrgId, domain: &str) -> Result<()> {
        self.record_complaint_at(org, domain, Utc::now()).await
    }

    /// [`record_complaint`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the counter or stats writes.
    ///
    /// [`record_complaint`]: ThrottleManager::record_complaint
    pub async fn record_complaint_at(
        &self,
        org: OrgId,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.kv
            .increment_ex(&Self::stats_key(org, domain, "complaint", now), 1, HOUR_TTL)
            .await?;
        self.store
            .record_daily_stat(org, domain, now.date_naive(), 0, 0, 1)
            .await?;
        self.auto_adjust(org, domain, now).await
    }

    #[allow(clippy::cast_precision_loss)]
    async fn auto_adjust(&self, org: OrgId, domain: &str, now: DateTime<Utc>) -> Result<()> {
        let config = self.org_config(org, now).await?;
        if !config.auto_adjust {
            return Ok(());
        }

        let sent = self
            .kv
            .counter_value(&Self::stats_key(org, domain, "sent", now))
            .await?;
        if sent == 0 {
            return Ok(());
        }
        let bounces = self
            .kv
            .counter_value(&Self::stats_key(org, domain, "bounce", now))
            .await?;
        let complaints = self
            .kv
            .counter_value(&Self::stats_key(org, domain, "complaint", now))
            .await?;

        let bounce_rate = bounces as f64 / sent as f64;
        let complaint_rate = complaints as f64 / sent as f64;

        if complaint_rate > self.config.complaint_backoff_rate {
            self.apply_backoff(org, domain, now, Duration::from_secs(24 * 3600))
                .await?;
        } else if complaint_rate > self.config.complaint_reduce_rate {
            self.scale_domain_limits(org, domain, 0.25, now).await?;
        }

        if bounce_rate > self.config.bounce_backoff_rate {
            self.apply_backoff(org, domain, now, Duration::from_secs(3600))
                .await?;
        } else if bounce_rate > self.config.bounce_reduce_rate {
            self.scale_domain_limits(org, domain, 0.5, now).await?;
        }

        Ok(())
    }

    async fn apply_backoff(
        &self,
        org: OrgId,
        domain: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<()> {
        let resume_at = now.timestamp() + i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
        warn!(
            org = %org,
            domain,
            resume_at,
            "applying delivery backoff"
        );
        self.kv
            .set_ex(
                &Self::backoff_key(org, domain),
                &resume_at.to_string(),
                duration,
            )
            .await?;
        Ok(())
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    async fn scale_domain_limits(
        &self,
        org: OrgId,
        domain: &str,
        factor: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut config = self
            .store
            .throttle_config(org)
            .await?
            .unwrap_or_else(|| OrgThrottleConfig::empty(org, now));

        let scale = |value: u64| -> u64 { ((value as f64 * factor) as u64).max(1) };

        if let Some(rule) = config
            .domain_rules
            .iter_mut()
            .find(|rule| rule.domain == domain)
        {
            rule.limits.hour = scale(rule.limits.hour);
            rule.limits.day = scale(rule.limits.day);
        } else {
            let defaults = DomainLimits::default();
            config.domain_rules.push(DomainRule {
                domain: domain.to_string(),
                limits: DomainLimits {
                    hour: scale(defaults.hour),
                    day: scale(defaults.day),
                },
            });
        }
        config.updated_at = now;

        info!(org = %org, domain, factor, "reducing domain throttle limits");
        self.store.put_throttle_config(&config).await?;
        self.invalidate(org).await;
        Ok(())
    }

    /// The periodic raise pass: +25% on every domain rule whose trailing
    /// 7-day bounce rate stayed under the threshold, with at least
    /// `raise_min_days` of data.
    ///
    /// # Errors
    ///
    /// Returns the store error when stats cannot be read or the config
    /// cannot be written.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub async fn run_raise_pass(&self, org: OrgId, now: DateTime<Utc>) -> Result<()> {
        let Some(mut config) = self.store.throttle_config(org).await? else {
            return Ok(());
        };
        if !config.auto_adjust {
            return Ok(());
        }

        let since = now.date_naive() - chrono::Duration::days(7);
        let mut raised = false;

        for rule in &mut config.domain_rules {
            let stats = self
                .store
                .daily_stats_since(org, &rule.domain, since)
                .await?;
            if stats.len() < self.config.raise_min_days as usize {
                continue;
            }

            let sent: u64 = stats.iter().map(|s| s.sent).sum();
            let bounced: u64 = stats.iter().map(|s| s.bounced).sum();
            if sent == 0 {
                continue;
            }

            if bounced as f64 / (sent as f64) < self.config.raise_bounce_rate {
                rule.limits.hour = (rule.limits.hour as f64 * 1.25) as u64;
                rule.limits.day = (rule.limits.day as f64 * 1.25) as u64;
                raised = true;
                info!(org = %org, domain = %rule.domain, "raising domain throttle limits");
            }
        }

        if raised {
            config.updated_at = now;
            self.store.put_throttle_config(&config).await?;
            self.invalidate(org).await;
        }
        Ok(())
    }

    /// Seed an org's ISP rules from the built-in table. Used when an org
    /// gets its first envelope.
    #[must_use]
    pub fn default_isp_rules() -> Vec<IspRule> {
        ["gmail", "microsoft", "yahoo", "apple", "aol", "comcast", "att"]
            .iter()
            .filter_map(|isp_name| {
                isp::default_isp_limits(isp_name).map(|limits| IspRule {
                    isp: (*isp_name).to_string(),
                    limits,
                    domains: isp::domains_for_isp(isp_name)
                        .iter()
                        .map(|d| (*d).to_string())
                        .collect(),
                })
            })
            .collect()
    }
}
