//! Per-ESP and per-domain rate limiting over atomic KV counters.
//!
//! Each ESP carries three counters keyed by time bucket (current second,
//! current minute, current day). A send either increments all three in one
//! server-side step or touches none of them; there is no client-side
//! read-modify-write anywhere on this path.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

use cadence_kv::{CounterOutcome, CounterSpec, KvStore};

use crate::error::Result;

/// Counter TTLs, slightly longer than the window each covers.
const SEC_TTL: Duration = Duration::from_secs(2);
const MIN_TTL: Duration = Duration::from_secs(120);
const DAY_TTL: Duration = Duration::from_secs(25 * 3600);

/// Quotas for one ESP, derived from its account tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EspLimits {
    pub per_sec: u64,
    pub per_min: u64,
    pub per_day: u64,
}

impl Default for EspLimits {
    fn default() -> Self {
        Self {
            per_sec: 100,
            per_min: 5_000,
            per_day: 1_000_000,
        }
    }
}

const fn default_domain_per_minute() -> u64 {
    600
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per-ESP quota overrides, keyed by `esp_type`.
    #[serde(default)]
    pub esp_limits: HashMap<String, EspLimits>,

    /// Quotas applied to ESPs without an override.
    #[serde(default)]
    pub default_esp: EspLimits,

    /// One-minute cap toward any single destination domain.
    #[serde(default = "default_domain_per_minute")]
    pub domain_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            esp_limits: HashMap::new(),
            default_esp: EspLimits::default(),
            domain_per_minute: default_domain_per_minute(),
        }
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// All windows had room; counters are incremented.
    Allowed,
    /// A second/minute window is full. Recoverable: requeue and retry
    /// after `retry_after`.
    Denied { retry_after: Duration },
    /// The day window is exhausted. Terminal for this row today; callers
    /// may choose not to requeue.
    DailyExhausted { retry_after: Duration },
}

impl RateDecision {
    /// Whether the send may proceed.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Per-ESP multi-window limiter plus the per-domain minute limiter.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// A limiter over the given KV store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { kv, config }
    }

    fn limits_for(&self, esp: &str) -> EspLimits {
        self.config
            .esp_limits
            .get(esp)
            .copied()
            .unwrap_or(self.config.default_esp)
    }

    fn counters(esp: &str, limits: EspLimits, now: DateTime<Utc>) -> [CounterSpec; 3] {
        let unix = now.timestamp();
        let minute = unix.div_euclid(60);
        let day = now.format("%Y-%m-%d");
        [
            CounterSpec::new(format!("ratelimit:{esp}:sec:{unix}"), limits.per_sec, SEC_TTL),
            CounterSpec::new(
                format!("ratelimit:{esp}:min:{minute}"),
                limits.per_min,
                MIN_TTL,
            ),
            CounterSpec::new(format!("ratelimit:{esp}:day:{day}"), limits.per_day, DAY_TTL),
        ]
    }

    fn seconds_to_next_minute(now: DateTime<Utc>) -> u64 {
        u64::from(60 - now.second().min(59))
    }

    fn seconds_to_next_day(now: DateTime<Utc>) -> u64 {
        let elapsed =
            u64::from(now.hour()) * 3600 + u64::from(now.minute()) * 60 + u64::from(now.second());
        (24u64 * 3600).saturating_sub(elapsed).max(1)
    }

    /// Check and increment the ESP's three windows at the current time.
    ///
    /// # Errors
    ///
    /// Returns the KV error when the backend cannot execute the step; the
    /// caller is expected to fail open.
    pub async fn check_and_increment(&self, esp: &str, n: u64) -> Result<RateDecision> {
        self.check_and_increment_at(esp, n, Utc::now()).await
    }

    /// [`check_and_increment`] with an explicit clock, the testable core.
    ///
    /// # Errors
    ///
    /// Returns the KV error when the backend cannot execute the step.
    ///
    /// [`check_and_increment`]: RateLimiter::check_and_increment
    pub async fn check_and_increment_at(
        &self,
        esp: &str,
        n: u64,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let limits = self.limits_for(esp);
        let counters = Self::counters(esp, limits, now);

        match self.kv.check_and_increment(&counters, n).await? {
            CounterOutcome::Allowed => Ok(RateDecision::Allowed),
            CounterOutcome::Denied { index: 0 } => Ok(RateDecision::Denied {
                retry_after: Duration::from_secs(1),
            }),
            CounterOutcome::Denied { index: 1 } => Ok(RateDecision::Denied {
                retry_after: Duration::from_secs(Self::seconds_to_next_minute(now)),
            }),
            CounterOutcome::Denied { .. } => Ok(RateDecision::DailyExhausted {
                retry_after: Duration::from_secs(Self::seconds_to_next_day(now)),
            }),
        }
    }

    /// Check and increment the destination domain's one-minute window.
    ///
    /// # Errors
    ///
    /// Returns the KV error when the backend cannot execute the step.
    pub async fn check_domain(&self, domain: &str, n: u64) -> Result<RateDecision> {
        self.check_domain_at(domain, n, Utc::now()).await
    }

    /// [`check_domain`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns the KV error when the backend cannot execute the step.
    ///
    /// [`check_domain`]: RateLimiter::check_domain
    pub async fn check_domain_at(
        &self,
        domain: &str,
        n: u64,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let minute = now.timestamp().div_euclid(60);
        let counter = CounterSpec::new(
            format!("ratelimit:domain:{domain}:{minute}"),
            self.config.domain_per_minute,
            MIN_TTL,
        );

        match self.kv.check_and_increment(&[counter], n).await? {
            CounterOutcome::Allowed => Ok(RateDecision::Allowed),
            CounterOutcome::Denied { .. } => Ok(RateDecision::Denied {
                retry_after: Duration::from_secs(Self::seconds_to_next_minute(now)),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use cadence_kv::MemoryKv;
    use chrono::TimeZone;

    use super::*;

    fn limiter(per_sec: u64, per_min: u64, per_day: u64) -> RateLimiter {
        let mut esp_limits = HashMap::new();
        esp_limits.insert(
            "mock".to_string(),
            EspLimits {
                per_sec,
                per_min,
                per_day,
            },
        );
        RateLimiter::new(
            Arc::new(MemoryKv::new()),
            RateLimitConfig {
                esp_limits,
                default_esp: EspLimits::default(),
                domain_per_minute: 2,
            },
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[tokio::test]
    async fn allows_up_to_the_second_quota() {
        let limiter = limiter(2, 100, 1000);
        let now = at(1_700_000_000);

        assert!(
            limiter
                .check_and_increment_at("mock", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );
        assert!(
            limiter
                .check_and_increment_at("mock", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );

        let denied = limiter.check_and_increment_at("mock", 1, now).await.unwrap();
        assert_eq!(
            denied,
            RateDecision::Denied {
                retry_after: Duration::from_secs(1)
            }
        );

        // The next second has a fresh bucket.
        assert!(
            limiter
                .check_and_increment_at("mock", 1, at(1_700_000_001))
                .await
                .unwrap()
                .is_allowed()
        );
    }

    #[tokio::test]
    async fn minute_denial_reports_time_to_rollover() {
        let limiter = limiter(100, 1, 1000);
        // :20 into a minute.
        let now = at(1_700_000_000 - 1_700_000_000 % 60 + 20);

        assert!(
            limiter
                .check_and_increment_at("mock", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );
        let denied = limiter.check_and_increment_at("mock", 1, now).await.unwrap();
        assert_eq!(
            denied,
            RateDecision::Denied {
                retry_after: Duration::from_secs(40)
            }
        );
    }

    #[tokio::test]
    async fn daily_exhaustion_is_distinct() {
        let limiter = limiter(100, 100, 1);
        let now = at(1_700_000_000);

        assert!(
            limiter
                .check_and_increment_at("mock", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );
        let decision = limiter.check_and_increment_at("mock", 1, now).await.unwrap();
        assert!(matches!(decision, RateDecision::DailyExhausted { .. }));
    }

    #[tokio::test]
    async fn denial_leaves_counters_untouched() {
        let kv = Arc::new(MemoryKv::new());
        let mut esp_limits = HashMap::new();
        esp_limits.insert(
            "mock".to_string(),
            EspLimits {
                per_sec: 10,
                per_min: 10,
                per_day: 3,
            },
        );
        let limiter = RateLimiter::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            RateLimitConfig {
                esp_limits,
                ..RateLimitConfig::default()
            },
        );
        let now = at(1_700_000_000);

        // 3 allowed, then denied on the day window.
        for _ in 0..3 {
            assert!(
                limiter
                    .check_and_increment_at("mock", 1, now)
                    .await
                    .unwrap()
                    .is_allowed()
            );
        }
        assert!(
            !limiter
                .check_and_increment_at("mock", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );

        // Second and minute counters must still read 3, not 4: the denied
        // step incremented nothing.
        let unix = now.timestamp();
        let sec = kv
            .counter_value(&format!("ratelimit:mock:sec:{unix}"))
            .await
            .unwrap();
        let min = kv
            .counter_value(&format!("ratelimit:mock:min:{}", unix.div_euclid(60)))
            .await
            .unwrap();
        assert_eq!(sec, 3);
        assert_eq!(min, 3);
    }

    #[tokio::test]
    async fn batch_increment_is_all_or_nothing() {
        let limiter = limiter(10, 10, 10);
        let now = at(1_700_000_000);

        assert!(
            limiter
                .check_and_increment_at("mock", 8, now)
                .await
                .unwrap()
                .is_allowed()
        );
        // 8 + 3 would exceed 10: denied without partial increment.
        assert!(
            !limiter
                .check_and_increment_at("mock", 3, now)
                .await
                .unwrap()
                .is_allowed()
        );
        // 8 + 2 fits exactly.
        assert!(
            limiter
                .check_and_increment_at("mock", 2, now)
                .await
                .unwrap()
                .is_allowed()
        );
    }

    #[tokio::test]
    async fn domain_minute_cap_is_independent_of_esp() {
        let limiter = limiter(100, 100, 100);
        let now = at(1_700_000_000);

        assert!(
            limiter
                .check_domain_at("example.com", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );
        assert!(
            limiter
                .check_domain_at("example.com", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );
        assert!(
            !limiter
                .check_domain_at("example.com", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );
        // Other domains have their own bucket.
        assert!(
            limiter
                .check_domain_at("other.com", 1, now)
                .await
                .unwrap()
                .is_allowed()
        );
    }
}
