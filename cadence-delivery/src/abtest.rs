//! A/B winner selection.
//!
//! Each active variant is compared against the control with a
//! two-proportion Z-test on the configured target metric once both sides
//! reach the minimum sample size. A confident positive result promotes
//! the variant: the campaign's live subject / from-name are rewritten so
//! every remaining send uses the winning copy.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use cadence_common::{
    Signal,
    abtest::{AbTest, AbVariant, VariantState},
    campaign::{Campaign, CampaignState},
    events::{AlertSeverity, CampaignAlert},
};
use cadence_store::{AbTestStore, CampaignStore, EventStore, QueueStore, Store};

use crate::{content::ContentCache, error::DeliveryError};

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Two-proportion Z-score of `variant` against `control`.
///
/// Positive means the variant outperforms the control. `None` when either
/// side has no samples or the pooled variance degenerates.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn two_proportion_z(
    control_successes: u64,
    control_n: u64,
    variant_successes: u64,
    variant_n: u64,
) -> Option<f64> {
    if control_n == 0 || variant_n == 0 {
        return None;
    }

    let p_control = control_successes as f64 / control_n as f64;
    let p_variant = variant_successes as f64 / variant_n as f64;
    let pooled =
        (control_successes + variant_successes) as f64 / (control_n + variant_n) as f64;

    let variance = pooled * (1.0 - pooled) * (1.0 / control_n as f64 + 1.0 / variant_n as f64);
    if variance <= 0.0 {
        return None;
    }

    Some((p_variant - p_control) / variance.sqrt())
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation.
#[must_use]
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    // Abramowitz & Stegun 7.1.26, |error| <= 1.5e-7.
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Periodically evaluates undecided tests on sending campaigns.
pub struct AbTestWorker {
    store: Arc<dyn Store>,
    content: Option<Arc<ContentCache>>,
}

impl std::fmt::Debug for AbTestWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbTestWorker").finish_non_exhaustive()
    }
}

impl AbTestWorker {
    /// A worker; the content cache, when supplied, is invalidated when a
    /// winner rewrites live content.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, content: Option<Arc<ContentCache>>) -> Self {
        Self { store, content }
    }

    /// One evaluation pass. Returns the number of tests decided.
    ///
    /// # Errors
    ///
    /// Returns the store error when campaigns cannot be listed.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError> {
        let sending = self
            .store
            .campaigns_in_state(CampaignState::Sending, 1_000)
            .await?;

        let mut decided = 0;
        for campaign in sending {
            let Some(test) = self.store.ab_test(campaign.id).await? else {
                continue;
            };
            if test.decided_at.is_some() {
                continue;
            }
            if self.evaluate(&campaign, &test, now).await? {
                decided += 1;
            }
        }
        Ok(decided)
    }

    async fn evaluate(
        &self,
        campaign: &Campaign,
        test: &AbTest,
        now: DateTime<Utc>,
    ) -> Result<bool, DeliveryError> {
        let variants = self.store.variants(campaign.id).await?;
        let Some(control) = variants
            .iter()
            .find(|v| v.is_control)
            .or_else(|| variants.first())
        else {
            return Ok(false);
        };

        if control.assigned < test.min_sample_size {
            return Ok(false);
        }

        for variant in &variants {
            if variant.id == control.id || variant.state != VariantState::Active {
                continue;
            }
            if variant.assigned < test.min_sample_size {
                continue;
            }

            let Some(z) = two_proportion_z(
                control.successes(test.target_metric),
                control.assigned,
                variant.successes(test.target_metric),
                variant.assigned,
            ) else {
                continue;
            };
            let confidence = normal_cdf(z.abs());
            if confidence < test.confidence_threshold {
                debug!(
                    campaign = %campaign.id,
                    variant = %variant.id,
                    z,
                    confidence,
                    "not confident yet"
                );
                continue;
            }

            if z > 0.0 {
                self.promote_winner(campaign, &variants, variant, z, confidence, now)
                    .await?;
                return Ok(true);
            }

            // Confidently worse: retire this variant only.
            info!(
                campaign = %campaign.id,
                variant = %variant.id,
                z,
                "variant confidently underperforms the control"
            );
            self.store
                .set_variant_state(variant.id, VariantState::Loser)
                .await?;
        }

        Ok(false)
    }

    async fn promote_winner(
        &self,
        campaign: &Campaign,
        variants: &[AbVariant],
        winner: &AbVariant,
        z: f64,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        self.store
            .set_variant_state(winner.id, VariantState::Winner)
            .await?;
        for other in variants {
            if other.id != winner.id {
                self.store
                    .set_variant_state(other.id, VariantState::Loser)
                    .await?;
            }
        }

        // Remaining sends pick the winning copy up: rewrite the live
        // content, drop stale per-row overrides, and evict the cached
        // copy workers render from.
        self.store
            .rewrite_live_content(
                campaign.id,
                winner.subject.as_deref(),
                winner.from_name.as_deref(),
            )
            .await?;
        self.store.clear_variant_overrides(campaign.id).await?;
        if let Some(cache) = &self.content {
            cache.invalidate(campaign.id);
        }

        self.store.mark_test_decided(campaign.id, now).await?;

        info!(
            campaign = %campaign.id,
            winner = %winner.id,
            z,
            confidence,
            "A/B winner selected"
        );
        let alert = CampaignAlert {
            org_id: campaign.org_id,
            campaign_id: campaign.id,
            severity: AlertSeverity::Info,
            kind: "ab_winner".to_string(),
            message: format!(
                "variant '{}' won (z = {z:.2}, confidence {confidence:.3}); live content rewritten",
                winner.name
            ),
            created_at: now,
        };
        if let Err(e) = self.store.insert_alert(&alert).await {
            warn!(campaign = %campaign.id, error = %e, "winner alert insert failed");
        }
        Ok(())
    }

    /// Run evaluation until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(POLL_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!("A/B evaluation failed: {e}");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_score_sign_tracks_the_better_side() {
        // Variant converts much better than control.
        let z = two_proportion_z(50, 1000, 100, 1000).unwrap();
        assert!(z > 3.0, "z = {z}");

        // And symmetric the other way.
        let z = two_proportion_z(100, 1000, 50, 1000).unwrap();
        assert!(z < -3.0, "z = {z}");

        // No difference: z near zero.
        let z = two_proportion_z(80, 1000, 80, 1000).unwrap();
        assert!(z.abs() < 1e-9, "z = {z}");
    }

    #[test]
    fn z_score_degenerate_inputs() {
        assert!(two_proportion_z(0, 0, 10, 100).is_none());
        assert!(two_proportion_z(10, 100, 0, 0).is_none());
        // Zero successes everywhere: pooled variance is zero.
        assert!(two_proportion_z(0, 100, 0, 100).is_none());
    }

    #[test]
    fn normal_cdf_known_values() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
        assert!(normal_cdf(6.0) > 0.999_999);
    }

    #[test]
    fn confidence_grows_with_separation() {
        let small = two_proportion_z(100, 1000, 105, 1000).unwrap();
        let large = two_proportion_z(100, 1000, 200, 1000).unwrap();
        assert!(normal_cdf(large.abs()) > normal_cdf(small.abs()));
    }
}
