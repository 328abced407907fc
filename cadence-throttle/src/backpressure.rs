//! Queue-depth backpressure with hysteresis.
//!
//! A single pause flag derived from the number of live queue rows: set at
//! the high-water mark, cleared only once depth falls below half of it.
//! Callers only ever read the flag; nothing here blocks.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use cadence_common::Signal;
use cadence_store::QueueStore;

use crate::error::Result;

const fn default_high_water() -> u64 {
    100_000
}

const fn default_poll_interval_secs() -> u64 {
    30
}

/// Backpressure monitor configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Queue depth that sets the pause flag.
    #[serde(default = "default_high_water")]
    pub max_queue_depth: u64,

    /// How often to measure, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: default_high_water(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Periodically measures queue depth and maintains the pause flag.
pub struct BackpressureMonitor {
    store: Arc<dyn QueueStore>,
    config: BackpressureConfig,
    paused: AtomicBool,
    depth: AtomicU64,
}

impl std::fmt::Debug for BackpressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureMonitor")
            .field("config", &self.config)
            .field("paused", &self.paused)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl BackpressureMonitor {
    /// A monitor over the given queue store.
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>, config: BackpressureConfig) -> Self {
        Self {
            store,
            config,
            paused: AtomicBool::new(false),
            depth: AtomicU64::new(0),
        }
    }

    /// Whether new materialization should be deferred.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// The most recently measured queue depth.
    #[must_use]
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// One measurement pass: read the depth, update the flag.
    ///
    /// # Errors
    ///
    /// Returns the store error when the depth query fails; the flag is
    /// left as it was.
    pub async fn run_cycle(&self) -> Result<u64> {
        let depth = self.store.queue_depth().await?;
        self.depth.store(depth, Ordering::Relaxed);

        let was_paused = self.paused.load(Ordering::Relaxed);
        if !was_paused && depth >= self.config.max_queue_depth {
            warn!(
                depth,
                high_water = self.config.max_queue_depth,
                "queue depth reached high-water, pausing materialization"
            );
            self.paused.store(true, Ordering::Relaxed);
        } else if was_paused && depth < self.config.max_queue_depth / 2 {
            warn!(depth, "queue drained below half of high-water, resuming");
            self.paused.store(false, Ordering::Relaxed);
        } else {
            debug!(depth, paused = was_paused, "queue depth measured");
        }

        Ok(depth)
    }

    /// Run the monitor until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("backpressure measurement failed: {e}");
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
    use cadence_common::{
        EmailAddress,
        ids::{CampaignId, QueueRowId, SubscriberId},
    };
    use cadence_store::{MemoryStore, NewQueueRow};
    use chrono::Utc;

    use super::*;

    fn rows(n: usize) -> Vec<NewQueueRow> {
        let campaign = CampaignId::generate();
        (0..n)
            .map(|_| NewQueueRow {
                id: QueueRowId::generate(),
                campaign_id: campaign,
                subscriber_id: SubscriberId::generate(),
                recipient: EmailAddress::parse("user@example.com").unwrap(),
                substitutions: None,
                variant_subject: None,
                variant_html: None,
                variant_text: None,
                variant_from_name: None,
                priority: 5,
                scheduled_at: Utc::now(),
            })
            .collect()
    }

    #[tokio::test]
    async fn pauses_at_high_water_and_resumes_below_half() {
        let store = Arc::new(MemoryStore::new());
        let monitor = BackpressureMonitor::new(
            Arc::clone(&store) as Arc<dyn QueueStore>,
            BackpressureConfig {
                max_queue_depth: 4,
                poll_interval_secs: 1,
            },
        );

        store.enqueue_rows(rows(4)).await.unwrap();
        monitor.run_cycle().await.unwrap();
        assert!(monitor.is_paused());
        assert_eq!(monitor.depth(), 4);

        // Draining to 2 (exactly half) is not enough: resume requires
        // strictly below half.
        let worker = cadence_common::ids::WorkerId::generate();
        let claimed = store.claim_batch(worker, 2, Utc::now()).await.unwrap();
        for row in &claimed {
            store.mark_sent(row.id, worker, "m").await.unwrap();
        }
        monitor.run_cycle().await.unwrap();
        assert!(monitor.is_paused());

        // One more drained row crosses the threshold.
        let claimed = store.claim_batch(worker, 1, Utc::now()).await.unwrap();
        store.mark_sent(claimed[0].id, worker, "m").await.unwrap();
        monitor.run_cycle().await.unwrap();
        assert!(!monitor.is_paused());
        assert_eq!(monitor.depth(), 1);
    }

    #[tokio::test]
    async fn stays_unpaused_below_high_water() {
        let store = Arc::new(MemoryStore::new());
        let monitor = BackpressureMonitor::new(
            Arc::clone(&store) as Arc<dyn QueueStore>,
            BackpressureConfig {
                max_queue_depth: 100,
                poll_interval_secs: 1,
            },
        );
        store.enqueue_rows(rows(10)).await.unwrap();
        monitor.run_cycle().await.unwrap();
        assert!(!monitor.is_paused());
    }
}
