//! Retention cleanup.
//!
//! A scheduled sweep over the aged rows nobody will read again: terminal
//! queue rows, dead letters, executed agent decisions, and old tracking
//! events. Deletes run in bounded batches with a short pause between, so
//! a large backlog never holds long locks on a hot table.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use cadence_common::Signal;
use cadence_store::{MaintenanceStore, StoreError};

use crate::error::DeliveryError;

const INTER_BATCH_PAUSE: Duration = Duration::from_millis(100);

const fn default_queue_terminal_days() -> i64 {
    7
}

const fn default_dead_letter_days() -> i64 {
    30
}

const fn default_decisions_days() -> i64 {
    30
}

const fn default_events_days() -> i64 {
    90
}

/// Retention windows, in days.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_queue_terminal_days")]
    pub queue_terminal_days: i64,

    #[serde(default = "default_dead_letter_days")]
    pub dead_letter_days: i64,

    #[serde(default = "default_decisions_days")]
    pub decisions_days: i64,

    #[serde(default = "default_events_days")]
    pub events_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            queue_terminal_days: default_queue_terminal_days(),
            dead_letter_days: default_dead_letter_days(),
            decisions_days: default_decisions_days(),
            events_days: default_events_days(),
        }
    }
}

const fn default_cleanup_interval_secs() -> u64 {
    3600
}

const fn default_cleanup_batch() -> u64 {
    10_000
}

/// Cleanup worker configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,

    /// Rows deleted per batch.
    #[serde(default = "default_cleanup_batch")]
    pub batch_size: u64,

    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
            batch_size: default_cleanup_batch(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Totals removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub queue_rows: u64,
    pub dead_letters: u64,
    pub decisions: u64,
    pub events: u64,
}

/// The periodic retention sweeper.
pub struct CleanupWorker {
    store: Arc<dyn MaintenanceStore>,
    config: CleanupConfig,
    /// Targets already reported missing, to log each once.
    warned_missing: Mutex<Vec<&'static str>>,
}

impl std::fmt::Debug for CleanupWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CleanupWorker {
    /// A sweeper over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn MaintenanceStore>, config: CleanupConfig) -> Self {
        Self {
            store,
            config,
            warned_missing: Mutex::new(Vec::new()),
        }
    }

    /// One full sweep at `now`.
    ///
    /// # Errors
    ///
    /// Never fails outright: per-target errors are absorbed (missing
    /// tables logged once), so the report reflects what actually went.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CleanupReport, DeliveryError> {
        let retention = self.config.retention;
        let report = CleanupReport {
            queue_rows: self
                .sweep("queue_terminal", |cutoff, limit| {
                    let store = Arc::clone(&self.store);
                    async move { store.delete_terminal_queue_rows(cutoff, limit).await }
                }, now - chrono::Duration::days(retention.queue_terminal_days))
                .await,
            dead_letters: self
                .sweep("dead_letter", |cutoff, limit| {
                    let store = Arc::clone(&self.store);
                    async move { store.delete_dead_letter_rows(cutoff, limit).await }
                }, now - chrono::Duration::days(retention.dead_letter_days))
                .await,
            decisions: self
                .sweep("agent_decisions", |cutoff, limit| {
                    let store = Arc::clone(&self.store);
                    async move { store.delete_executed_decisions(cutoff, limit).await }
                }, now - chrono::Duration::days(retention.decisions_days))
                .await,
            events: self
                .sweep("tracking_events", |cutoff, limit| {
                    let store = Arc::clone(&self.store);
                    async move { store.delete_tracking_events(cutoff, limit).await }
                }, now - chrono::Duration::days(retention.events_days))
                .await,
        };

        if report != CleanupReport::default() {
            info!(
                queue_rows = report.queue_rows,
                dead_letters = report.dead_letters,
                decisions = report.decisions,
                events = report.events,
                "retention sweep complete"
            );
        }
        Ok(report)
    }

    /// Delete batches of one target until a pass removes nothing.
    async fn sweep<F, Fut>(
        &self,
        target: &'static str,
        op: F,
        cutoff: DateTime<Utc>,
    ) -> u64
    where
        F: Fn(DateTime<Utc>, u64) -> Fut,
        Fut: Future<Output = Result<u64, StoreError>>,
    {
        let mut total = 0;
        loop {
            match op(cutoff, self.config.batch_size).await {
                Ok(0) => break,
                Ok(deleted) => {
                    total += deleted;
                    debug!(target, deleted, "cleanup batch removed");
                    tokio::time::sleep(INTER_BATCH_PAUSE).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    if message.contains("does not exist") {
                        let mut warned = self.warned_missing.lock();
                        if !warned.contains(&target) {
                            warned.push(target);
                            warn!(target, "cleanup target missing, skipping from now on");
                        }
                    } else {
                        error!(target, "cleanup batch failed: {message}");
                    }
                    break;
                }
            }
        }
        total
    }

    /// Run sweeps until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!("cleanup sweep failed: {e}");
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
