//! The send worker pool.
//!
//! W workers in this process, each running `claim -> process -> repeat`
//! against the shared queue. Claims are atomic at the store (priority
//! first, earliest due second, foreign claims skipped); everything after
//! the claim is per-row and independent, so workers never coordinate with
//! each other directly.

pub mod batch;
pub mod process;

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use cadence_common::{Signal, ids::WorkerId, internal};
use cadence_esp::EspAdapter;
use cadence_kv::KvStore;
use cadence_store::{QueueStore, Store, WorkerRecord, WorkerStore};
use cadence_throttle::{RateLimiter, ThrottleManager};

use crate::{content::ContentCache, error::DeliveryError, suppression::SuppressionHub};

/// Adapters available to this process, keyed by `esp_type`.
#[derive(Default)]
pub struct EspRegistry {
    adapters: HashMap<String, Arc<dyn EspAdapter>>,
}

impl std::fmt::Debug for EspRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EspRegistry")
            .field("esp_types", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EspRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own `esp_type`.
    pub fn register(&mut self, adapter: Arc<dyn EspAdapter>) {
        self.adapters
            .insert(adapter.esp_type().to_string(), adapter);
    }

    /// Look an adapter up.
    #[must_use]
    pub fn get(&self, esp_type: &str) -> Option<Arc<dyn EspAdapter>> {
        self.adapters.get(esp_type).cloned()
    }
}

/// Tracking-link construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSettings {
    pub base_url: String,
    pub signing_key: String,
}

fn default_num_workers() -> usize {
    num_cpus::get()
}

const fn default_batch_size() -> u64 {
    200
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_claim_expiry_minutes() -> i64 {
    10
}

const fn default_max_retry_count() -> u32 {
    3
}

const fn default_heartbeat_interval_secs() -> u64 {
    60
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Parallelism of the pool.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Rows claimed per iteration per worker.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Sleep between empty claims, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Minutes after which a claim from a dead worker is reclaimable.
    #[serde(default = "default_claim_expiry_minutes")]
    pub claim_expiry_minutes: i64,

    /// Failed attempts before a row dead-letters.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Use `send_batch` for same-campaign groups when the adapter
    /// supports it.
    #[serde(default)]
    pub enable_batching: bool,

    /// Worker heartbeat cadence, in seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            claim_expiry_minutes: default_claim_expiry_minutes(),
            max_retry_count: default_max_retry_count(),
            enable_batching: false,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// Everything a worker needs to process a claimed row.
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub kv: Arc<dyn KvStore>,
    pub content: Arc<ContentCache>,
    pub suppression: Arc<SuppressionHub>,
    pub rate_limiter: RateLimiter,
    pub throttle: Arc<ThrottleManager>,
    pub esps: EspRegistry,
    pub tracking: TrackingSettings,
    pub config: WorkerPoolConfig,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("esps", &self.esps)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The pool of send workers.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// A pool over a prepared context.
    #[must_use]
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// The shared context, exposed for tests and wiring.
    #[must_use]
    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    /// One claim-and-process pass for `worker` at `now`. Returns the
    /// number of rows claimed.
    ///
    /// # Errors
    ///
    /// Returns the store error when the claim itself fails; per-row
    /// failures are absorbed into each row's disposition.
    pub async fn run_claim_cycle(
        &self,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<u64, DeliveryError> {
        // Recover rows from workers that died mid-claim.
        let reclaimed = self
            .ctx
            .store
            .release_expired_claims(now, chrono::Duration::minutes(self.ctx.config.claim_expiry_minutes))
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed rows from expired claims");
        }

        let rows = self
            .ctx
            .store
            .claim_batch(worker, self.ctx.config.batch_size, now)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let claimed = rows.len() as u64;
        debug!(worker = %worker, claimed, "claimed queue rows");

        if self.ctx.config.enable_batching {
            batch::process_claimed(&self.ctx, worker, rows, now).await;
        } else {
            for row in rows {
                process::process_row(&self.ctx, worker, &row, now).await;
            }
        }

        Ok(claimed)
    }

    /// Run the pool until shutdown: spawns the configured number of
    /// worker loops plus a cache sweeper, registers each worker, and
    /// deregisters them on the way out.
    pub async fn serve(&self, shutdown: tokio::sync::broadcast::Sender<Signal>) {
        let workers: Vec<WorkerId> = (0..self.ctx.config.num_workers.max(1))
            .map(|_| WorkerId::generate())
            .collect();

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        for worker in &workers {
            let record = WorkerRecord {
                id: *worker,
                hostname: hostname.clone(),
                started_at: Utc::now(),
                heartbeat_at: Utc::now(),
            };
            if let Err(e) = self.ctx.store.register_worker(&record).await {
                warn!(worker = %worker, error = %e, "worker registration failed");
            }
        }
        internal!(level = INFO, workers = workers.len(), "send worker pool starting");

        let loops = workers.iter().map(|worker| {
            let worker = *worker;
            let shutdown = shutdown.subscribe();
            self.worker_loop(worker, shutdown)
        });
        join_all(loops).await;

        for worker in &workers {
            if let Err(e) = self.ctx.store.deregister_worker(*worker).await {
                warn!(worker = %worker, error = %e, "worker deregistration failed");
            }
        }
        internal!(level = INFO, "send worker pool stopped");
    }

    async fn worker_loop(
        &self,
        worker: WorkerId,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) {
        let mut poll =
            tokio::time::interval(Duration::from_secs(self.ctx.config.poll_interval_secs.max(1)));
        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.ctx.config.heartbeat_interval_secs.max(1),
        ));
        poll.tick().await;
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.run_claim_cycle(worker, Utc::now()).await {
                        Ok(0) => {}
                        Ok(processed) => {
                            debug!(worker = %worker, processed, "claim cycle complete");
                        }
                        Err(e) => {
                            error!(worker = %worker, "claim cycle failed: {e}");
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.ctx.content.sweep();
                    if let Err(e) = self.ctx.store.worker_heartbeat(worker, Utc::now()).await {
                        warn!(worker = %worker, error = %e, "heartbeat failed");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(_) => {
                            debug!(worker = %worker, "worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}
