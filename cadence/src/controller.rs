//! The controller: deserialized from the RON config file, it owns every
//! subsystem's configuration, builds the store/KV/adapter graph, and races
//! all the periodic tasks under one shutdown broadcast.

use std::sync::{Arc, LazyLock};

use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::warn;

use cadence_common::{Signal, internal, logging};
use cadence_delivery::{
    AbTestWorker, AgentPreprocessor, AutoTuneConfig, AutoTuner, CleanupConfig, CleanupWorker,
    ContentCache, EspRegistry, MetricsCollector, Scheduler, SchedulerConfig, SuppressionHub,
    TrackingSettings, WorkerContext, WorkerPool, WorkerPoolConfig,
};
use cadence_esp::{EspAdapter, HttpEspAdapter, MockEspAdapter};
use cadence_kv::{AdvisoryLocker, KvStore, LockManager, MemoryKv, RedisKv};
use cadence_store::{MemoryStore, PgStore, Store};
use cadence_throttle::{
    BackpressureConfig, BackpressureMonitor, RateLimitConfig, RateLimiter, ThrottleManager,
    ThrottleManagerConfig,
};

const fn default_max_connections() -> u32 {
    20
}

/// Relational store backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
    /// Single-process, non-durable. Development and tests only.
    Memory,
}

/// KV store backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvConfig {
    Redis { url: String },
    /// Single-process. Development and tests only.
    Memory,
}

const fn default_esp_batch_size() -> usize {
    1
}

const fn default_esp_payload_bytes() -> usize {
    5 * 1024 * 1024
}

/// One configured delivery provider.
#[derive(Debug, Clone, Deserialize)]
pub struct EspProfileConfig {
    /// Adapter key, matched against sending profiles' `esp_type`.
    pub esp_type: String,
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_esp_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_esp_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Replace the HTTP adapter with the recording mock. Tests only.
    #[serde(default)]
    pub mock: bool,
}

/// The whole pipeline's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Cadence {
    pub store: StoreConfig,
    pub kv: KvConfig,
    pub tracking: TrackingSettings,
    #[serde(default)]
    pub esps: Vec<EspProfileConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkerPoolConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub throttle: ThrottleManagerConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub auto_tune: AutoTuneConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    }

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Typed handles over one store backend: each subsystem gets the
/// narrowest surface it needs, all pointing at the same backend.
struct Stores {
    store: Arc<dyn Store>,
    suppression: Arc<dyn cadence_store::SuppressionStore>,
    queue: Arc<dyn cadence_store::QueueStore>,
    throttle_config: Arc<dyn cadence_store::ThrottleConfigStore>,
    maintenance: Arc<dyn cadence_store::MaintenanceStore>,
    advisory: Arc<dyn AdvisoryLocker>,
}

impl Stores {
    fn from_backend<S: Store + 'static>(backend: Arc<S>) -> Self {
        Self {
            store: Arc::clone(&backend) as Arc<dyn Store>,
            suppression: Arc::clone(&backend) as _,
            queue: Arc::clone(&backend) as _,
            throttle_config: Arc::clone(&backend) as _,
            maintenance: Arc::clone(&backend) as _,
            advisory: backend,
        }
    }
}

impl Cadence {
    async fn build_store(&self) -> anyhow::Result<Stores> {
        match &self.store {
            StoreConfig::Postgres {
                url,
                max_connections,
            } => Ok(Stores::from_backend(Arc::new(
                PgStore::connect(url, *max_connections).await?,
            ))),
            StoreConfig::Memory => {
                warn!("using the in-memory store: nothing will survive a restart");
                Ok(Stores::from_backend(Arc::new(MemoryStore::new())))
            }
        }
    }

    async fn build_kv(&self) -> anyhow::Result<Arc<dyn KvStore>> {
        match &self.kv {
            KvConfig::Redis { url } => Ok(Arc::new(RedisKv::connect(url).await?)),
            KvConfig::Memory => {
                warn!("using the in-memory KV store: counters are process-local");
                Ok(Arc::new(MemoryKv::new()))
            }
        }
    }

    fn build_registry(&self) -> anyhow::Result<EspRegistry> {
        let mut registry = EspRegistry::new();
        for profile in &self.esps {
            let adapter: Arc<dyn EspAdapter> = if profile.mock {
                Arc::new(MockEspAdapter::with_batch_size(
                    profile.esp_type.clone(),
                    profile.max_batch_size,
                ))
            } else {
                Arc::new(HttpEspAdapter::new(
                    profile.esp_type.clone(),
                    profile.endpoint.clone(),
                    profile.api_key.clone(),
                    profile.max_batch_size,
                    profile.max_payload_bytes,
                )?)
            };
            registry.register(adapter);
        }
        Ok(registry)
    }

    /// Run the pipeline until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error when a backend cannot be reached at startup or a
    /// subsystem exits with a fatal error.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let stores = self.build_store().await?;
        let kv = self.build_kv().await?;
        internal!(level = INFO, "Stores connected");

        let hub = Arc::new(SuppressionHub::new(Arc::clone(&stores.suppression)));
        match hub.reload().await {
            Ok(count) => internal!(level = INFO, "Global suppression loaded ({count} entries)"),
            Err(e) => warn!("initial suppression load failed: {e}"),
        }

        let agent = Arc::new(AgentPreprocessor::new(
            Arc::clone(&stores.store),
            Arc::clone(&kv),
        ));

        let backpressure = Arc::new(BackpressureMonitor::new(
            Arc::clone(&stores.queue),
            self.backpressure,
        ));

        let scheduler = Scheduler::new(
            Arc::clone(&stores.store),
            Arc::clone(&kv),
            LockManager::with_fallback(Arc::clone(&kv), Arc::clone(&stores.advisory)),
            Arc::clone(&backpressure),
            Arc::clone(&agent),
            Arc::clone(&hub),
            self.scheduler,
        );

        let completion = cadence_delivery::scheduler::CompletionMonitor::new(
            Arc::clone(&stores.store),
            Some(Arc::clone(&agent)),
        );

        let content = Arc::new(ContentCache::default());
        let throttle = Arc::new(ThrottleManager::new(
            Arc::clone(&kv),
            Arc::clone(&stores.throttle_config),
            self.throttle.clone(),
        ));

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&stores.store),
            kv: Arc::clone(&kv),
            content: Arc::clone(&content),
            suppression: Arc::clone(&hub),
            rate_limiter: RateLimiter::new(Arc::clone(&kv), self.rate_limits.clone()),
            throttle,
            esps: self.build_registry()?,
            tracking: self.tracking.clone(),
            config: self.workers.clone(),
        });
        let pool = WorkerPool::new(ctx);

        let metrics = MetricsCollector::new(Arc::clone(&stores.store), Arc::clone(&kv));
        let tuner = AutoTuner::new(
            Arc::clone(&stores.store),
            Arc::clone(&kv),
            Some(Arc::clone(&content)),
            self.auto_tune,
        );
        let ab_worker = AbTestWorker::new(Arc::clone(&stores.store), Some(Arc::clone(&content)));
        let cleanup = CleanupWorker::new(Arc::clone(&stores.maintenance), self.cleanup);

        internal!(level = INFO, "Cadence pipeline starting");

        let ret = tokio::select! {
            () = scheduler.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            () = completion.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            () = pool.serve(SHUTDOWN_BROADCAST.clone()) => Ok(()),
            () = backpressure.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            () = hub.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            () = metrics.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            () = tuner.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            () = ab_worker.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            () = cleanup.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            r = shutdown() => r,
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}
