//! Test harness: the full pipeline wired over in-memory backends and a
//! mock ESP adapter.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use cadence_common::{
    EmailAddress,
    audience::{Subscriber, SubscriberStatus},
    campaign::{Audience, Campaign, CampaignState, SendingProfile, ThrottleSpeed},
    ids::{CampaignId, ListId, OrgId, SendingProfileId, SubscriberId, WorkerId},
};
use cadence_delivery::{
    AgentPreprocessor, ContentCache, Scheduler, SchedulerConfig, SuppressionHub, TrackingSettings,
    WorkerContext, WorkerPool, WorkerPoolConfig, scheduler::CompletionMonitor,
};
use cadence_esp::{EspAdapter, MockEspAdapter};
use cadence_kv::{KvStore, LockManager, MemoryKv};
use cadence_store::{
    MemoryStore, QueueStore, Store, SuppressionStore, ThrottleConfigStore,
};
use cadence_throttle::{
    BackpressureConfig, BackpressureMonitor, RateLimitConfig, RateLimiter, ThrottleManager,
    ThrottleManagerConfig,
};

pub const TRACKING_BASE: &str = "https://t.example.com";
pub const TRACKING_KEY: &str = "pipeline-test-key";

pub struct World {
    pub store: Arc<MemoryStore>,
    pub kv: Arc<MemoryKv>,
    pub mock: Arc<MockEspAdapter>,
    pub hub: Arc<SuppressionHub>,
    pub agent: Arc<AgentPreprocessor>,
    pub content: Arc<ContentCache>,
    pub scheduler: Scheduler,
    pub pool: WorkerPool,
    pub completion: CompletionMonitor,
    pub worker: WorkerId,
    pub org: OrgId,
    pub list: ListId,
}

impl World {
    /// Run one scheduler pass, one worker claim pass, and one completion
    /// pass, in pipeline order.
    pub async fn run_pipeline_once(&self, now: DateTime<Utc>) {
        self.scheduler.run_cycle(now).await.expect("scheduler");
        self.pool
            .run_claim_cycle(self.worker, now)
            .await
            .expect("worker");
        self.completion.run_cycle().await.expect("completion");
    }
}

/// Build a world with the default ESP quotas.
pub async fn world() -> World {
    world_with_rates(RateLimitConfig::default()).await
}

/// Build a world with explicit rate-limit quotas.
pub async fn world_with_rates(rates: RateLimitConfig) -> World {
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKv::new());
    let mock = Arc::new(MockEspAdapter::new("mock"));
    let org = OrgId::generate();
    let list = ListId::generate();

    store.insert_sending_profile(SendingProfile {
        id: SendingProfileId::generate(),
        org_id: org,
        esp_type: "mock".to_string(),
        endpoint: "https://mock.example/send".to_string(),
        api_key: "k".to_string(),
        is_default: true,
    });

    let hub = Arc::new(SuppressionHub::new(
        Arc::clone(&store) as Arc<dyn SuppressionStore>
    ));
    hub.reload().await.expect("suppression reload");

    let agent = Arc::new(AgentPreprocessor::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&kv) as Arc<dyn KvStore>,
    ));

    let backpressure = Arc::new(BackpressureMonitor::new(
        Arc::clone(&store) as Arc<dyn QueueStore>,
        BackpressureConfig {
            max_queue_depth: 1_000_000,
            poll_interval_secs: 30,
        },
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&kv) as Arc<dyn KvStore>,
        LockManager::new(Arc::clone(&kv) as Arc<dyn KvStore>),
        backpressure,
        Arc::clone(&agent),
        Arc::clone(&hub),
        SchedulerConfig::default(),
    );

    let content = Arc::new(ContentCache::default());
    let mut esps = cadence_delivery::EspRegistry::new();
    esps.register(Arc::clone(&mock) as Arc<dyn EspAdapter>);

    let ctx = Arc::new(WorkerContext {
        store: Arc::clone(&store) as Arc<dyn Store>,
        kv: Arc::clone(&kv) as Arc<dyn KvStore>,
        content: Arc::clone(&content),
        suppression: Arc::clone(&hub),
        rate_limiter: RateLimiter::new(Arc::clone(&kv) as Arc<dyn KvStore>, rates),
        throttle: Arc::new(ThrottleManager::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Arc::clone(&store) as Arc<dyn ThrottleConfigStore>,
            ThrottleManagerConfig::default(),
        )),
        esps,
        tracking: TrackingSettings {
            base_url: TRACKING_BASE.to_string(),
            signing_key: TRACKING_KEY.to_string(),
        },
        config: WorkerPoolConfig {
            num_workers: 1,
            batch_size: 100,
            poll_interval_secs: 1,
            claim_expiry_minutes: 10,
            max_retry_count: 3,
            enable_batching: false,
            heartbeat_interval_secs: 60,
        },
    });
    let pool = WorkerPool::new(ctx);

    let completion = CompletionMonitor::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Some(Arc::clone(&agent)),
    );

    World {
        store,
        kv,
        mock,
        hub,
        agent,
        content,
        scheduler,
        pool,
        completion,
        worker: WorkerId::generate(),
        org,
        list,
    }
}

/// Seed one active subscriber on the world's list.
pub fn seed_subscriber(world: &World, email: &str) -> SubscriberId {
    let subscriber = Subscriber {
        id: SubscriberId::generate(),
        org_id: world.org,
        email: EmailAddress::parse(email).expect("valid email"),
        name: Some("Test".to_string()),
        status: SubscriberStatus::Active,
        list_ids: vec![world.list],
        custom_fields: serde_json::Map::new(),
        created_at: Utc::now(),
    };
    let id = subscriber.id;
    world.store.insert_subscriber(subscriber);
    id
}

/// Seed a due, scheduled campaign over the world's list. `tweak` mutates
/// it before insertion.
pub fn seed_campaign(world: &World, tweak: impl FnOnce(&mut Campaign)) -> CampaignId {
    let now = Utc::now();
    let mut campaign = Campaign {
        id: CampaignId::generate(),
        org_id: world.org,
        name: "spring launch".to_string(),
        subject: "Hello {{ name }}".to_string(),
        html_body: "<html><body><p>Hi {{ name }}</p>\
                    <a href=\"https://acme.example/pricing\">Pricing</a></body></html>"
            .to_string(),
        text_body: "Hi {{ name }}".to_string(),
        preheader: Some("Fresh deals inside".to_string()),
        from_name: "Acme".to_string(),
        from_email: "news@acme.example".to_string(),
        reply_to: None,
        audience: Audience::List(world.list),
        sending_profile_id: None,
        esp_quotas: Vec::new(),
        suppression_list_ids: Vec::new(),
        max_recipients: None,
        scheduled_at: now - Duration::minutes(1),
        throttle_speed: ThrottleSpeed::Moderate,
        ai_send_time: false,
        auto_optimize: false,
        agent_enabled: false,
        state: CampaignState::Scheduled,
        sent_count: 0,
        total_recipients: 0,
        completed_at: None,
        created_at: now - Duration::hours(1),
        updated_at: now - Duration::hours(1),
    };
    tweak(&mut campaign);
    let id = campaign.id;
    world.store.insert_campaign(campaign);
    id
}
