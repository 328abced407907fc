//! Process-local campaign content cache.
//!
//! Workers resolve a campaign's content once per ten minutes instead of
//! once per row. Entries pair the rendered content with the resolved
//! sending profiles (including any quota split); eviction is lazy on read
//! plus an explicit sweep the pool runs periodically.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::RwLock;
use rand::Rng;

use cadence_common::{
    campaign::{CampaignContent, SendingProfile},
    ids::CampaignId,
};
use cadence_store::{CampaignStore, StoreError};

/// Default entry lifetime.
const CONTENT_TTL: Duration = Duration::from_secs(600);

/// One resolved sending route with its share of the campaign.
#[derive(Debug, Clone)]
pub struct QuotaRoute {
    pub profile: SendingProfile,
    pub percent: u8,
}

/// Cached per-campaign delivery content.
#[derive(Debug, Clone)]
pub struct ResolvedContent {
    pub content: CampaignContent,
    /// Non-empty only for quota-split campaigns.
    pub routes: Vec<QuotaRoute>,
}

impl ResolvedContent {
    /// Pick the ESP type for one send: the single resolved profile, or a
    /// quota-weighted draw across the split.
    #[must_use]
    pub fn pick_esp_type(&self) -> String {
        if self.routes.is_empty() {
            return self.content.esp_type.clone();
        }

        let total: u32 = self.routes.iter().map(|r| u32::from(r.percent)).sum();
        if total == 0 {
            return self.content.esp_type.clone();
        }

        let mut draw = rand::rng().random_range(0..total);
        for route in &self.routes {
            let weight = u32::from(route.percent);
            if draw < weight {
                return route.profile.esp_type.clone();
            }
            draw -= weight;
        }
        self.content.esp_type.clone()
    }
}

#[derive(Debug)]
struct Entry {
    cached_at: Instant,
    content: Arc<ResolvedContent>,
}

/// TTL-bounded map from campaign to resolved content.
#[derive(Debug)]
pub struct ContentCache {
    ttl: Duration,
    entries: RwLock<AHashMap<CampaignId, Entry>>,
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(CONTENT_TTL)
    }
}

impl ContentCache {
    /// A cache with the given entry lifetime.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(AHashMap::new()),
        }
    }

    /// Cached content for `campaign`, loading it in one store round-trip
    /// on miss.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the campaign has no resolvable
    /// sending profile; callers treat that as a permanent failure.
    pub async fn get_or_load<S: CampaignStore + ?Sized>(
        &self,
        store: &S,
        campaign: CampaignId,
    ) -> Result<Arc<ResolvedContent>, StoreError> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&campaign) {
                if entry.cached_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&entry.content));
                }
            }
        }

        let loaded = Arc::new(Self::load(store, campaign).await?);
        self.entries.write().insert(
            campaign,
            Entry {
                cached_at: Instant::now(),
                content: Arc::clone(&loaded),
            },
        );
        Ok(loaded)
    }

    async fn load<S: CampaignStore + ?Sized>(
        store: &S,
        campaign_id: CampaignId,
    ) -> Result<ResolvedContent, StoreError> {
        let campaign = store.campaign(campaign_id).await?;

        let mut routes = Vec::new();
        for quota in &campaign.esp_quotas {
            let profile = store.sending_profile(quota.profile_id).await?;
            routes.push(QuotaRoute {
                profile,
                percent: quota.percent,
            });
        }

        let primary = if let Some(route) = routes.first() {
            route.profile.clone()
        } else if let Some(profile_id) = campaign.sending_profile_id {
            store.sending_profile(profile_id).await?
        } else {
            store
                .default_sending_profile(campaign.org_id)
                .await?
                .ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "no sending profile for campaign {campaign_id}"
                    ))
                })?
        };

        Ok(ResolvedContent {
            content: CampaignContent::from_campaign(&campaign, &primary.esp_type),
            routes,
        })
    }

    /// Drop one campaign's entry.
    pub fn invalidate(&self, campaign: CampaignId) {
        self.entries.write().remove(&campaign);
    }

    /// Drop every expired entry. The worker pool runs this periodically.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .retain(|_, entry| entry.cached_at.elapsed() < ttl);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cadence_common::{
        campaign::{Audience, Campaign, CampaignState, EspQuota, ThrottleSpeed},
        ids::{ListId, OrgId, SendingProfileId},
    };
    use cadence_store::MemoryStore;
    use chrono::Utc;

    use super::*;

    fn profile(org: OrgId, esp_type: &str, is_default: bool) -> SendingProfile {
        SendingProfile {
            id: SendingProfileId::generate(),
            org_id: org,
            esp_type: esp_type.to_string(),
            endpoint: "https://api.example/send".to_string(),
            api_key: "k".to_string(),
            is_default,
        }
    }

    fn campaign(org: OrgId) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: CampaignId::generate(),
            org_id: org,
            name: "c".to_string(),
            subject: "s".to_string(),
            html_body: "<p>h</p>".to_string(),
            text_body: "t".to_string(),
            preheader: None,
            from_name: "A".to_string(),
            from_email: "a@acme.example".to_string(),
            reply_to: None,
            audience: Audience::List(ListId::generate()),
            sending_profile_id: None,
            esp_quotas: Vec::new(),
            suppression_list_ids: Vec::new(),
            max_recipients: None,
            scheduled_at: now,
            throttle_speed: ThrottleSpeed::Moderate,
            ai_send_time: false,
            auto_optimize: false,
            agent_enabled: false,
            state: CampaignState::Sending,
            sent_count: 0,
            total_recipients: 0,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn resolves_default_profile_and_caches() {
        let store = MemoryStore::new();
        let org = OrgId::generate();
        store.insert_sending_profile(profile(org, "sendgrid", true));
        let c = campaign(org);
        let id = c.id;
        store.insert_campaign(c);

        let cache = ContentCache::default();
        let resolved = cache.get_or_load(&store, id).await.unwrap();
        assert_eq!(resolved.content.esp_type, "sendgrid");
        assert_eq!(cache.len(), 1);

        // Mutating the stored campaign does not affect the cached copy.
        store
            .rewrite_live_content(id, Some("changed"), None)
            .await
            .unwrap();
        let cached = cache.get_or_load(&store, id).await.unwrap();
        assert_eq!(cached.content.subject, "s");

        cache.invalidate(id);
        let fresh = cache.get_or_load(&store, id).await.unwrap();
        assert_eq!(fresh.content.subject, "changed");
    }

    #[tokio::test]
    async fn missing_profile_is_not_found() {
        let store = MemoryStore::new();
        let c = campaign(OrgId::generate());
        let id = c.id;
        store.insert_campaign(c);

        let cache = ContentCache::default();
        assert!(matches!(
            cache.get_or_load(&store, id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn quota_split_draws_only_configured_routes() {
        let store = MemoryStore::new();
        let org = OrgId::generate();
        let a = profile(org, "esp-a", false);
        let b = profile(org, "esp-b", false);
        let mut c = campaign(org);
        c.esp_quotas = vec![
            EspQuota {
                profile_id: a.id,
                percent: 70,
            },
            EspQuota {
                profile_id: b.id,
                percent: 30,
            },
        ];
        let id = c.id;
        store.insert_sending_profile(a);
        store.insert_sending_profile(b);
        store.insert_campaign(c);

        let cache = ContentCache::default();
        let resolved = cache.get_or_load(&store, id).await.unwrap();
        assert_eq!(resolved.routes.len(), 2);
        for _ in 0..50 {
            let picked = resolved.pick_esp_type();
            assert!(picked == "esp-a" || picked == "esp-b");
        }
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries() {
        let store = MemoryStore::new();
        let org = OrgId::generate();
        store.insert_sending_profile(profile(org, "sendgrid", true));
        let c = campaign(org);
        let id = c.id;
        store.insert_campaign(c);

        let cache = ContentCache::new(Duration::from_millis(1));
        cache.get_or_load(&store, id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.sweep();
        assert!(cache.is_empty());
    }
}
