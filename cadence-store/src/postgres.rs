//! Postgres store backend.
//!
//! Column names used here are contractual with the wider system; physical
//! layout (indexes, partitioning) is not. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so workers never block each other on the hot
//! path; every ownership-sensitive update re-checks the claiming worker in
//! its `WHERE` clause.

use std::{collections::HashMap, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use tokio::sync::Mutex;

use cadence_common::{
    abtest::{AbTest, AbVariant, TargetMetric, VariantState},
    audience::{RecipientProfile, Subscriber, SubscriberStatus},
    campaign::{
        Audience, Campaign, CampaignState, EspQuota, SendingProfile, ThrottleSpeed,
    },
    decision::{AgentDecision, Classification, ContentStrategy},
    events::{
        CampaignAlert, CampaignCounters, RealtimeMetricsRow, TrackingEvent, TrackingEventKind,
    },
    ids::{
        CampaignId, ListId, OrgId, QueueRowId, SegmentId, SendingProfileId, SubscriberId,
        SuppressionListId, VariantId, WorkerId,
    },
    queue::{QueueRow, QueueStatus},
    throttle::{DailyDomainStats, OrgThrottleConfig},
};
use cadence_kv::{AdvisoryLocker, KvError};

use crate::{
    error::{Result, StoreError},
    segment,
    store::{
        AbTestStore, AudienceStore, CampaignStore, DecisionStore, EventStore, MaintenanceStore,
        ProfileStore, QueueStore, SuppressionStore, ThrottleConfigStore, WorkerStore,
    },
    types::{CampaignRowStats, ContentPatch, NewQueueRow, WorkerRecord},
};

const QUEUE_COLUMNS: &str = "id, campaign_id, subscriber_id, recipient, substitutions, \
     variant_subject, variant_html, variant_text, variant_from_name, priority, scheduled_at, \
     status, claimed_by, claimed_at, attempts, last_error, skip_reason, message_id, created_at";

const CAMPAIGN_COLUMNS: &str = "id, org_id, name, subject, html_body, text_body, preheader, \
     from_name, from_email, reply_to, list_id, segment_id, sending_profile_id, esp_quotas, \
     suppression_list_ids, max_recipients, scheduled_at, throttle_speed, ai_send_time, \
     auto_optimize, agent_enabled, state, sent_count, total_recipients, completed_at, \
     created_at, updated_at";

/// Store backend over a Postgres connection pool.
pub struct PgStore {
    pool: PgPool,
    /// Advisory locks are session-scoped; the connection that took one is
    /// pinned here until release so the unlock runs on the same session.
    advisory: Mutex<HashMap<String, sqlx::pool::PoolConnection<sqlx::Postgres>>>,
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore").finish_non_exhaustive()
    }
}

impl PgStore {
    /// Connect with pipeline-appropriate pool settings.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            advisory: Mutex::new(HashMap::new()),
        }
    }

    fn advisory_key(name: &str) -> i64 {
        let d = md5::compute(name.as_bytes()).0;
        i64::from_be_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]])
    }
}

fn parse_id<T>(raw: &str, what: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StoreError::Decode(format!("{what} id {raw}: {e}")))
}

fn id_of<T: std::fmt::Display>(id: T) -> String {
    id.to_string()
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn map_queue_row(row: &PgRow) -> Result<QueueRow> {
    let status_raw: String = row.try_get("status")?;
    let status = QueueStatus::from_str_opt(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("queue status {status_raw}")))?;

    let recipient_raw: String = row.try_get("recipient")?;
    let recipient = cadence_common::EmailAddress::parse(&recipient_raw)
        .map_err(|e| StoreError::Decode(e.to_string()))?;

    let substitutions: Option<serde_json::Value> = row.try_get("substitutions")?;
    let substitutions = match substitutions {
        Some(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    };

    let claimed_by: Option<String> = row.try_get("claimed_by")?;
    let claimed_by = claimed_by
        .map(|raw| parse_id::<WorkerId>(&raw, "worker"))
        .transpose()?;

    Ok(QueueRow {
        id: parse_id(&row.try_get::<String, _>("id")?, "queue row")?,
        campaign_id: parse_id(&row.try_get::<String, _>("campaign_id")?, "campaign")?,
        subscriber_id: parse_id(&row.try_get::<String, _>("subscriber_id")?, "subscriber")?,
        recipient,
        substitutions,
        variant_subject: row.try_get("variant_subject")?,
        variant_html: row.try_get("variant_html")?,
        variant_text: row.try_get("variant_text")?,
        variant_from_name: row.try_get("variant_from_name")?,
        priority: row.try_get("priority")?,
        scheduled_at: row.try_get("scheduled_at")?,
        status,
        claimed_by,
        claimed_at: row.try_get("claimed_at")?,
        attempts: to_u32(row.try_get("attempts")?),
        last_error: row.try_get("last_error")?,
        skip_reason: row.try_get("skip_reason")?,
        message_id: row.try_get("message_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_campaign(row: &PgRow) -> Result<Campaign> {
    let state_raw: String = row.try_get("state")?;
    let state = CampaignState::from_str_opt(&state_raw)
        .ok_or_else(|| StoreError::Decode(format!("campaign state {state_raw}")))?;

    let throttle_raw: String = row.try_get("throttle_speed")?;
    let throttle_speed = match throttle_raw.as_str() {
        "instant" => ThrottleSpeed::Instant,
        "gentle" => ThrottleSpeed::Gentle,
        "careful" => ThrottleSpeed::Careful,
        _ => ThrottleSpeed::Moderate,
    };

    let list_id: Option<String> = row.try_get("list_id")?;
    let segment_id: Option<String> = row.try_get("segment_id")?;
    let audience = match (list_id, segment_id) {
        (Some(list), _) => Audience::List(parse_id(&list, "list")?),
        (None, Some(seg)) => Audience::Segment(parse_id(&seg, "segment")?),
        (None, None) => {
            return Err(StoreError::Decode(
                "campaign has neither list_id nor segment_id".to_string(),
            ));
        }
    };

    let sending_profile_id: Option<String> = row.try_get("sending_profile_id")?;
    let sending_profile_id = sending_profile_id
        .map(|raw| parse_id::<SendingProfileId>(&raw, "sending profile"))
        .transpose()?;

    let esp_quotas: Option<serde_json::Value> = row.try_get("esp_quotas")?;
    let esp_quotas: Vec<EspQuota> = esp_quotas
        .map(|v| serde_json::from_value(v).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()?
        .unwrap_or_default();

    let suppression: Option<serde_json::Value> = row.try_get("suppression_list_ids")?;
    let suppression_list_ids: Vec<SuppressionListId> = suppression
        .map(|v| serde_json::from_value(v).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()?
        .unwrap_or_default();

    let max_recipients: Option<i64> = row.try_get("max_recipients")?;

    Ok(Campaign {
        id: parse_id(&row.try_get::<String, _>("id")?, "campaign")?,
        org_id: parse_id(&row.try_get::<String, _>("org_id")?, "org")?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        html_body: row.try_get("html_body")?,
        text_body: row.try_get("text_body")?,
        preheader: row.try_get("preheader")?,
        from_name: row.try_get("from_name")?,
        from_email: row.try_get("from_email")?,
        reply_to: row.try_get("reply_to")?,
        audience,
        sending_profile_id,
        esp_quotas,
        suppression_list_ids,
        max_recipients: max_recipients.map(to_u64),
        scheduled_at: row.try_get("scheduled_at")?,
        throttle_speed,
        ai_send_time: row.try_get("ai_send_time")?,
        auto_optimize: row.try_get("auto_optimize")?,
        agent_enabled: row.try_get("agent_enabled")?,
        state,
        sent_count: to_u64(row.try_get("sent_count")?),
        total_recipients: to_u64(row.try_get("total_recipients")?),
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_subscriber(row: &PgRow) -> Result<Subscriber> {
    let status_raw: String = row.try_get("status")?;
    let status = match status_raw.as_str() {
        "unsubscribed" => SubscriberStatus::Unsubscribed,
        "bounced" => SubscriberStatus::Bounced,
        "complained" => SubscriberStatus::Complained,
        _ => SubscriberStatus::Active,
    };

    let email_raw: String = row.try_get("email")?;
    let email = cadence_common::EmailAddress::parse(&email_raw)
        .map_err(|e| StoreError::Decode(e.to_string()))?;

    let custom: Option<serde_json::Value> = row.try_get("custom_fields")?;
    let custom_fields = match custom {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };

    Ok(Subscriber {
        id: parse_id(&row.try_get::<String, _>("id")?, "subscriber")?,
        org_id: parse_id(&row.try_get::<String, _>("org_id")?, "org")?,
        email,
        name: row.try_get("name")?,
        status,
        list_ids: Vec::new(),
        custom_fields,
        created_at: row.try_get("created_at")?,
    })
}

fn map_profile(row: &PgRow) -> Result<RecipientProfile> {
    let mailbox_raw: String = row.try_get("mailbox_state")?;
    let mailbox_state = match mailbox_raw.as_str() {
        "degraded" => cadence_common::audience::MailboxState::Degraded,
        "full" => cadence_common::audience::MailboxState::Full,
        _ => cadence_common::audience::MailboxState::Healthy,
    };

    let optimal_hour: Option<i32> = row.try_get("optimal_hour")?;

    Ok(RecipientProfile {
        subscriber_id: parse_id(&row.try_get::<String, _>("subscriber_id")?, "subscriber")?,
        engagement_score: row.try_get("engagement_score")?,
        total_sends: to_u64(row.try_get("total_sends")?),
        total_opens: to_u64(row.try_get("total_opens")?),
        engagement_trend: row.try_get("engagement_trend")?,
        open_rate: row.try_get("open_rate")?,
        consecutive_bounces: to_u32(row.try_get("consecutive_bounces")?),
        has_complained: row.try_get("has_complained")?,
        mailbox_state,
        send_suspended_until: row.try_get("send_suspended_until")?,
        last_open_at: row.try_get("last_open_at")?,
        first_seen_at: row.try_get("first_seen_at")?,
        optimal_hour: optimal_hour.and_then(|h| u8::try_from(h).ok()),
        optimal_hour_confidence: row.try_get("optimal_hour_confidence")?,
        image_preference: row.try_get("image_preference")?,
        personalization_preference: row.try_get("personalization_preference")?,
        has_purchased: row.try_get("has_purchased")?,
    })
}

fn map_variant(row: &PgRow) -> Result<AbVariant> {
    let state_raw: String = row.try_get("state")?;
    let state = match state_raw.as_str() {
        "winner" => VariantState::Winner,
        "loser" => VariantState::Loser,
        "eliminated" => VariantState::Eliminated,
        _ => VariantState::Active,
    };

    Ok(AbVariant {
        id: parse_id(&row.try_get::<String, _>("id")?, "variant")?,
        campaign_id: parse_id(&row.try_get::<String, _>("campaign_id")?, "campaign")?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        from_name: row.try_get("from_name")?,
        html_body: row.try_get("html_body")?,
        text_body: row.try_get("text_body")?,
        is_control: row.try_get("is_control")?,
        state,
        assigned: to_u64(row.try_get("assigned")?),
        opens: to_u64(row.try_get("opens")?),
        clicks: to_u64(row.try_get("clicks")?),
        conversions: to_u64(row.try_get("conversions")?),
    })
}

#[async_trait]
impl CampaignStore for PgStore {
    async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id_of(id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))?;
        map_campaign(&row)
    }

    async fn promote_due_campaigns(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE campaigns SET state = 'preparing', updated_at = NOW() \
             WHERE state = 'scheduled' AND scheduled_at <= $1",
        )
        .bind(horizon)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn due_campaigns(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
             WHERE state IN ('scheduled', 'preparing') AND scheduled_at <= $1 \
             ORDER BY scheduled_at ASC LIMIT $2",
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_campaign).collect()
    }

    async fn try_transition(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
    ) -> Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            "UPDATE campaigns SET state = $1, updated_at = NOW() \
             WHERE id = $2 AND state = ANY($3)",
        )
        .bind(to.as_str())
        .bind(id_of(id))
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_campaign_content(
        &self,
        id: CampaignId,
        patch: ContentPatch,
        now: DateTime<Utc>,
        edit_lock: chrono::Duration,
    ) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT scheduled_at, state FROM campaigns WHERE id = $1 FOR UPDATE")
            .bind(id_of(id))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))?;

        let scheduled_at: DateTime<Utc> = row.try_get("scheduled_at")?;
        let state_raw: String = row.try_get("state")?;
        let state = CampaignState::from_str_opt(&state_raw)
            .ok_or_else(|| StoreError::Decode(format!("campaign state {state_raw}")))?;

        if !state.is_terminal() && scheduled_at - now <= edit_lock {
            return Err(StoreError::State(
                cadence_common::error::StateError::EditLocked {
                    minutes_to_send: (scheduled_at - now).num_minutes(),
                },
            ));
        }

        sqlx::query(
            "UPDATE campaigns SET \
                 subject = COALESCE($2, subject), \
                 html_body = COALESCE($3, html_body), \
                 text_body = COALESCE($4, text_body), \
                 preheader = COALESCE($5, preheader), \
                 from_name = COALESCE($6, from_name), \
                 from_email = COALESCE($7, from_email), \
                 reply_to = COALESCE($8, reply_to), \
                 updated_at = $9 \
             WHERE id = $1",
        )
        .bind(id_of(id))
        .bind(patch.subject)
        .bind(patch.html_body)
        .bind(patch.text_body)
        .bind(patch.preheader)
        .bind(patch.from_name)
        .bind(patch.from_email)
        .bind(patch.reply_to)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn rewrite_live_content(
        &self,
        id: CampaignId,
        subject: Option<&str>,
        from_name: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET \
                 subject = COALESCE($2, subject), \
                 from_name = COALESCE($3, from_name), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id_of(id))
        .bind(subject)
        .bind(from_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_campaign(
        &self,
        id: CampaignId,
        state: CampaignState,
        sent_count: u64,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET state = $2, sent_count = $3, completed_at = $4, \
             updated_at = $4 WHERE id = $1",
        )
        .bind(id_of(id))
        .bind(state.as_str())
        .bind(i64::try_from(sent_count).unwrap_or(i64::MAX))
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_sent_count(&self, id: CampaignId, n: u64) -> Result<()> {
        sqlx::query("UPDATE campaigns SET sent_count = sent_count + $2 WHERE id = $1")
            .bind(id_of(id))
            .bind(i64::try_from(n).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_total_recipients(&self, id: CampaignId, n: u64) -> Result<()> {
        sqlx::query("UPDATE campaigns SET total_recipients = $2 WHERE id = $1")
            .bind(id_of(id))
            .bind(i64::try_from(n).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn campaigns_in_state(
        &self,
        state: CampaignState,
        limit: u64,
    ) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE state = $1 ORDER BY id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_campaign).collect()
    }

    async fn sending_profile(&self, id: SendingProfileId) -> Result<SendingProfile> {
        let row = sqlx::query(
            "SELECT id, org_id, esp_type, endpoint, api_key, is_default \
             FROM sending_profiles WHERE id = $1",
        )
        .bind(id_of(id))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("sending profile {id}")))?;

        Ok(SendingProfile {
            id: parse_id(&row.try_get::<String, _>("id")?, "sending profile")?,
            org_id: parse_id(&row.try_get::<String, _>("org_id")?, "org")?,
            esp_type: row.try_get("esp_type")?,
            endpoint: row.try_get("endpoint")?,
            api_key: row.try_get("api_key")?,
            is_default: row.try_get("is_default")?,
        })
    }

    async fn default_sending_profile(&self, org: OrgId) -> Result<Option<SendingProfile>> {
        let row = sqlx::query(
            "SELECT id, org_id, esp_type, endpoint, api_key, is_default \
             FROM sending_profiles WHERE org_id = $1 AND is_default LIMIT 1",
        )
        .bind(id_of(org))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SendingProfile {
                id: parse_id(&row.try_get::<String, _>("id")?, "sending profile")?,
                org_id: parse_id(&row.try_get::<String, _>("org_id")?, "org")?,
                esp_type: row.try_get("esp_type")?,
                endpoint: row.try_get("endpoint")?,
                api_key: row.try_get("api_key")?,
                is_default: row.try_get("is_default")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn enqueue_rows(&self, rows: Vec<NewQueueRow>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for row in rows {
            let substitutions = row.substitutions.map(serde_json::Value::Object);
            let result = sqlx::query(
                "INSERT INTO campaign_queue \
                     (id, campaign_id, subscriber_id, recipient, substitutions, \
                      variant_subject, variant_html, variant_text, variant_from_name, \
                      priority, scheduled_at, status, attempts, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'queued', 0, NOW()) \
                 ON CONFLICT (campaign_id, subscriber_id) DO NOTHING",
            )
            .bind(id_of(row.id))
            .bind(id_of(row.campaign_id))
            .bind(id_of(row.subscriber_id))
            .bind(row.recipient.as_str())
            .bind(substitutions)
            .bind(row.variant_subject)
            .bind(row.variant_html)
            .bind(row.variant_text)
            .bind(row.variant_from_name)
            .bind(row.priority)
            .bind(row.scheduled_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        worker: WorkerId,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueRow>> {
        // Rows whose campaign has left `sending` (paused, cancelled) stay
        // unclaimed.
        let sql = format!(
            "UPDATE campaign_queue SET status = 'claimed', claimed_by = $1, claimed_at = $2 \
             WHERE id IN ( \
                 SELECT q.id FROM campaign_queue q \
                 LEFT JOIN campaigns c ON c.id = q.campaign_id \
                 WHERE q.status IN ('queued', 'failed') AND q.scheduled_at <= $2 \
                     AND (c.id IS NULL OR c.state = 'sending') \
                 ORDER BY q.priority DESC, q.scheduled_at ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {QUEUE_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(id_of(worker))
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_queue_row).collect()
    }

    async fn release_expired_claims(
        &self,
        now: DateTime<Utc>,
        claim_expiry: chrono::Duration,
    ) -> Result<u64> {
        let cutoff = now - claim_expiry;
        let result = sqlx::query(
            "UPDATE campaign_queue SET status = 'queued', claimed_by = NULL, claimed_at = NULL \
             WHERE status = 'claimed' AND claimed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_sent(&self, id: QueueRowId, worker: WorkerId, message_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaign_queue SET status = 'sent', message_id = $3 \
             WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'",
        )
        .bind(id_of(id))
        .bind(id_of(worker))
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "queue row {id} not claimed by {worker}"
            )));
        }
        Ok(())
    }

    async fn mark_skipped(&self, id: QueueRowId, worker: WorkerId, reason: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaign_queue SET status = 'skipped', skip_reason = $3 \
             WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'",
        )
        .bind(id_of(id))
        .bind(id_of(worker))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "queue row {id} not claimed by {worker}"
            )));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: QueueRowId,
        worker: WorkerId,
        error: &str,
        max_retries: u32,
    ) -> Result<QueueStatus> {
        let row = sqlx::query(
            "UPDATE campaign_queue SET \
                 attempts = attempts + 1, \
                 last_error = $3, \
                 claimed_by = NULL, \
                 claimed_at = NULL, \
                 status = CASE WHEN attempts + 1 >= $4 THEN 'dead_letter' ELSE 'failed' END \
             WHERE id = $1 AND claimed_by = $2 AND status = 'claimed' \
             RETURNING status",
        )
        .bind(id_of(id))
        .bind(id_of(worker))
        .bind(error)
        .bind(i32::try_from(max_retries).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::Conflict(format!("queue row {id} not claimed by {worker}")))?;

        let status_raw: String = row.try_get("status")?;
        QueueStatus::from_str_opt(&status_raw)
            .ok_or_else(|| StoreError::Decode(format!("queue status {status_raw}")))
    }

    async fn restore_queued(
        &self,
        id: QueueRowId,
        worker: WorkerId,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaign_queue SET status = 'queued', claimed_by = NULL, claimed_at = NULL, \
                 scheduled_at = COALESCE($3, scheduled_at) \
             WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'",
        )
        .bind(id_of(id))
        .bind(id_of(worker))
        .bind(not_before)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "queue row {id} not claimed by {worker}"
            )));
        }
        Ok(())
    }

    async fn row_stats(&self, campaign: CampaignId) -> Result<CampaignRowStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM campaign_queue \
             WHERE campaign_id = $1 GROUP BY status",
        )
        .bind(id_of(campaign))
        .fetch_all(&self.pool)
        .await?;

        let mut stats = CampaignRowStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count = to_u64(row.try_get("total")?);
            stats.total += count;
            match status.as_str() {
                "queued" => stats.queued = count,
                "claimed" => stats.claimed = count,
                "sent" => stats.sent = count,
                "skipped" => stats.skipped = count,
                "failed" => stats.failed = count,
                "dead_letter" => stats.dead_letter = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn queue_depth(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM campaign_queue WHERE status IN ('queued', 'claimed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(row.try_get("depth")?))
    }

    async fn rows_for_campaign(&self, campaign: CampaignId) -> Result<Vec<QueueRow>> {
        let sql =
            format!("SELECT {QUEUE_COLUMNS} FROM campaign_queue WHERE campaign_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(id_of(campaign))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_queue_row).collect()
    }

    async fn clear_variant_overrides(&self, campaign: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE campaign_queue SET \
                 variant_subject = NULL, variant_html = NULL, \
                 variant_text = NULL, variant_from_name = NULL \
             WHERE campaign_id = $1 \
                 AND status NOT IN ('sent', 'skipped', 'dead_letter') \
                 AND (variant_subject IS NOT NULL OR variant_html IS NOT NULL \
                      OR variant_text IS NOT NULL OR variant_from_name IS NOT NULL)",
        )
        .bind(id_of(campaign))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AudienceStore for PgStore {
    async fn list_recipients(&self, list: ListId, cap: Option<u64>) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            "SELECT s.id, s.org_id, s.email, s.name, s.status, s.custom_fields, s.created_at \
             FROM subscribers s \
             JOIN list_subscribers ls ON ls.subscriber_id = s.id \
             WHERE ls.list_id = $1 AND s.status = 'active' \
             ORDER BY s.id \
             LIMIT $2",
        )
        .bind(id_of(list))
        .bind(cap.map_or(i64::MAX, |c| i64::try_from(c).unwrap_or(i64::MAX)))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_subscriber).collect()
    }

    async fn segment_recipients(
        &self,
        segment_id: SegmentId,
        cap: Option<u64>,
    ) -> Result<Vec<Subscriber>> {
        let segment_row = sqlx::query("SELECT org_id, conditions FROM segments WHERE id = $1")
            .bind(id_of(segment_id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("segment {segment_id}")))?;

        let org_id: String = segment_row.try_get("org_id")?;
        let conditions: serde_json::Value = segment_row.try_get("conditions")?;
        let conditions: Vec<cadence_common::audience::SegmentCondition> =
            serde_json::from_value(conditions).map_err(|e| StoreError::Decode(e.to_string()))?;

        // Compile the conjunction; parameters start after org_id ($1) and
        // the trailing LIMIT.
        let mut clauses = vec!["org_id = $1".to_string(), "status = 'active'".to_string()];
        let mut values = Vec::new();
        let mut placeholder = 2;
        for condition in &conditions {
            let (sql, value) = segment::condition_sql(condition, placeholder);
            clauses.push(sql);
            if let Some(value) = value {
                values.push(value);
                placeholder += 1;
            }
        }

        let sql = format!(
            "SELECT id, org_id, email, name, status, custom_fields, created_at \
             FROM subscribers WHERE {} ORDER BY id LIMIT ${placeholder}",
            clauses.join(" AND ")
        );

        let mut query = sqlx::query(&sql).bind(org_id);
        for value in values {
            query = query.bind(value);
        }
        query = query.bind(cap.map_or(i64::MAX, |c| i64::try_from(c).unwrap_or(i64::MAX)));

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(map_subscriber).collect()
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn profiles_for(&self, ids: &[SubscriberId]) -> Result<Vec<RecipientProfile>> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let rows = sqlx::query(
            "SELECT subscriber_id, engagement_score, total_sends, total_opens, \
                 engagement_trend, open_rate, consecutive_bounces, has_complained, \
                 mailbox_state, send_suspended_until, last_open_at, first_seen_at, \
                 optimal_hour, optimal_hour_confidence, image_preference, \
                 personalization_preference, has_purchased \
             FROM recipient_profiles WHERE subscriber_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_profile).collect()
    }

    async fn audience_best_hour(&self, org: OrgId) -> Result<Option<u8>> {
        let row = sqlx::query(
            "SELECT p.optimal_hour AS hour FROM recipient_profiles p \
             JOIN subscribers s ON s.id = p.subscriber_id \
             WHERE s.org_id = $1 AND p.optimal_hour IS NOT NULL \
                 AND p.optimal_hour_confidence >= 0.5 \
             GROUP BY p.optimal_hour ORDER BY COUNT(*) DESC LIMIT 1",
        )
        .bind(id_of(org))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.try_get::<i32, _>("hour"))
            .transpose()?
            .and_then(|h| u8::try_from(h).ok()))
    }
}

#[async_trait]
impl SuppressionStore for PgStore {
    async fn load_global_suppression(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT address FROM global_suppression")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("address").map_err(StoreError::from))
            .collect()
    }

    async fn any_list_contains(
        &self,
        lists: &[SuppressionListId],
        md5_hash: &str,
    ) -> Result<bool> {
        if lists.is_empty() {
            return Ok(false);
        }
        let lists: Vec<String> = lists.iter().map(|id| id.to_string()).collect();
        let row = sqlx::query(
            "SELECT EXISTS( \
                 SELECT 1 FROM suppression_list_entries \
                 WHERE list_id = ANY($1) AND md5_hash = $2 \
             ) AS found",
        )
        .bind(lists)
        .bind(md5_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }
}

#[async_trait]
impl DecisionStore for PgStore {
    async fn insert_decisions(&self, decisions: &[AgentDecision]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for decision in decisions {
            sqlx::query(
                "INSERT INTO agent_send_decisions \
                     (campaign_id, subscriber_id, classification, content_strategy, \
                      priority, optimal_hour, executed, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (campaign_id, subscriber_id) DO UPDATE SET \
                     classification = EXCLUDED.classification, \
                     content_strategy = EXCLUDED.content_strategy, \
                     priority = EXCLUDED.priority, \
                     optimal_hour = EXCLUDED.optimal_hour",
            )
            .bind(id_of(decision.campaign_id))
            .bind(id_of(decision.subscriber_id))
            .bind(decision.classification.as_str())
            .bind(strategy_str(decision.content_strategy))
            .bind(i32::from(decision.priority))
            .bind(i32::from(decision.optimal_hour))
            .bind(decision.executed)
            .bind(decision.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_decision_executed(
        &self,
        campaign: CampaignId,
        subscriber: SubscriberId,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agent_send_decisions SET executed = TRUE \
             WHERE campaign_id = $1 AND subscriber_id = $2",
        )
        .bind(id_of(campaign))
        .bind(id_of(subscriber))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn decision(
        &self,
        campaign: CampaignId,
        subscriber: SubscriberId,
    ) -> Result<Option<AgentDecision>> {
        let row = sqlx::query(
            "SELECT campaign_id, subscriber_id, classification, content_strategy, \
                 priority, optimal_hour, executed, created_at \
             FROM agent_send_decisions WHERE campaign_id = $1 AND subscriber_id = $2",
        )
        .bind(id_of(campaign))
        .bind(id_of(subscriber))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let classification_raw: String = row.try_get("classification")?;
            let classification = match classification_raw.as_str() {
                "send_now" => Classification::SendNow,
                "send_later" => Classification::SendLater,
                "defer" => Classification::Defer,
                "suppress" => Classification::Suppress,
                other => {
                    return Err(StoreError::Decode(format!("classification {other}")));
                }
            };
            let strategy_raw: String = row.try_get("content_strategy")?;
            Ok(AgentDecision {
                campaign_id: parse_id(&row.try_get::<String, _>("campaign_id")?, "campaign")?,
                subscriber_id: parse_id(
                    &row.try_get::<String, _>("subscriber_id")?,
                    "subscriber",
                )?,
                classification,
                content_strategy: strategy_from_str(&strategy_raw),
                priority: u8::try_from(row.try_get::<i32, _>("priority")?).unwrap_or(0),
                optimal_hour: u8::try_from(row.try_get::<i32, _>("optimal_hour")?).unwrap_or(10),
                executed: row.try_get("executed")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }
}

const fn strategy_str(strategy: ContentStrategy) -> &'static str {
    match strategy {
        ContentStrategy::TextPersonalized => "text_personalized",
        ContentStrategy::TextGeneric => "text_generic",
        ContentStrategy::ImagePersonalized => "image_personalized",
        ContentStrategy::ImageGeneric => "image_generic",
    }
}

fn strategy_from_str(raw: &str) -> ContentStrategy {
    match raw {
        "text_personalized" => ContentStrategy::TextPersonalized,
        "image_personalized" => ContentStrategy::ImagePersonalized,
        "image_generic" => ContentStrategy::ImageGeneric,
        _ => ContentStrategy::TextGeneric,
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn record_event(&self, event: &TrackingEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO tracking_events \
                 (campaign_id, subscriber_id, kind, message_id, occurred_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id_of(event.campaign_id))
        .bind(id_of(event.subscriber_id))
        .bind(event.kind.as_str())
        .bind(event.message_id.as_deref())
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn campaign_counters(&self, campaign: CampaignId) -> Result<CampaignCounters> {
        let rows = sqlx::query(
            "SELECT kind, COUNT(*) AS total, COUNT(DISTINCT subscriber_id) AS uniq \
             FROM tracking_events WHERE campaign_id = $1 GROUP BY kind",
        )
        .bind(id_of(campaign))
        .fetch_all(&self.pool)
        .await?;

        let mut counters = CampaignCounters::default();
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let total = to_u64(row.try_get("total")?);
            let uniq = to_u64(row.try_get("uniq")?);
            match kind.as_str() {
                "sent" => counters.sent = total,
                "delivered" => counters.delivered = total,
                "open" => {
                    counters.opens = total;
                    counters.unique_opens = uniq;
                }
                "click" => {
                    counters.clicks = total;
                    counters.unique_clicks = uniq;
                }
                "bounce" => counters.bounces = total,
                "complaint" => counters.complaints = total,
                "unsubscribe" => counters.unsubscribes = total,
                _ => {}
            }
        }
        Ok(counters)
    }

    async fn append_metrics_row(&self, row: &RealtimeMetricsRow) -> Result<()> {
        let cumulative = serde_json::to_value(row.cumulative)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let delta =
            serde_json::to_value(row.delta).map_err(|e| StoreError::Decode(e.to_string()))?;
        sqlx::query(
            "INSERT INTO campaign_realtime_metrics (campaign_id, cumulative, delta, recorded_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id_of(row.campaign_id))
        .bind(cumulative)
        .bind(delta)
        .bind(row.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn metrics_rows_since(
        &self,
        campaign: CampaignId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RealtimeMetricsRow>> {
        let rows = sqlx::query(
            "SELECT campaign_id, cumulative, delta, recorded_at \
             FROM campaign_realtime_metrics \
             WHERE campaign_id = $1 AND recorded_at >= $2 ORDER BY recorded_at",
        )
        .bind(id_of(campaign))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let cumulative: serde_json::Value = row.try_get("cumulative")?;
                let delta: serde_json::Value = row.try_get("delta")?;
                Ok(RealtimeMetricsRow {
                    campaign_id: parse_id(&row.try_get::<String, _>("campaign_id")?, "campaign")?,
                    cumulative: serde_json::from_value(cumulative)
                        .map_err(|e| StoreError::Decode(e.to_string()))?,
                    delta: serde_json::from_value(delta)
                        .map_err(|e| StoreError::Decode(e.to_string()))?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn insert_alert(&self, alert: &CampaignAlert) -> Result<()> {
        let severity = match alert.severity {
            cadence_common::events::AlertSeverity::Info => "info",
            cadence_common::events::AlertSeverity::Warning => "warning",
            cadence_common::events::AlertSeverity::Critical => "critical",
        };
        sqlx::query(
            "INSERT INTO campaign_alerts (org_id, campaign_id, severity, kind, message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id_of(alert.org_id))
        .bind(id_of(alert.campaign_id))
        .bind(severity)
        .bind(&alert.kind)
        .bind(&alert.message)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ThrottleConfigStore for PgStore {
    async fn throttle_config(&self, org: OrgId) -> Result<Option<OrgThrottleConfig>> {
        let row = sqlx::query(
            "SELECT org_id, global_hour, global_day, isp_rules, domain_rules, auto_adjust, \
                 updated_at \
             FROM throttle_configs WHERE org_id = $1",
        )
        .bind(id_of(org))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let isp_rules: serde_json::Value = row.try_get("isp_rules")?;
            let domain_rules: serde_json::Value = row.try_get("domain_rules")?;
            let global_hour: Option<i64> = row.try_get("global_hour")?;
            let global_day: Option<i64> = row.try_get("global_day")?;
            Ok(OrgThrottleConfig {
                org_id: parse_id(&row.try_get::<String, _>("org_id")?, "org")?,
                global_hour: global_hour.map(to_u64),
                global_day: global_day.map(to_u64),
                isp_rules: serde_json::from_value(isp_rules)
                    .map_err(|e| StoreError::Decode(e.to_string()))?,
                domain_rules: serde_json::from_value(domain_rules)
                    .map_err(|e| StoreError::Decode(e.to_string()))?,
                auto_adjust: row.try_get("auto_adjust")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn put_throttle_config(&self, config: &OrgThrottleConfig) -> Result<()> {
        let isp_rules = serde_json::to_value(&config.isp_rules)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let domain_rules = serde_json::to_value(&config.domain_rules)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        sqlx::query(
            "INSERT INTO throttle_configs \
                 (org_id, global_hour, global_day, isp_rules, domain_rules, auto_adjust, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (org_id) DO UPDATE SET \
                 global_hour = EXCLUDED.global_hour, \
                 global_day = EXCLUDED.global_day, \
                 isp_rules = EXCLUDED.isp_rules, \
                 domain_rules = EXCLUDED.domain_rules, \
                 auto_adjust = EXCLUDED.auto_adjust, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(id_of(config.org_id))
        .bind(config.global_hour.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(config.global_day.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(isp_rules)
        .bind(domain_rules)
        .bind(config.auto_adjust)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_daily_stat(
        &self,
        org: OrgId,
        domain: &str,
        day: NaiveDate,
        sent: u64,
        bounced: u64,
        complained: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO throttle_daily_stats (org_id, domain, day, sent, bounced, complained) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (org_id, domain, day) DO UPDATE SET \
                 sent = throttle_daily_stats.sent + EXCLUDED.sent, \
                 bounced = throttle_daily_stats.bounced + EXCLUDED.bounced, \
                 complained = throttle_daily_stats.complained + EXCLUDED.complained",
        )
        .bind(id_of(org))
        .bind(domain)
        .bind(day)
        .bind(i64::try_from(sent).unwrap_or(i64::MAX))
        .bind(i64::try_from(bounced).unwrap_or(i64::MAX))
        .bind(i64::try_from(complained).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_stats_since(
        &self,
        org: OrgId,
        domain: &str,
        since: NaiveDate,
    ) -> Result<Vec<DailyDomainStats>> {
        let rows = sqlx::query(
            "SELECT day, sent, bounced, complained FROM throttle_daily_stats \
             WHERE org_id = $1 AND domain = $2 AND day >= $3 ORDER BY day",
        )
        .bind(id_of(org))
        .bind(domain)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DailyDomainStats {
                    day: row.try_get("day")?,
                    sent: to_u64(row.try_get("sent")?),
                    bounced: to_u64(row.try_get("bounced")?),
                    complained: to_u64(row.try_get("complained")?),
                })
            })
            .collect()
    }
}

#[async_trait]
impl AbTestStore for PgStore {
    async fn ab_test(&self, campaign: CampaignId) -> Result<Option<AbTest>> {
        let row = sqlx::query(
            "SELECT campaign_id, target_metric, min_sample_size, confidence_threshold, decided_at \
             FROM ab_tests WHERE campaign_id = $1",
        )
        .bind(id_of(campaign))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let metric_raw: String = row.try_get("target_metric")?;
            let target_metric = match metric_raw.as_str() {
                "clicks" => TargetMetric::Clicks,
                "conversions" => TargetMetric::Conversions,
                _ => TargetMetric::Opens,
            };
            Ok(AbTest {
                campaign_id: parse_id(&row.try_get::<String, _>("campaign_id")?, "campaign")?,
                target_metric,
                min_sample_size: to_u64(row.try_get("min_sample_size")?),
                confidence_threshold: row.try_get("confidence_threshold")?,
                decided_at: row.try_get("decided_at")?,
            })
        })
        .transpose()
    }

    async fn variants(&self, campaign: CampaignId) -> Result<Vec<AbVariant>> {
        let rows = sqlx::query(
            "SELECT id, campaign_id, name, subject, from_name, html_body, text_body, \
                 is_control, state, assigned, opens, clicks, conversions \
             FROM ab_variants WHERE campaign_id = $1 ORDER BY id",
        )
        .bind(id_of(campaign))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_variant).collect()
    }

    async fn record_assignment(&self, variant: VariantId, subscriber: SubscriberId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO ab_variant_assignments (variant_id, subscriber_id, assigned_at) \
             VALUES ($1, $2, NOW())",
        )
        .bind(id_of(variant))
        .bind(id_of(subscriber))
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE ab_variants SET assigned = assigned + 1 WHERE id = $1")
            .bind(id_of(variant))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_variant_state(&self, variant: VariantId, state: VariantState) -> Result<()> {
        let state = match state {
            VariantState::Active => "active",
            VariantState::Winner => "winner",
            VariantState::Loser => "loser",
            VariantState::Eliminated => "eliminated",
        };
        sqlx::query("UPDATE ab_variants SET state = $2 WHERE id = $1")
            .bind(id_of(variant))
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_test_decided(&self, campaign: CampaignId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE ab_tests SET decided_at = $2 WHERE campaign_id = $1")
            .bind(id_of(campaign))
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_variant_stats(
        &self,
        variant: VariantId,
        opens: u64,
        clicks: u64,
        conversions: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE ab_variants SET opens = opens + $2, clicks = clicks + $3, \
                 conversions = conversions + $4 \
             WHERE id = $1",
        )
        .bind(id_of(variant))
        .bind(i64::try_from(opens).unwrap_or(0))
        .bind(i64::try_from(clicks).unwrap_or(0))
        .bind(i64::try_from(conversions).unwrap_or(0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerStore for PgStore {
    async fn register_worker(&self, record: &WorkerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, hostname, started_at, heartbeat_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET heartbeat_at = EXCLUDED.heartbeat_at",
        )
        .bind(id_of(record.id))
        .bind(&record.hostname)
        .bind(record.started_at)
        .bind(record.heartbeat_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn worker_heartbeat(&self, id: WorkerId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE workers SET heartbeat_at = $2 WHERE id = $1")
            .bind(id_of(id))
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deregister_worker(&self, id: WorkerId) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id_of(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MaintenanceStore for PgStore {
    async fn delete_terminal_queue_rows(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM campaign_queue WHERE ctid IN ( \
                 SELECT ctid FROM campaign_queue \
                 WHERE status IN ('sent', 'skipped') AND created_at < $1 LIMIT $2 \
             )",
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_dead_letter_rows(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM campaign_queue WHERE ctid IN ( \
                 SELECT ctid FROM campaign_queue \
                 WHERE status = 'dead_letter' AND created_at < $1 LIMIT $2 \
             )",
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_executed_decisions(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM agent_send_decisions WHERE ctid IN ( \
                 SELECT ctid FROM agent_send_decisions \
                 WHERE executed AND created_at < $1 LIMIT $2 \
             )",
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_tracking_events(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM tracking_events WHERE ctid IN ( \
                 SELECT ctid FROM tracking_events WHERE occurred_at < $1 LIMIT $2 \
             )",
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AdvisoryLocker for PgStore {
    async fn try_advisory_lock(&self, name: &str) -> std::result::Result<bool, KvError> {
        let mut held = self.advisory.lock().await;
        if held.contains_key(name) {
            return Ok(false);
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind(Self::advisory_key(name))
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        let locked: bool = row
            .try_get("locked")
            .map_err(|e| KvError::Backend(e.to_string()))?;

        if locked {
            held.insert(name.to_string(), conn);
        }
        Ok(locked)
    }

    async fn release_advisory_lock(&self, name: &str) -> std::result::Result<(), KvError> {
        let conn = self.advisory.lock().await.remove(name);
        if let Some(mut conn) = conn {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(Self::advisory_key(name))
                .execute(&mut *conn)
                .await
                .map_err(|e| KvError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}
