//! Behavior tests for the in-memory store backend.
//!
//! These pin the semantics the delivery pipeline depends on: idempotent
//! enqueue, claim ordering and ownership, stale-claim recovery, the retry
//! bound, and campaign state transitions.

use chrono::{Duration, Utc};

use cadence_common::{
    EmailAddress,
    audience::{RecipientProfile, Subscriber, SubscriberStatus},
    campaign::{Audience, Campaign, CampaignState, ThrottleSpeed},
    events::{TrackingEvent, TrackingEventKind},
    ids::{CampaignId, ListId, OrgId, QueueRowId, SubscriberId, WorkerId},
    queue::QueueStatus,
};
use cadence_store::{
    CampaignStore, ContentPatch, EventStore, MemoryStore, NewQueueRow, ProfileStore, QueueStore,
    StoreError,
};

fn campaign(org: OrgId, state: CampaignState, scheduled_in: Duration) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: CampaignId::generate(),
        org_id: org,
        name: "launch".to_string(),
        subject: "Hello {{ name }}".to_string(),
        html_body: "<html><body>Hi</body></html>".to_string(),
        text_body: "Hi".to_string(),
        preheader: None,
        from_name: "Acme".to_string(),
        from_email: "news@acme.example".to_string(),
        reply_to: None,
        audience: Audience::List(ListId::generate()),
        sending_profile_id: None,
        esp_quotas: Vec::new(),
        suppression_list_ids: Vec::new(),
        max_recipients: None,
        scheduled_at: now + scheduled_in,
        throttle_speed: ThrottleSpeed::Moderate,
        ai_send_time: false,
        auto_optimize: false,
        agent_enabled: false,
        state,
        sent_count: 0,
        total_recipients: 0,
        completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn row(campaign_id: CampaignId, subscriber: SubscriberId, priority: i32) -> NewQueueRow {
    NewQueueRow {
        id: QueueRowId::generate(),
        campaign_id,
        subscriber_id: subscriber,
        recipient: EmailAddress::parse("user@example.com").unwrap(),
        substitutions: None,
        variant_subject: None,
        variant_html: None,
        variant_text: None,
        variant_from_name: None,
        priority,
        scheduled_at: Utc::now() - Duration::minutes(1),
    }
}

#[tokio::test]
async fn enqueue_is_idempotent_per_campaign_recipient() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    let subscriber = SubscriberId::generate();

    let first = store
        .enqueue_rows(vec![row(campaign_id, subscriber, 5)])
        .await
        .unwrap();
    let second = store
        .enqueue_rows(vec![row(campaign_id, subscriber, 5)])
        .await
        .unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 0, "duplicate (campaign, recipient) must be dropped");
    assert_eq!(store.rows_for_campaign(campaign_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn claim_orders_by_priority_then_schedule() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    let now = Utc::now();

    let mut low = row(campaign_id, SubscriberId::generate(), 3);
    low.scheduled_at = now - Duration::minutes(10);
    let mut high = row(campaign_id, SubscriberId::generate(), 10);
    high.scheduled_at = now - Duration::minutes(1);
    let mut future = row(campaign_id, SubscriberId::generate(), 10);
    future.scheduled_at = now + Duration::hours(1);

    store
        .enqueue_rows(vec![low.clone(), high.clone(), future])
        .await
        .unwrap();

    let worker = WorkerId::generate();
    let claimed = store.claim_batch(worker, 10, now).await.unwrap();

    // The due high-priority row wins even though the low-priority row has
    // been waiting longer; the future row is not claimable at all.
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].id, high.id);
    assert_eq!(claimed[1].id, low.id);
    assert!(claimed.iter().all(|r| r.status == QueueStatus::Claimed));
}

#[tokio::test]
async fn claimed_rows_are_invisible_to_other_workers() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    store
        .enqueue_rows(vec![row(campaign_id, SubscriberId::generate(), 5)])
        .await
        .unwrap();

    let now = Utc::now();
    let first = store
        .claim_batch(WorkerId::generate(), 10, now)
        .await
        .unwrap();
    let second = store
        .claim_batch(WorkerId::generate(), 10, now)
        .await
        .unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

#[tokio::test]
async fn expired_claims_become_reclaimable() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    store
        .enqueue_rows(vec![row(campaign_id, SubscriberId::generate(), 5)])
        .await
        .unwrap();

    let dead_worker = WorkerId::generate();
    let claim_time = Utc::now();
    assert_eq!(
        store
            .claim_batch(dead_worker, 10, claim_time)
            .await
            .unwrap()
            .len(),
        1
    );

    // Within the expiry window nothing is released.
    let released = store
        .release_expired_claims(claim_time + Duration::minutes(1), Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(released, 0);

    // Past the expiry the row returns to queued and another worker claims it.
    let released = store
        .release_expired_claims(claim_time + Duration::minutes(11), Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(released, 1);

    let reclaimed = store
        .claim_batch(WorkerId::generate(), 10, claim_time + Duration::minutes(11))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn retry_bound_promotes_to_dead_letter() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    store
        .enqueue_rows(vec![row(campaign_id, SubscriberId::generate(), 5)])
        .await
        .unwrap();

    let max_retries = 3;
    let mut statuses = Vec::new();

    for _ in 0..max_retries {
        let worker = WorkerId::generate();
        let claimed = store.claim_batch(worker, 1, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1, "failed rows must stay claimable");
        let status = store
            .mark_failed(claimed[0].id, worker, "connection reset", max_retries)
            .await
            .unwrap();
        statuses.push(status);
    }

    assert_eq!(
        statuses,
        vec![
            QueueStatus::Failed,
            QueueStatus::Failed,
            QueueStatus::DeadLetter
        ]
    );

    // Dead-letter rows are terminal: no further claims.
    assert!(
        store
            .claim_batch(WorkerId::generate(), 10, Utc::now())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn foreign_workers_cannot_update_claimed_rows() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    store
        .enqueue_rows(vec![row(campaign_id, SubscriberId::generate(), 5)])
        .await
        .unwrap();

    let owner = WorkerId::generate();
    let claimed = store.claim_batch(owner, 1, Utc::now()).await.unwrap();
    let id = claimed[0].id;

    let intruder = WorkerId::generate();
    assert!(matches!(
        store.mark_sent(id, intruder, "msg-1").await,
        Err(StoreError::Conflict(_))
    ));

    // The rightful owner still can.
    store.mark_sent(id, owner, "msg-1").await.unwrap();
    let rows = store.rows_for_campaign(campaign_id).await.unwrap();
    assert_eq!(rows[0].status, QueueStatus::Sent);
    assert_eq!(rows[0].message_id.as_deref(), Some("msg-1"));
}

#[tokio::test]
async fn rate_denied_restore_does_not_count_an_attempt() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    store
        .enqueue_rows(vec![row(campaign_id, SubscriberId::generate(), 5)])
        .await
        .unwrap();

    let worker = WorkerId::generate();
    let claimed = store.claim_batch(worker, 1, Utc::now()).await.unwrap();
    store
        .restore_queued(claimed[0].id, worker, None)
        .await
        .unwrap();

    let rows = store.rows_for_campaign(campaign_id).await.unwrap();
    assert_eq!(rows[0].status, QueueStatus::Queued);
    assert_eq!(rows[0].attempts, 0);
}

#[tokio::test]
async fn conditional_transition_loses_gracefully() {
    let store = MemoryStore::new();
    let c = campaign(OrgId::generate(), CampaignState::Preparing, Duration::zero());
    let id = c.id;
    store.insert_campaign(c);

    let won = store
        .try_transition(
            id,
            &[CampaignState::Scheduled, CampaignState::Preparing],
            CampaignState::Sending,
        )
        .await
        .unwrap();
    let lost = store
        .try_transition(
            id,
            &[CampaignState::Scheduled, CampaignState::Preparing],
            CampaignState::Sending,
        )
        .await
        .unwrap();

    assert!(won);
    assert!(!lost, "second scheduler must observe zero rows affected");
}

#[tokio::test]
async fn content_edits_are_rejected_inside_the_edit_lock() {
    let store = MemoryStore::new();
    // Scheduled 5 minutes out, edit lock 15 minutes: locked.
    let c = campaign(OrgId::generate(), CampaignState::Scheduled, Duration::minutes(5));
    let id = c.id;
    store.insert_campaign(c);

    let patch = ContentPatch {
        subject: Some("New subject".to_string()),
        ..ContentPatch::default()
    };
    let result = store
        .update_campaign_content(id, patch.clone(), Utc::now(), Duration::minutes(15))
        .await;
    assert!(matches!(
        result,
        Err(StoreError::State(
            cadence_common::error::StateError::EditLocked { .. }
        ))
    ));

    // Outside the lock the same patch lands.
    let c2 = campaign(OrgId::generate(), CampaignState::Scheduled, Duration::hours(2));
    let id2 = c2.id;
    store.insert_campaign(c2);
    store
        .update_campaign_content(id2, patch, Utc::now(), Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(store.campaign(id2).await.unwrap().subject, "New subject");
}

#[tokio::test]
async fn cancel_works_from_any_non_terminal_state() {
    let store = MemoryStore::new();
    for state in [
        CampaignState::Draft,
        CampaignState::Scheduled,
        CampaignState::Sending,
        CampaignState::Paused,
    ] {
        let c = campaign(OrgId::generate(), state, Duration::hours(1));
        let id = c.id;
        store.insert_campaign(c);
        assert!(store.cancel_campaign(id).await.unwrap(), "{state:?}");
    }

    let done = campaign(OrgId::generate(), CampaignState::Completed, Duration::zero());
    let done_id = done.id;
    store.insert_campaign(done);
    assert!(!store.cancel_campaign(done_id).await.unwrap());
}

#[tokio::test]
async fn promotion_closes_the_edit_window() {
    let store = MemoryStore::new();
    let soon = campaign(OrgId::generate(), CampaignState::Scheduled, Duration::minutes(5));
    let soon_id = soon.id;
    let later = campaign(OrgId::generate(), CampaignState::Scheduled, Duration::hours(3));
    let later_id = later.id;
    store.insert_campaign(soon);
    store.insert_campaign(later);

    let promoted = store
        .promote_due_campaigns(Utc::now() + Duration::minutes(15))
        .await
        .unwrap();

    assert_eq!(promoted, 1);
    assert_eq!(
        store.campaign(soon_id).await.unwrap().state,
        CampaignState::Preparing
    );
    assert_eq!(
        store.campaign(later_id).await.unwrap().state,
        CampaignState::Scheduled
    );
}

#[tokio::test]
async fn queue_depth_counts_only_live_rows() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    let rows: Vec<NewQueueRow> = (0..3)
        .map(|_| row(campaign_id, SubscriberId::generate(), 5))
        .collect();
    store.enqueue_rows(rows).await.unwrap();

    assert_eq!(store.queue_depth().await.unwrap(), 3);

    let worker = WorkerId::generate();
    let claimed = store.claim_batch(worker, 1, Utc::now()).await.unwrap();
    assert_eq!(store.queue_depth().await.unwrap(), 3, "claimed still counts");

    store.mark_sent(claimed[0].id, worker, "m").await.unwrap();
    assert_eq!(store.queue_depth().await.unwrap(), 2);
}

#[tokio::test]
async fn campaign_counters_aggregate_events() {
    let store = MemoryStore::new();
    let campaign_id = CampaignId::generate();
    let opener = SubscriberId::generate();

    for kind in [
        TrackingEventKind::Sent,
        TrackingEventKind::Sent,
        TrackingEventKind::Open,
        TrackingEventKind::Open,
        TrackingEventKind::Bounce,
    ] {
        store
            .record_event(&TrackingEvent {
                campaign_id,
                subscriber_id: opener,
                kind,
                message_id: None,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let counters = store.campaign_counters(campaign_id).await.unwrap();
    assert_eq!(counters.sent, 2);
    assert_eq!(counters.opens, 2);
    assert_eq!(counters.unique_opens, 1, "same subscriber opened twice");
    assert_eq!(counters.bounces, 1);
}

#[tokio::test]
async fn audience_best_hour_requires_confidence() {
    let store = MemoryStore::new();
    let org = OrgId::generate();

    for (hour, confidence) in [(9, 0.9), (9, 0.8), (14, 0.9), (21, 0.2)] {
        let subscriber = Subscriber {
            id: SubscriberId::generate(),
            org_id: org,
            email: EmailAddress::parse(&format!("u{hour}{confidence}@example.com")).unwrap(),
            name: None,
            status: SubscriberStatus::Active,
            list_ids: Vec::new(),
            custom_fields: serde_json::Map::new(),
            created_at: Utc::now(),
        };
        let profile = RecipientProfile {
            subscriber_id: subscriber.id,
            engagement_score: 0.5,
            total_sends: 10,
            total_opens: 5,
            engagement_trend: 0.0,
            open_rate: 0.5,
            consecutive_bounces: 0,
            has_complained: false,
            mailbox_state: cadence_common::audience::MailboxState::Healthy,
            send_suspended_until: None,
            last_open_at: None,
            first_seen_at: None,
            optimal_hour: Some(hour),
            optimal_hour_confidence: confidence,
            image_preference: 0.5,
            personalization_preference: 0.5,
            has_purchased: false,
        };
        store.insert_subscriber(subscriber);
        store.insert_profile(profile);
    }

    // Hour 9 has two confident votes; the 0.2-confidence vote for 21 is
    // ignored entirely.
    assert_eq!(store.audience_best_hour(org).await.unwrap(), Some(9));
}
