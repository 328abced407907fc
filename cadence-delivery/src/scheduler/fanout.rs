//! Recipient fan-out: one campaign into queue rows.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use tracing::debug;

use cadence_common::{
    abtest::{AbVariant, VariantState},
    audience::Subscriber,
    campaign::Campaign,
    ids::QueueRowId,
};
use cadence_store::{AbTestStore, NewQueueRow, ProfileStore, QueueStore, Store, SuppressionStore};

use crate::{error::DeliveryError, scheduler::sendtime, suppression::SuppressionHub};

/// Rows inserted per store round-trip.
const ENQUEUE_CHUNK: usize = 1_000;

/// What one materialization produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutOutcome {
    pub enqueued: u64,
    pub suppressed: u64,
}

fn substitutions_for(subscriber: &Subscriber) -> serde_json::Map<String, serde_json::Value> {
    let mut map = subscriber.custom_fields.clone();
    map.insert(
        "name".to_string(),
        serde_json::Value::String(subscriber.name.clone().unwrap_or_default()),
    );
    map.insert(
        "email".to_string(),
        serde_json::Value::String(subscriber.email.as_str().to_string()),
    );
    map
}

/// Fan a campaign out into queue rows.
///
/// Excludes globally and list-suppressed recipients, assigns A/B variants
/// round-robin, resolves per-recipient send times, and enqueues in chunks.
/// The store's uniqueness guard makes re-runs idempotent.
///
/// # Errors
///
/// Returns store errors; a partially fanned-out campaign is safe to retry
/// thanks to the idempotent enqueue.
pub async fn materialize(
    store: &dyn Store,
    hub: &SuppressionHub,
    campaign: &Campaign,
    recipients: &[Subscriber],
    now: DateTime<Utc>,
) -> Result<FanoutOutcome, DeliveryError> {
    // Round-robin pool: every still-active variant.
    let variants: Vec<AbVariant> = store
        .variants(campaign.id)
        .await?
        .into_iter()
        .filter(|v| v.state == VariantState::Active)
        .collect();

    // Per-recipient optimal hours only matter when the campaign opted in.
    let (profiles, audience_best_hour) = if campaign.ai_send_time {
        let ids: Vec<_> = recipients.iter().map(|s| s.id).collect();
        let profiles: AHashMap<_, _> = store
            .profiles_for(&ids)
            .await?
            .into_iter()
            .map(|p| (p.subscriber_id, p))
            .collect();
        let best = store.audience_best_hour(campaign.org_id).await?;
        (profiles, best)
    } else {
        (AHashMap::new(), None)
    };

    let priority = campaign.throttle_speed.priority();
    let mut outcome = FanoutOutcome::default();
    let mut assigned_index = 0_usize;
    let mut chunk: Vec<NewQueueRow> = Vec::with_capacity(ENQUEUE_CHUNK);

    for subscriber in recipients {
        if hub.is_suppressed(&subscriber.email) {
            outcome.suppressed += 1;
            continue;
        }
        if !campaign.suppression_list_ids.is_empty()
            && store
                .any_list_contains(&campaign.suppression_list_ids, &subscriber.email.md5_hash())
                .await?
        {
            outcome.suppressed += 1;
            continue;
        }

        let variant = if variants.is_empty() {
            None
        } else {
            let variant = &variants[assigned_index % variants.len()];
            assigned_index += 1;
            store.record_assignment(variant.id, subscriber.id).await?;
            Some(variant)
        };

        let scheduled_at = sendtime::resolve_send_time(
            campaign.scheduled_at,
            campaign.ai_send_time,
            None,
            profiles.get(&subscriber.id),
            audience_best_hour,
            now,
        );

        chunk.push(NewQueueRow {
            id: QueueRowId::generate(),
            campaign_id: campaign.id,
            subscriber_id: subscriber.id,
            recipient: subscriber.email.clone(),
            substitutions: Some(substitutions_for(subscriber)),
            variant_subject: variant.and_then(|v| v.subject.clone()),
            variant_html: variant.and_then(|v| v.html_body.clone()),
            variant_text: variant.and_then(|v| v.text_body.clone()),
            variant_from_name: variant.and_then(|v| v.from_name.clone()),
            priority,
            scheduled_at,
        });

        if chunk.len() >= ENQUEUE_CHUNK {
            outcome.enqueued += store.enqueue_rows(std::mem::take(&mut chunk)).await?;
        }
    }

    if !chunk.is_empty() {
        outcome.enqueued += store.enqueue_rows(chunk).await?;
    }

    debug!(
        campaign = %campaign.id,
        enqueued = outcome.enqueued,
        suppressed = outcome.suppressed,
        "campaign fanned out"
    );
    Ok(outcome)
}
