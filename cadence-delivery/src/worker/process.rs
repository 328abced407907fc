//! Per-row send processing.
//!
//! The pipeline for one claimed row: resolve cached content, consult the
//! agent decision, run the suppression checks, pass the gates, render,
//! inject tracking, send, and record the outcome. Policy rejects skip;
//! gate denials requeue without consuming an attempt; transient failures
//! retry; permanent ones dead-letter.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use cadence_common::{
    decision::{Classification, SlimDecision},
    events::{TrackingEvent, TrackingEventKind},
    ids::{CampaignId, OrgId, WorkerId},
    queue::{QueueRow, QueueStatus, SkipReason},
    sendpath,
};
use cadence_esp::{EspAdapter, OutboundMessage, SendOutcome};
use cadence_kv::{CounterOutcome, CounterSpec};
use cadence_store::{CampaignStore, DecisionStore, EventStore, QueueStore, StoreError, SuppressionStore};
use cadence_throttle::RateDecision;
use cadence_tracking::{TrackingLinks, inject_tracking, substitute_merge_fields, tracking_headers};

use crate::{agent, scheduler, worker::WorkerContext};

/// What preparation decided for a row.
pub(crate) enum Prepared {
    /// Rendered and gated; ready for the adapter.
    Ready {
        message: OutboundMessage,
        adapter: Arc<dyn EspAdapter>,
        org: OrgId,
    },
    /// The row already reached a disposition (skipped, requeued, failed).
    Handled,
}

/// Process one claimed row end to end.
pub(crate) async fn process_row(
    ctx: &WorkerContext,
    worker: WorkerId,
    row: &QueueRow,
    now: DateTime<Utc>,
) {
    match prepare_row(ctx, worker, row, now).await {
        Prepared::Handled => {}
        Prepared::Ready {
            message,
            adapter,
            org,
        } => {
            let outcome = adapter.send(&message).await;
            finalize(ctx, worker, row, org, outcome).await;
        }
    }
}

/// Run every pre-send step for a row.
#[allow(clippy::too_many_lines)]
pub(crate) async fn prepare_row(
    ctx: &WorkerContext,
    worker: WorkerId,
    row: &QueueRow,
    now: DateTime<Utc>,
) -> Prepared {
    // Campaign content, cached for ten minutes.
    let resolved = match ctx.content.get_or_load(ctx.store.as_ref(), row.campaign_id).await {
        Ok(resolved) => resolved,
        Err(StoreError::NotFound(reason)) => {
            dead_letter(ctx, worker, row, &reason).await;
            return Prepared::Handled;
        }
        Err(e) => {
            record_failure(ctx, worker, row, &e.to_string()).await;
            return Prepared::Handled;
        }
    };
    let content = &resolved.content;
    let org = content.org_id;

    // Agent decision, when the preprocessor published one. Errors fail
    // open: intelligence never blocks delivery.
    let decision: Option<SlimDecision> = match cadence_kv::get_json(
        ctx.kv.as_ref(),
        &agent::decision_key(row.campaign_id, &row.recipient),
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            sendpath!(level = WARN, row = %row.id, error = %e, "agent decision lookup failed");
            None
        }
    };

    if let Some(decision) = &decision {
        match decision.classification {
            Classification::Suppress => {
                skip(ctx, worker, row, SkipReason::AgentSuppress).await;
                return Prepared::Handled;
            }
            Classification::Defer => {
                skip(ctx, worker, row, SkipReason::AgentDefer).await;
                return Prepared::Handled;
            }
            // send_later is observed but not acted on; the send proceeds.
            Classification::SendLater | Classification::SendNow => {}
        }
    }

    // Named suppression lists, MD5 keyed. Lookup errors fail open.
    if !content.suppression_list_ids.is_empty() {
        match ctx
            .store
            .any_list_contains(&content.suppression_list_ids, &row.recipient.md5_hash())
            .await
        {
            Ok(true) => {
                skip(ctx, worker, row, SkipReason::Suppressed).await;
                return Prepared::Handled;
            }
            Ok(false) => {}
            Err(e) => {
                sendpath!(level = WARN, row = %row.id, error = %e, "suppression list lookup failed");
            }
        }
    }

    // The global hub.
    if ctx.suppression.is_suppressed(&row.recipient) {
        skip(ctx, worker, row, SkipReason::GlobalSuppressed).await;
        return Prepared::Handled;
    }

    // Org throttle envelope.
    match ctx.throttle.check_at(org, &row.recipient, 1, now).await {
        Ok(decision) if !decision.is_allowed() => {
            if let cadence_throttle::ThrottleDecision::Denied { reason } = &decision {
                sendpath!(row = %row.id, reason = %reason, "throttle denied, requeueing");
            }
            requeue(ctx, worker, row, now + chrono::Duration::seconds(60)).await;
            return Prepared::Handled;
        }
        Ok(_) => {}
        Err(e) => {
            sendpath!(level = WARN, row = %row.id, error = %e, "throttle check failed, proceeding");
        }
    }

    // Campaign pacing rate, when the scheduler or auto-tuner set one.
    if let Some(rate) = campaign_rate(ctx, row.campaign_id).await {
        let bucket = now.timestamp().div_euclid(60);
        let counter = CounterSpec::new(
            format!("campaign:{}:minute:{bucket}", row.campaign_id),
            rate,
            Duration::from_secs(120),
        );
        match ctx.kv.check_and_increment(&[counter], 1).await {
            Ok(CounterOutcome::Denied { .. }) => {
                let next_minute = (bucket + 1) * 60;
                let not_before = DateTime::from_timestamp(next_minute, 0).unwrap_or(now);
                requeue(ctx, worker, row, not_before).await;
                return Prepared::Handled;
            }
            Ok(CounterOutcome::Allowed) => {}
            Err(e) => {
                sendpath!(level = WARN, row = %row.id, error = %e, "campaign pacing check failed, proceeding");
            }
        }
    }

    // Per-ESP windows. Daily exhaustion is terminal for this row.
    let esp_type = resolved.pick_esp_type();
    match ctx.rate_limiter.check_and_increment_at(&esp_type, 1, now).await {
        Ok(RateDecision::Allowed) => {}
        Ok(RateDecision::Denied { retry_after }) => {
            let not_before = now
                + chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::seconds(1));
            requeue(ctx, worker, row, not_before).await;
            return Prepared::Handled;
        }
        Ok(RateDecision::DailyExhausted { .. }) => {
            dead_letter(ctx, worker, row, &format!("daily quota exhausted for {esp_type}")).await;
            return Prepared::Handled;
        }
        Err(e) => {
            sendpath!(level = WARN, row = %row.id, error = %e, "rate limiter unavailable, proceeding");
        }
    }

    // Destination-domain fan-out cap.
    match ctx
        .rate_limiter
        .check_domain_at(row.recipient.domain(), 1, now)
        .await
    {
        Ok(RateDecision::Denied { retry_after } | RateDecision::DailyExhausted { retry_after }) => {
            let not_before = now
                + chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::seconds(60));
            requeue(ctx, worker, row, not_before).await;
            return Prepared::Handled;
        }
        Ok(RateDecision::Allowed) => {}
        Err(e) => {
            sendpath!(level = WARN, row = %row.id, error = %e, "domain limiter unavailable, proceeding");
        }
    }

    // Render: variant overrides, merge fields, content strategy.
    let empty = serde_json::Map::new();
    let substitutions = row.substitutions.as_ref().unwrap_or(&empty);

    let subject = substitute_merge_fields(
        row.variant_subject.as_deref().unwrap_or(&content.subject),
        substitutions,
    );
    let html = substitute_merge_fields(
        row.variant_html.as_deref().unwrap_or(&content.html),
        substitutions,
    );
    let text = substitute_merge_fields(
        row.variant_text.as_deref().unwrap_or(&content.text),
        substitutions,
    );
    let from_name = row
        .variant_from_name
        .clone()
        .unwrap_or_else(|| content.from_name.clone());

    // A text strategy suppresses the HTML part; image strategies keep
    // whatever parts exist.
    let keep_html = decision
        .as_ref()
        .is_none_or(|d| d.content_strategy.prefers_html());
    let html = (keep_html && !html.is_empty()).then_some(html);
    let text = (!text.is_empty()).then_some(text);

    // Tracking injection.
    let links = TrackingLinks::new(&ctx.tracking.base_url, &ctx.tracking.signing_key, org);
    let (html, headers) = match html {
        Some(html) => {
            let injected = inject_tracking(
                &html,
                content.preheader.as_deref(),
                &links,
                row.campaign_id,
                row.subscriber_id,
                row.id,
            );
            (Some(injected.html), injected.headers)
        }
        None => (
            None,
            tracking_headers(&links, row.campaign_id, row.subscriber_id, row.id),
        ),
    };

    let Some(adapter) = ctx.esps.get(&esp_type) else {
        dead_letter(ctx, worker, row, &format!("unknown ESP type {esp_type}")).await;
        return Prepared::Handled;
    };

    Prepared::Ready {
        message: OutboundMessage {
            to: row.recipient.clone(),
            to_name: None,
            from_email: content.from_email.clone(),
            from_name,
            reply_to: content.reply_to.clone(),
            subject,
            html,
            text,
            headers,
            campaign_id: row.campaign_id,
            queue_row_id: row.id,
            subscriber_id: row.subscriber_id,
        },
        adapter,
        org,
    }
}

/// Record one send outcome against its row.
pub(crate) async fn finalize(
    ctx: &WorkerContext,
    worker: WorkerId,
    row: &QueueRow,
    org: OrgId,
    outcome: SendOutcome,
) {
    if outcome.success {
        let message_id = outcome
            .provider_message_id
            .unwrap_or_else(|| row.id.to_string());

        if let Err(e) = ctx.store.mark_sent(row.id, worker, &message_id).await {
            sendpath!(level = WARN, row = %row.id, error = %e, "failed to mark row sent");
            return;
        }
        sendpath!(row = %row.id, message_id = %message_id, "row sent");
        if let Err(e) = ctx.store.add_sent_count(row.campaign_id, 1).await {
            sendpath!(level = WARN, row = %row.id, error = %e, "failed to bump campaign sent count");
        }
        if let Err(e) = ctx
            .store
            .record_event(&TrackingEvent {
                campaign_id: row.campaign_id,
                subscriber_id: row.subscriber_id,
                kind: TrackingEventKind::Sent,
                message_id: Some(message_id),
                occurred_at: Utc::now(),
            })
            .await
        {
            sendpath!(level = WARN, row = %row.id, error = %e, "failed to record sent event");
        }
        if let Err(e) = ctx
            .store
            .mark_decision_executed(row.campaign_id, row.subscriber_id)
            .await
        {
            sendpath!(level = WARN, row = %row.id, error = %e, "failed to mark decision executed");
        }
        if let Err(e) = ctx.throttle.record_sent(org, row.recipient.domain()).await {
            sendpath!(level = WARN, row = %row.id, error = %e, "failed to record send in throttle stats");
        }
    } else {
        let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
        record_failure(ctx, worker, row, &error).await;
    }
}

async fn campaign_rate(ctx: &WorkerContext, campaign: CampaignId) -> Option<u64> {
    match ctx.kv.get(&scheduler::rate_key(campaign)).await {
        Ok(Some(raw)) => raw.parse().ok(),
        Ok(None) => None,
        Err(e) => {
            sendpath!(level = WARN, campaign = %campaign, error = %e, "campaign rate lookup failed");
            None
        }
    }
}

async fn skip(ctx: &WorkerContext, worker: WorkerId, row: &QueueRow, reason: SkipReason) {
    sendpath!(row = %row.id, reason = reason.as_str(), "row skipped");
    if let Err(e) = ctx.store.mark_skipped(row.id, worker, reason.as_str()).await {
        sendpath!(level = WARN, row = %row.id, error = %e, "failed to mark row skipped");
    }
}

async fn requeue(ctx: &WorkerContext, worker: WorkerId, row: &QueueRow, not_before: DateTime<Utc>) {
    if let Err(e) = ctx
        .store
        .restore_queued(row.id, worker, Some(not_before))
        .await
    {
        sendpath!(level = WARN, row = %row.id, error = %e, "failed to requeue row");
    }
}

/// A transient failure: counts an attempt, dead-letters at the bound.
async fn record_failure(ctx: &WorkerContext, worker: WorkerId, row: &QueueRow, error: &str) {
    match ctx
        .store
        .mark_failed(row.id, worker, error, ctx.config.max_retry_count)
        .await
    {
        Ok(QueueStatus::DeadLetter) => {
            sendpath!(level = WARN, row = %row.id, error, "row dead-lettered after exhausting retries");
        }
        Ok(_) => {
            sendpath!(row = %row.id, error, "row failed, will retry");
        }
        Err(e) => {
            sendpath!(level = WARN, row = %row.id, error = %e, "failed to record row failure");
        }
    }
}

/// An authoritative permanent failure: never retried.
async fn dead_letter(ctx: &WorkerContext, worker: WorkerId, row: &QueueRow, error: &str) {
    sendpath!(level = WARN, row = %row.id, error, "permanent failure, dead-lettering");
    // max_retries of zero forces the dead-letter branch in one step.
    if let Err(e) = ctx.store.mark_failed(row.id, worker, error, 0).await {
        sendpath!(level = WARN, row = %row.id, error = %e, "failed to dead-letter row");
    }
}
