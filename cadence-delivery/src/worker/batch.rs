//! Batched send variant.
//!
//! Claimed rows that share a campaign and resolve to the same ESP go
//! through `send_batch`, partitioned by the grouper so every batch
//! respects the provider's count and payload caps. Per-message results
//! map 1:1 back to rows; rows whose preparation already reached a
//! disposition never enter a batch.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};

use cadence_common::{ids::WorkerId, queue::QueueRow};
use cadence_esp::{EspAdapter, OutboundMessage, group_for_batching};

use crate::worker::{
    WorkerContext,
    process::{Prepared, finalize, prepare_row},
};

struct PendingSend {
    row: QueueRow,
    message: OutboundMessage,
    adapter: Arc<dyn EspAdapter>,
    org: cadence_common::ids::OrgId,
}

/// Process a claim batch with same-campaign batching.
pub(crate) async fn process_claimed(
    ctx: &WorkerContext,
    worker: WorkerId,
    rows: Vec<QueueRow>,
    now: DateTime<Utc>,
) {
    // Preparation stays per-row: gates, skips, and requeues are row-level
    // decisions regardless of how the survivors ship.
    let mut groups: HashMap<(cadence_common::ids::CampaignId, String), Vec<PendingSend>> =
        HashMap::new();

    for row in rows {
        match prepare_row(ctx, worker, &row, now).await {
            Prepared::Handled => {}
            Prepared::Ready {
                message,
                adapter,
                org,
            } => {
                let key = (row.campaign_id, adapter.esp_type().to_string());
                groups.entry(key).or_default().push(PendingSend {
                    row,
                    message,
                    adapter,
                    org,
                });
            }
        }
    }

    for (_, pending) in groups {
        let Some(first) = pending.first() else {
            continue;
        };
        let adapter = Arc::clone(&first.adapter);

        if adapter.max_batch_size() <= 1 || pending.len() == 1 {
            for send in pending {
                let outcome = adapter.send(&send.message).await;
                finalize(ctx, worker, &send.row, send.org, outcome).await;
            }
            continue;
        }

        let mut sends: Vec<(QueueRow, cadence_common::ids::OrgId)> = Vec::new();
        let mut messages = Vec::new();
        for send in pending {
            sends.push((send.row, send.org));
            messages.push(send.message);
        }

        let mut cursor = 0_usize;
        for batch in group_for_batching(
            messages,
            adapter.max_batch_size(),
            adapter.max_payload_bytes(),
        ) {
            let outcome = adapter.send_batch(&batch).await;
            for result in outcome.results {
                if let Some((row, org)) = sends.get(cursor) {
                    finalize(ctx, worker, row, *org, result).await;
                }
                cursor += 1;
            }
        }
    }
}
