//! Partitioning messages into provider-sized batches.

use crate::message::OutboundMessage;

/// Split `messages` into batches satisfying both the count cap and the
/// estimated payload cap.
///
/// A single message larger than `max_payload_bytes` still gets its own
/// batch: the provider will reject it with a normal outcome, which is more
/// useful than silently dropping it here.
#[must_use]
pub fn group_for_batching(
    messages: Vec<OutboundMessage>,
    max_batch_size: usize,
    max_payload_bytes: usize,
) -> Vec<Vec<OutboundMessage>> {
    let max_batch_size = max_batch_size.max(1);

    let mut batches = Vec::new();
    let mut current: Vec<OutboundMessage> = Vec::new();
    let mut current_bytes = 0_usize;

    for message in messages {
        let size = message.estimated_size();
        let overflows = !current.is_empty()
            && (current.len() >= max_batch_size || current_bytes + size > max_payload_bytes);

        if overflows {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += size;
        current.push(message);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}
