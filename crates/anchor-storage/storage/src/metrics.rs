//! Metrics emitted by the anchoring pipeline.

use metrics::{
    counter,
    gauge,
};

/// Record a block timestamp fetched from the chain.
///
/// Committed as a `Counter`: `anchor_storage_block_fetches_total`
pub fn record_block_fetch() {
    counter!("anchor_storage_block_fetches_total").increment(1);
}

/// Record an anchor transaction confirmed on chain.
///
/// Committed as a `Counter`: `anchor_storage_anchors_submitted_total`
pub fn record_anchor_submitted() {
    counter!("anchor_storage_anchors_submitted_total").increment(1);
}

/// Record anchors replaced by a placeholder while listing.
///
/// Committed as a `Counter`: `anchor_storage_invalid_anchors_total`
pub fn record_invalid_anchors(count: u64) {
    if count > 0 {
        counter!("anchor_storage_invalid_anchors_total").increment(count);
    }
}

/// Record one indexer lookup made while waiting for a pending write.
///
/// Committed as a `Counter`: `anchor_storage_indexer_poll_attempts_total`
pub fn record_indexer_poll() {
    counter!("anchor_storage_indexer_poll_attempts_total").increment(1);
}

/// Record how many writes are waiting to show up in the indexer.
///
/// Committed as a `Gauge`: `anchor_storage_pending_writes`
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_writes(count: usize) {
    gauge!("anchor_storage_pending_writes").set(count as f64);
}
