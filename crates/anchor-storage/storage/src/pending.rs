use std::collections::HashMap;

use anchor_storage_core::{
    StoredContent,
    Transaction,
};
use parking_lot::Mutex;
use tracing::trace;

use crate::metrics;

/// A write that has been submitted but is not visible in the indexer yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub channel_id: String,
    pub transaction: Transaction,
    pub topics: Vec<String>,
    pub storage_result: StoredContent,
}

/// Submitted writes keyed by channel id, one per channel.
///
/// A newer write to the same channel replaces the older entry.
#[derive(Debug, Default)]
pub struct PendingWriteStore {
    writes: Mutex<HashMap<String, PendingWrite>>,
}

impl PendingWriteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, write: PendingWrite) {
        let mut writes = self.writes.lock();
        trace!(
            target: "pending_writes",
            channel_id = %write.channel_id,
            location = %write.storage_result.id,
            "Registering pending write"
        );
        writes.insert(write.channel_id.clone(), write);
        metrics::set_pending_writes(writes.len());
    }

    pub fn get(&self, channel_id: &str) -> Option<PendingWrite> {
        self.writes.lock().get(channel_id).cloned()
    }

    /// Removes the pending write of `channel_id` if it is still the one
    /// stored at `location`. Returns whether an entry was removed.
    pub fn remove_if(&self, channel_id: &str, location: &str) -> bool {
        let mut writes = self.writes.lock();
        let matches = writes
            .get(channel_id)
            .is_some_and(|write| write.storage_result.id == location);
        if matches {
            writes.remove(channel_id);
            metrics::set_pending_writes(writes.len());
        }
        matches
    }

    /// Pending writes tagged with any of `topics`.
    pub fn matching_topics(&self, topics: &[String]) -> Vec<PendingWrite> {
        let mut matching: Vec<_> = self
            .writes
            .lock()
            .values()
            .filter(|write| write.topics.iter().any(|topic| topics.contains(topic)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        matching
    }

    pub fn len(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.lock().is_empty()
    }
}
