use std::{
    collections::HashMap,
    sync::Arc,
};

use anchor_storage_core::{
    AnchorMetadata,
    ContentId,
};
use parking_lot::RwLock;
use tracing::trace;

use crate::anchor::{
    AnchorClient,
    AnchorError,
};

/// Write-once anchor metadata per content id.
///
/// Only the first anchor of a content id is authoritative, so an existing
/// entry is never replaced.
#[derive(Debug)]
pub struct AnchorMetadataCache {
    anchor: Arc<AnchorClient>,
    entries: RwLock<HashMap<ContentId, AnchorMetadata>>,
}

impl AnchorMetadataCache {
    pub fn new(anchor: Arc<AnchorClient>) -> Self {
        Self {
            anchor,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stores `metadata` unless `id` already has an entry. Returns whether it
    /// was stored.
    pub fn save_metadata(&self, id: &str, metadata: AnchorMetadata) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(id) {
            trace!(target: "metadata_cache", content_id = id, "Keeping first metadata");
            return false;
        }
        entries.insert(id.to_string(), metadata);
        true
    }

    pub fn cached(&self, id: &str) -> Option<AnchorMetadata> {
        self.entries.read().get(id).cloned()
    }

    /// Cached metadata of `id`, looked up from the chain on a miss.
    pub async fn get_metadata(&self, id: &str) -> Result<AnchorMetadata, AnchorError> {
        if let Some(metadata) = self.cached(id) {
            return Ok(metadata);
        }

        let metadata = self.anchor.get_meta_from_anchor(id).await?;
        Ok(self
            .entries
            .write()
            .entry(id.to_string())
            .or_insert(metadata)
            .clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
