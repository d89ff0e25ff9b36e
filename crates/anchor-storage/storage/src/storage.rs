//! Content storage anchored on chain.
//!
//! [`AnchoredStorage`] writes content to the blob store and anchors its id
//! and size on chain. Reads resolve the anchor metadata through the
//! [`AnchorMetadataCache`] before fetching the content.

use std::{
    sync::Arc,
    time::Duration,
};

use anchor_storage_core::{
    AnchorMetadata,
    AnchorRecord,
    ContentId,
    IpfsMeta,
    StorageMeta,
    StorageState,
    StorageType,
    StoredContent,
    TimestampBoundaries,
};
use anchor_storage_ipfs::IpfsClientError;
use futures::{
    StreamExt,
    stream,
};
use thiserror::Error;
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    anchor::{
        AnchorClient,
        AnchorError,
    },
    blocks::BlockTimestampIndex,
    content::ContentStore,
    metadata_cache::AnchorMetadataCache,
    metrics,
};

/// Anchors verified against the blob store concurrently while listing.
const VERIFY_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No content provided")]
    EmptyContent,
    #[error("No id provided")]
    EmptyId,
    #[error("Failed to add content to the blob store")]
    BlobAddFailed(#[source] IpfsClientError),
    #[error("Failed to get the stored size of {id}")]
    BlobSizeFailed {
        id: ContentId,
        #[source]
        source: IpfsClientError,
    },
    #[error("Failed to anchor {id}")]
    AnchorFailed {
        id: ContentId,
        #[source]
        source: AnchorError,
    },
    #[error("Failed to read {id}")]
    ReadFailed {
        id: ContentId,
        #[source]
        source: IpfsClientError,
    },
    #[error("Failed to resolve anchor metadata of {id}")]
    MetadataFailed {
        id: ContentId,
        #[source]
        source: AnchorError,
    },
    #[error("Size of {id} anchored as {declared} but stored as {stored}")]
    SizeMismatch {
        id: ContentId,
        declared: u64,
        stored: u64,
    },
    #[error("Failed to list anchors")]
    ListFailed(#[source] AnchorError),
    #[error("Failed to pin content")]
    PinFailed(#[source] IpfsClientError),
    #[error("Initialization failed: {0}")]
    Initialization(String),
}

/// Content written to the blob store but not anchored yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub id: ContentId,
    pub size: u64,
}

pub struct AnchoredStorage {
    content: Arc<dyn ContentStore>,
    anchor: Arc<AnchorClient>,
    blocks: Arc<BlockTimestampIndex>,
    metadata: AnchorMetadataCache,
    bootstrap_peers: Vec<String>,
}

impl std::fmt::Debug for AnchoredStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchoredStorage")
            .field("anchor", &self.anchor)
            .field("bootstrap_peers", &self.bootstrap_peers)
            .finish_non_exhaustive()
    }
}

impl AnchoredStorage {
    pub fn new(
        content: Arc<dyn ContentStore>,
        anchor: Arc<AnchorClient>,
        blocks: Arc<BlockTimestampIndex>,
    ) -> Self {
        Self {
            content,
            metadata: AnchorMetadataCache::new(anchor.clone()),
            anchor,
            blocks,
            bootstrap_peers: Vec::new(),
        }
    }

    /// Peers the blob store connects to in [`Self::initialize`].
    pub fn with_bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn anchor(&self) -> &AnchorClient {
        &self.anchor
    }

    pub fn blocks(&self) -> &BlockTimestampIndex {
        &self.blocks
    }

    pub fn metadata_cache(&self) -> &AnchorMetadataCache {
        &self.metadata
    }

    /// Connects the blob store to its bootstrap peers and checks the chain is
    /// reachable.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        for peer in &self.bootstrap_peers {
            self.content
                .connect_peer(peer)
                .await
                .map_err(|e| StorageError::Initialization(format!("connecting to {peer}: {e}")))?;
        }

        let head = self
            .blocks
            .get_last_block_number()
            .await
            .map_err(|e| StorageError::Initialization(format!("reading chain head: {e}")))?;
        info!(
            target: "storage",
            head,
            peers = self.bootstrap_peers.len(),
            "Storage initialized"
        );
        Ok(())
    }

    /// Writes `content` to the blob store and measures its stored size.
    pub async fn store_content(&self, content: &str) -> Result<StoredBlob, StorageError> {
        if content.is_empty() {
            return Err(StorageError::EmptyContent);
        }

        let id = self
            .content
            .add(content)
            .await
            .map_err(StorageError::BlobAddFailed)?;
        let size = self
            .content
            .content_length(&id)
            .await
            .map_err(|source| {
                StorageError::BlobSizeFailed {
                    id: id.clone(),
                    source,
                }
            })?;
        debug!(target: "storage", content_id = %id, size, "Content stored");

        Ok(StoredBlob { id, size })
    }

    /// Anchors a stored blob on chain.
    pub async fn anchor_content(&self, blob: &StoredBlob) -> Result<AnchorMetadata, StorageError> {
        self.anchor
            .add_hash_and_size_to_anchor(&blob.id, blob.size, None)
            .await
            .map_err(|source| {
                StorageError::AnchorFailed {
                    id: blob.id.clone(),
                    source,
                }
            })
    }

    /// Stores `content` and anchors it.
    ///
    /// A blob written before a failed anchor is left in the blob store.
    pub async fn append(&self, content: &str) -> Result<StoredContent, StorageError> {
        let blob = self.store_content(content).await?;
        let ethereum = self.anchor_content(&blob).await?;

        Ok(StoredContent {
            id: blob.id,
            content: content.to_string(),
            meta: confirmed_meta(blob.size, ethereum),
        })
    }

    pub async fn read(&self, id: &str) -> Result<StoredContent, StorageError> {
        if id.is_empty() {
            return Err(StorageError::EmptyId);
        }

        let ethereum = self
            .metadata
            .get_metadata(id)
            .await
            .map_err(|source| {
                StorageError::MetadataFailed {
                    id: id.to_string(),
                    source,
                }
            })?;
        let object = self.content.read(id).await.map_err(|source| {
            StorageError::ReadFailed {
                id: id.to_string(),
                source,
            }
        })?;

        Ok(StoredContent {
            id: id.to_string(),
            content: object.content,
            meta: confirmed_meta(object.ipfs_size, ethereum),
        })
    }

    /// Ids of every anchored content within `boundaries`.
    ///
    /// Anchors whose content cannot be found, or whose stored size differs
    /// from the anchored one, are replaced by an empty id. Metadata of valid
    /// anchors is cached in chain order.
    pub async fn get_data_ids(
        &self,
        boundaries: Option<TimestampBoundaries>,
    ) -> Result<Vec<ContentId>, StorageError> {
        let records = self
            .anchor
            .get_hashes_and_sizes_from_anchor(boundaries)
            .await
            .map_err(StorageError::ListFailed)?;

        let verified: Vec<Result<AnchorRecord, StorageError>> = stream::iter(records)
            .map(|record| self.verify_record(record))
            .buffered(VERIFY_CONCURRENCY)
            .collect()
            .await;

        let mut invalid = 0;
        let ids: Vec<ContentId> = verified
            .into_iter()
            .map(|result| {
                match result {
                    Ok(record) => {
                        self.metadata.save_metadata(&record.hash, record.meta);
                        record.hash
                    }
                    Err(err) => {
                        warn!(target: "storage", error = %err, "Ignoring invalid anchor");
                        invalid += 1;
                        ContentId::new()
                    }
                }
            })
            .collect();
        metrics::record_invalid_anchors(invalid);

        Ok(ids)
    }

    /// Content of every anchor within `boundaries`.
    ///
    /// Invalid or unreadable anchors yield empty content.
    pub async fn get_data(
        &self,
        boundaries: Option<TimestampBoundaries>,
    ) -> Result<Vec<String>, StorageError> {
        let ids = self.get_data_ids(boundaries).await?;

        Ok(stream::iter(ids)
            .map(|id| {
                async move {
                    if id.is_empty() {
                        return String::new();
                    }
                    match self.read(&id).await {
                        Ok(stored) => stored.content,
                        Err(err) => {
                            warn!(target: "storage", content_id = %id, error = %err, "Ignoring unreadable content");
                            String::new()
                        }
                    }
                }
            })
            .buffered(VERIFY_CONCURRENCY)
            .collect()
            .await)
    }

    pub async fn pin(
        &self,
        ids: &[ContentId],
        timeout: Option<Duration>,
    ) -> Result<Vec<ContentId>, StorageError> {
        self.content
            .pin(ids, timeout)
            .await
            .map_err(StorageError::PinFailed)
    }

    async fn verify_record(&self, record: AnchorRecord) -> Result<AnchorRecord, StorageError> {
        let stored = self
            .content
            .content_length(&record.hash)
            .await
            .map_err(|source| {
                StorageError::BlobSizeFailed {
                    id: record.hash.clone(),
                    source,
                }
            })?;

        if stored != record.size {
            return Err(StorageError::SizeMismatch {
                id: record.hash,
                declared: record.size,
                stored,
            });
        }
        Ok(record)
    }
}

fn confirmed_meta(ipfs_size: u64, ethereum: AnchorMetadata) -> StorageMeta {
    StorageMeta {
        storage_type: StorageType::EthereumIpfs,
        state: StorageState::Confirmed,
        timestamp: ethereum.block_timestamp,
        ipfs: Some(IpfsMeta { size: ipfs_size }),
        ethereum: Some(ethereum),
    }
}
