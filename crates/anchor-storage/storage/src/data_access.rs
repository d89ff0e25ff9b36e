//! Channel reads and writes backed by an external indexer.
//!
//! Writes are stored and anchored through [`AnchoredStorage`], then tracked as
//! [`PendingWrite`]s until the indexer reports them. Reads merge any write
//! still pending into the indexer's results so authors see their own writes
//! immediately.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
    time::Duration,
};

use anchor_storage_core::{
    ContentId,
    DataBlock,
    IpfsMeta,
    StorageMeta,
    StorageState,
    StorageType,
    StoredContent,
    TimestampBoundaries,
    TimestampedTransaction,
    Transaction,
    TransactionState,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    indexer::{
        IndexedTransaction,
        IndexedTransactions,
        IndexerError,
        TransactionIndexer,
    },
    metrics,
    pending::{
        PendingWrite,
        PendingWriteStore,
    },
    storage::{
        AnchoredStorage,
        StorageError,
        StoredBlob,
    },
    utils::{
        RetryPolicy,
        retry,
        unix_timestamp_now,
    },
};

#[derive(Debug, Error)]
pub enum DataAccessError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error("{id} not indexed after {attempts} attempts")]
    RetryExhausted { id: ContentId, attempts: u32 },
    #[error("Data access closed before the write was confirmed")]
    Cancelled,
    #[error("Confirmation task ended without a result")]
    ConfirmationDropped,
    #[error("Failed to serialize data block")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct IndexedDataAccessConfig {
    pub network_name: String,
    /// Indexer lookups made while waiting for a write to be indexed.
    pub poll: RetryPolicy,
}

impl Default for IndexedDataAccessConfig {
    fn default() -> Self {
        Self {
            network_name: "private".to_string(),
            poll: RetryPolicy::new(100, Duration::from_secs(1)),
        }
    }
}

/// Transactions of a single channel, confirmed ones first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTransactions {
    pub transactions: Vec<TimestampedTransaction>,
    pub locations: Vec<ContentId>,
    pub storage_meta: Vec<StorageMeta>,
}

/// Transactions grouped by channel id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelsByTopic {
    pub transactions: BTreeMap<String, Vec<TimestampedTransaction>>,
    pub locations: BTreeMap<String, Vec<ContentId>>,
    pub storage_meta: BTreeMap<String, Vec<StorageMeta>>,
}

impl ChannelsByTopic {
    fn push(&mut self, channel_id: &str, entry: ChannelEntry) {
        self.transactions
            .entry(channel_id.to_string())
            .or_default()
            .push(entry.transaction);
        self.locations
            .entry(channel_id.to_string())
            .or_default()
            .push(entry.location);
        self.storage_meta
            .entry(channel_id.to_string())
            .or_default()
            .push(entry.storage_meta);
    }
}

/// A write confirmed through the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistResult {
    pub location: ContentId,
    pub storage_meta: StorageMeta,
}

#[derive(Debug)]
pub enum PersistOutcome {
    Confirmed(PersistResult),
    Failed(DataAccessError),
}

/// Returned by [`IndexedDataAccess::persist_transaction`] once the data block
/// is in the blob store.
#[derive(Debug)]
pub struct PersistHandle {
    pub location: ContentId,
    /// Metadata of the write while pending.
    pub storage_meta: StorageMeta,
    pub topics: Vec<String>,
    rx: oneshot::Receiver<PersistOutcome>,
}

impl PersistHandle {
    /// Resolves once the write is indexed or has failed.
    pub async fn confirmation(self) -> PersistOutcome {
        self.rx
            .await
            .unwrap_or(PersistOutcome::Failed(DataAccessError::ConfirmationDropped))
    }
}

struct ChannelEntry {
    location: ContentId,
    storage_meta: StorageMeta,
    transaction: TimestampedTransaction,
}

impl ChannelEntry {
    fn indexed(tx: &IndexedTransaction, indexed_block: u64, network_name: &str) -> Self {
        Self {
            location: tx.hash.clone(),
            storage_meta: tx.storage_meta(indexed_block, network_name),
            transaction: TimestampedTransaction {
                state: TransactionState::Confirmed,
                timestamp: tx.block_timestamp,
                transaction: tx.transaction(),
            },
        }
    }

    fn pending(write: PendingWrite) -> Self {
        Self {
            transaction: TimestampedTransaction {
                state: TransactionState::Pending,
                timestamp: write.storage_result.meta.timestamp,
                transaction: write.transaction,
            },
            location: write.storage_result.id,
            storage_meta: write.storage_result.meta,
        }
    }
}

#[derive(Debug, Error)]
enum PollError {
    #[error("not indexed yet")]
    NotIndexed,
    #[error(transparent)]
    Indexer(#[from] IndexerError),
}

pub struct IndexedDataAccess {
    storage: Arc<AnchoredStorage>,
    indexer: Arc<dyn TransactionIndexer>,
    pending: Arc<PendingWriteStore>,
    config: IndexedDataAccessConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IndexedDataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedDataAccess")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl IndexedDataAccess {
    pub fn new(
        storage: Arc<AnchoredStorage>,
        indexer: Arc<dyn TransactionIndexer>,
        config: IndexedDataAccessConfig,
    ) -> Self {
        Self {
            storage,
            indexer,
            pending: Arc::new(PendingWriteStore::new()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn pending(&self) -> &PendingWriteStore {
        &self.pending
    }

    /// Checks that the indexer answers, then initializes the storage.
    pub async fn initialize(&self) -> Result<(), DataAccessError> {
        let indexed_block = self.indexer.block_number().await?;
        self.storage.initialize().await?;
        info!(target: "data_access", indexed_block, "Indexed data access initialized");
        Ok(())
    }

    /// Stops the confirmation tasks still running. Their handles resolve to
    /// [`DataAccessError::Cancelled`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Stores `transaction` in a single-transaction data block and anchors it
    /// in the background.
    pub async fn persist_transaction(
        &self,
        transaction: Transaction,
        channel_id: &str,
        topics: Vec<String>,
    ) -> Result<PersistHandle, DataAccessError> {
        let block = DataBlock::single(transaction.clone(), channel_id, topics.clone());
        let content = serde_json::to_string(&block)?;
        let blob = self.storage.store_content(&content).await?;

        let storage_meta = StorageMeta {
            storage_type: StorageType::InMemory,
            state: StorageState::Pending,
            timestamp: unix_timestamp_now(),
            ipfs: Some(IpfsMeta { size: blob.size }),
            ethereum: None,
        };
        self.pending.insert(PendingWrite {
            channel_id: channel_id.to_string(),
            transaction,
            topics: topics.clone(),
            storage_result: StoredContent {
                id: blob.id.clone(),
                content,
                meta: storage_meta.clone(),
            },
        });

        let (tx, rx) = oneshot::channel();
        let task = ConfirmationTask {
            storage: self.storage.clone(),
            indexer: self.indexer.clone(),
            network_name: self.config.network_name.clone(),
            poll: self.config.poll,
        };
        let pending = self.pending.clone();
        let cancel = self.cancel.clone();
        let channel_id = channel_id.to_string();
        let location = blob.id.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(DataAccessError::Cancelled),
                result = task.run(&blob) => result,
            };
            pending.remove_if(&channel_id, &blob.id);

            let outcome = match result {
                Ok(confirmed) => {
                    debug!(target: "data_access", location = %blob.id, "Write indexed");
                    PersistOutcome::Confirmed(confirmed)
                }
                Err(err) => {
                    warn!(target: "data_access", location = %blob.id, error = %err, "Write not confirmed");
                    PersistOutcome::Failed(err)
                }
            };
            // The handle may have been dropped.
            let _ = tx.send(outcome);
        });

        Ok(PersistHandle {
            location,
            storage_meta,
            topics,
            rx,
        })
    }

    /// Indexed transactions of `channel_id` updated within `updated_between`,
    /// followed by the channel's pending write.
    pub async fn get_transactions_by_channel_id(
        &self,
        channel_id: &str,
        updated_between: Option<TimestampBoundaries>,
    ) -> Result<ChannelTransactions, DataAccessError> {
        let result = self.indexer.transactions_by_channel(channel_id).await?;
        let pending = self.unindexed_pending_write(channel_id, &result);
        let boundaries = updated_between.unwrap_or_default();

        let mut channel = ChannelTransactions::default();
        let entries = result
            .transactions
            .iter()
            .filter(|tx| boundaries.contains(tx.block_timestamp))
            .map(|tx| ChannelEntry::indexed(tx, result.block_number, &self.config.network_name))
            .chain(pending.map(ChannelEntry::pending));
        for entry in entries {
            channel.locations.push(entry.location);
            channel.storage_meta.push(entry.storage_meta);
            channel.transactions.push(entry.transaction);
        }
        Ok(channel)
    }

    pub async fn get_channels_by_topic(
        &self,
        topic: &str,
        updated_between: Option<TimestampBoundaries>,
    ) -> Result<ChannelsByTopic, DataAccessError> {
        self.get_channels_by_multiple_topics(&[topic.to_string()], updated_between)
            .await
    }

    /// Channels with a transaction tagged with any of `topics`.
    ///
    /// A channel is returned when at least one of its transactions falls
    /// within `updated_between`, and then with all of its transactions.
    pub async fn get_channels_by_multiple_topics(
        &self,
        topics: &[String],
        updated_between: Option<TimestampBoundaries>,
    ) -> Result<ChannelsByTopic, DataAccessError> {
        if topics.is_empty() {
            return Ok(ChannelsByTopic::default());
        }

        let IndexedTransactions {
            transactions,
            block_number,
        } = self.indexer.transactions_by_topics(topics).await?;
        let indexed_locations: BTreeSet<&str> =
            transactions.iter().map(|tx| tx.hash.as_str()).collect();
        let pending: Vec<_> = self
            .pending
            .matching_topics(topics)
            .into_iter()
            .filter(|write| !indexed_locations.contains(write.storage_result.id.as_str()))
            .collect();

        let mut entries: Vec<(String, ChannelEntry)> = transactions
            .iter()
            .map(|tx| {
                (
                    tx.channel_id.clone(),
                    ChannelEntry::indexed(tx, block_number, &self.config.network_name),
                )
            })
            .collect();
        entries.extend(
            pending
                .into_iter()
                .map(|write| (write.channel_id.clone(), ChannelEntry::pending(write))),
        );

        let boundaries = updated_between.unwrap_or_default();
        let updated_channels: BTreeSet<String> = entries
            .iter()
            .filter(|(_, entry)| boundaries.contains(entry.transaction.timestamp))
            .map(|(channel_id, _)| channel_id.clone())
            .collect();

        let mut channels = ChannelsByTopic::default();
        for (channel_id, entry) in entries {
            if updated_channels.contains(&channel_id) {
                channels.push(&channel_id, entry);
            }
        }
        Ok(channels)
    }

    /// The pending write of `channel_id` unless `indexed` already holds it,
    /// in which case it leaves the store.
    fn unindexed_pending_write(
        &self,
        channel_id: &str,
        indexed: &IndexedTransactions,
    ) -> Option<PendingWrite> {
        let write = self.pending.get(channel_id)?;
        let location = write.storage_result.id.as_str();
        if indexed.transactions.iter().any(|tx| tx.hash == location) {
            self.pending.remove_if(channel_id, location);
            return None;
        }
        Some(write)
    }
}

impl Drop for IndexedDataAccess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Anchors a stored blob and waits for the indexer to report it.
struct ConfirmationTask {
    storage: Arc<AnchoredStorage>,
    indexer: Arc<dyn TransactionIndexer>,
    network_name: String,
    poll: RetryPolicy,
}

impl ConfirmationTask {
    async fn run(&self, blob: &StoredBlob) -> Result<PersistResult, DataAccessError> {
        self.storage.anchor_content(blob).await?;

        let indexer = &*self.indexer;
        let location = blob.id.as_str();
        let indexed = retry(
            self.poll,
            "indexer_poll",
            |_| true,
            || {
                async move {
                    metrics::record_indexer_poll();
                    let result = indexer.transactions_by_hash(location).await?;
                    if result.transactions.is_empty() {
                        return Err(PollError::NotIndexed);
                    }
                    Ok(result)
                }
            },
        )
        .await
        .map_err(|err| {
            match err {
                PollError::NotIndexed => {
                    DataAccessError::RetryExhausted {
                        id: blob.id.clone(),
                        attempts: self.poll.max_retries + 1,
                    }
                }
                PollError::Indexer(err) => DataAccessError::Indexer(err),
            }
        })?;

        let storage_meta = indexed
            .transactions
            .first()
            .map(|tx| tx.storage_meta(indexed.block_number, &self.network_name))
            .ok_or(DataAccessError::RetryExhausted {
                id: blob.id.clone(),
                attempts: self.poll.max_retries + 1,
            })?;

        Ok(PersistResult {
            location: blob.id.clone(),
            storage_meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{
        Address,
        B256,
    };
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        anchor::{
            AnchorClient,
            AnchorClientConfig,
        },
        blocks::{
            BlockIndexConfig,
            BlockTimestampIndex,
        },
        chain::mock::MockChain,
        content::MemoryContentStore,
        indexer::memory::MemoryIndexer,
    };

    struct Harness {
        chain: Arc<MockChain>,
        content: Arc<MemoryContentStore>,
        indexer: Arc<MemoryIndexer>,
        access: IndexedDataAccess,
    }

    fn harness(poll: RetryPolicy) -> Harness {
        let chain = Arc::new(MockChain::with_blocks(10, 1_600_000_000));
        let content = Arc::new(MemoryContentStore::new());
        let blocks = Arc::new(BlockTimestampIndex::new(
            chain.clone(),
            BlockIndexConfig {
                last_block_number_delay: Duration::ZERO,
                retry: RetryPolicy::none(),
                ..Default::default()
            },
        ));
        let anchor = Arc::new(AnchorClient::new(
            chain.clone(),
            blocks.clone(),
            AnchorClientConfig {
                retry: RetryPolicy::none(),
                ..Default::default()
            },
        ));
        let storage = Arc::new(AnchoredStorage::new(content.clone(), anchor, blocks));
        let indexer = Arc::new(MemoryIndexer::new(9));
        let access = IndexedDataAccess::new(
            storage,
            indexer.clone(),
            IndexedDataAccessConfig {
                network_name: "private".to_string(),
                poll,
            },
        );
        Harness {
            chain,
            content,
            indexer,
            access,
        }
    }

    fn indexed(hash: &str, channel_id: &str, timestamp: u64, topics: &[&str]) -> IndexedTransaction {
        IndexedTransaction {
            hash: hash.to_string(),
            channel_id: channel_id.to_string(),
            data: Some(format!("data of {hash}")),
            encrypted_data: None,
            encryption_method: None,
            public_keys: Vec::new(),
            encrypted_keys: Vec::new(),
            topics: topics.iter().map(ToString::to_string).collect(),
            block_number: 5,
            block_timestamp: timestamp,
            transaction_hash: B256::repeat_byte(0x01),
            smart_contract_address: Address::ZERO,
            size: 10,
        }
    }

    fn topics(topics: &[&str]) -> Vec<String> {
        topics.iter().map(ToString::to_string).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_is_confirmed_once_indexed() {
        let h = harness(RetryPolicy::new(5, Duration::from_secs(1)));

        let handle = h
            .access
            .persist_transaction(Transaction::clear("hello"), "channel", topics(&["t"]))
            .await
            .unwrap();
        assert_eq!(handle.storage_meta.state, StorageState::Pending);
        assert_eq!(h.access.pending().len(), 1);
        assert_eq!(h.content.len(), 1);

        let mut record = indexed(&handle.location, "channel", 1_600_000_100, &["t"]);
        record.block_number = 8;
        h.indexer.index(record);
        h.indexer.set_block_number(12);

        let location = handle.location.clone();
        let outcome = handle.confirmation().await;
        let confirmed = assert_matches!(outcome, PersistOutcome::Confirmed(result) => result);

        assert_eq!(confirmed.location, location);
        assert_eq!(confirmed.storage_meta.state, StorageState::Confirmed);
        assert_eq!(confirmed.storage_meta.ethereum.unwrap().block_confirmation, 4);
        assert!(h.access.pending().is_empty());
        assert_eq!(h.chain.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_block_is_stored_as_json() {
        let h = harness(RetryPolicy::none());

        let handle = h
            .access
            .persist_transaction(Transaction::clear("hello"), "channel", topics(&["t"]))
            .await
            .unwrap();
        let write = h.access.pending().get("channel").unwrap();
        let block: DataBlock = serde_json::from_str(&write.storage_result.content).unwrap();

        assert_eq!(block.header.version, "0.1.0");
        assert_eq!(block.header.channel_ids.get("channel"), Some(&vec![0]));
        assert_eq!(block.transactions, vec![Transaction::clear("hello")]);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_drops_pending_write() {
        let h = harness(RetryPolicy::new(2, Duration::from_secs(1)));

        let handle = h
            .access
            .persist_transaction(Transaction::clear("hello"), "channel", Vec::new())
            .await
            .unwrap();
        let outcome = handle.confirmation().await;

        assert_matches!(
            outcome,
            PersistOutcome::Failed(DataAccessError::RetryExhausted { attempts: 3, .. })
        );
        assert_eq!(h.indexer.hash_queries(), 3);
        assert!(h.access.pending().is_empty());

        let channel = h
            .access
            .get_transactions_by_channel_id("channel", None)
            .await
            .unwrap();
        assert!(channel.transactions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_anchor_failure_is_reported() {
        let h = harness(RetryPolicy::none());
        h.chain.fail_submissions("out of gas");

        let handle = h
            .access
            .persist_transaction(Transaction::clear("hello"), "channel", Vec::new())
            .await
            .unwrap();

        assert_matches!(
            handle.confirmation().await,
            PersistOutcome::Failed(DataAccessError::Storage(StorageError::AnchorFailed { .. }))
        );
        assert!(h.access.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_write_is_merged_after_indexed_ones() {
        let h = harness(RetryPolicy::new(100, Duration::from_secs(1)));
        h.indexer
            .index(indexed("QmOld", "channel", 1_600_000_000, &[]));

        let handle = h
            .access
            .persist_transaction(Transaction::clear("new"), "channel", Vec::new())
            .await
            .unwrap();
        let channel = h
            .access
            .get_transactions_by_channel_id("channel", None)
            .await
            .unwrap();

        assert_eq!(channel.locations, vec!["QmOld".to_string(), handle.location.clone()]);
        assert_eq!(channel.transactions[0].state, TransactionState::Confirmed);
        assert_eq!(channel.transactions[1].state, TransactionState::Pending);
        assert_eq!(channel.transactions[1].transaction, Transaction::clear("new"));
        assert_eq!(channel.storage_meta[1].storage_type, StorageType::InMemory);
        h.access.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_write_is_dropped_once_indexed() {
        let h = harness(RetryPolicy::new(100, Duration::from_secs(1)));

        let handle = h
            .access
            .persist_transaction(Transaction::clear("new"), "channel", Vec::new())
            .await
            .unwrap();
        h.indexer
            .index(indexed(&handle.location, "channel", 1_600_000_000, &[]));

        let channel = h
            .access
            .get_transactions_by_channel_id("channel", None)
            .await
            .unwrap();

        assert_eq!(channel.locations, vec![handle.location.clone()]);
        assert_eq!(channel.transactions[0].state, TransactionState::Confirmed);
        assert!(h.access.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_indexed_for_channel_but_not_by_hash_is_listed_once() {
        let h = harness(RetryPolicy::new(100, Duration::from_secs(1)));
        h.indexer.set_hash_lookups_behind(true);

        let handle = h
            .access
            .persist_transaction(Transaction::clear("new"), "channel", Vec::new())
            .await
            .unwrap();
        h.indexer
            .index(indexed(&handle.location, "channel", 1_600_000_000, &[]));

        let channel = h
            .access
            .get_transactions_by_channel_id("channel", None)
            .await
            .unwrap();

        assert_eq!(channel.locations, vec![handle.location.clone()]);
        assert_eq!(channel.transactions.len(), 1);
        assert_eq!(channel.transactions[0].state, TransactionState::Confirmed);
        assert!(h.access.pending().is_empty());
        h.access.close();
    }

    #[tokio::test]
    async fn test_channel_read_filters_by_timestamp() {
        let h = harness(RetryPolicy::none());
        h.indexer.index(indexed("Qm1", "channel", 100, &[]));
        h.indexer.index(indexed("Qm2", "channel", 200, &[]));
        h.indexer.index(indexed("Qm3", "channel", 300, &[]));

        let channel = h
            .access
            .get_transactions_by_channel_id(
                "channel",
                Some(TimestampBoundaries::new(Some(150), Some(300))),
            )
            .await
            .unwrap();

        assert_eq!(channel.locations, vec!["Qm2".to_string(), "Qm3".to_string()]);
        assert_eq!(channel.transactions[0].timestamp, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_by_topics_groups_and_filters() {
        let h = harness(RetryPolicy::new(100, Duration::from_secs(1)));
        h.indexer.index(indexed("QmA1", "a", 100, &["x"]));
        h.indexer.index(indexed("QmA2", "a", 500, &["x"]));
        h.indexer.index(indexed("QmB1", "b", 100, &["x"]));
        h.indexer.index(indexed("QmC1", "c", 600, &["y"]));

        let handle = h
            .access
            .persist_transaction(Transaction::clear("pending"), "d", topics(&["x"]))
            .await
            .unwrap();

        let channels = h
            .access
            .get_channels_by_multiple_topics(
                &topics(&["x"]),
                Some(TimestampBoundaries::new(Some(400), None)),
            )
            .await
            .unwrap();

        assert_eq!(
            channels.locations.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "d".to_string()]
        );
        assert_eq!(
            channels.locations["a"],
            vec!["QmA1".to_string(), "QmA2".to_string()]
        );
        assert_eq!(channels.locations["d"], vec![handle.location.clone()]);
        assert_eq!(channels.transactions["d"][0].state, TransactionState::Pending);
        h.access.close();
    }

    #[tokio::test]
    async fn test_channels_by_topic_without_boundaries() {
        let h = harness(RetryPolicy::none());
        h.indexer.index(indexed("QmA1", "a", 100, &["x"]));
        h.indexer.index(indexed("QmB1", "b", 200, &["y"]));

        let channels = h.access.get_channels_by_topic("y", None).await.unwrap();
        assert_eq!(channels.locations.len(), 1);
        assert_eq!(channels.locations["b"], vec!["QmB1".to_string()]);

        let none = h
            .access
            .get_channels_by_multiple_topics(&[], None)
            .await
            .unwrap();
        assert_eq!(none, ChannelsByTopic::default());
    }

    #[tokio::test]
    async fn test_close_cancels_confirmation() {
        let h = harness(RetryPolicy::new(100, Duration::from_secs(1)));

        let handle = h
            .access
            .persist_transaction(Transaction::clear("hello"), "channel", Vec::new())
            .await
            .unwrap();
        h.access.close();

        assert_matches!(
            handle.confirmation().await,
            PersistOutcome::Failed(DataAccessError::Cancelled)
        );
        assert!(h.access.pending().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_requires_indexer() {
        let h = harness(RetryPolicy::none());
        h.access.initialize().await.unwrap();

        h.indexer.set_failing(true);
        assert_matches!(
            h.access.initialize().await,
            Err(DataAccessError::Indexer(IndexerError::RequestFailed(_)))
        );
    }
}
