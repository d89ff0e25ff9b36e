use std::sync::atomic::{
    AtomicU64,
    AtomicUsize,
    Ordering,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    IndexedTransaction,
    IndexedTransactions,
    IndexerError,
    TransactionIndexer,
};

/// In-memory [`TransactionIndexer`] the tests fill by hand.
#[derive(Debug, Default)]
pub struct MemoryIndexer {
    transactions: Mutex<Vec<IndexedTransaction>>,
    block_number: AtomicU64,
    hash_queries: AtomicUsize,
    failing: Mutex<bool>,
    /// Hash lookups see none of the indexed transactions.
    hash_lookups_behind: Mutex<bool>,
}

impl MemoryIndexer {
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number: AtomicU64::new(block_number),
            ..Default::default()
        }
    }

    pub fn index(&self, transaction: IndexedTransaction) {
        self.block_number
            .fetch_max(transaction.block_number, Ordering::SeqCst);
        self.transactions.lock().push(transaction);
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.block_number.store(block_number, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Makes hash lookups trail the channel and topic views.
    pub fn set_hash_lookups_behind(&self, behind: bool) {
        *self.hash_lookups_behind.lock() = behind;
    }

    pub fn hash_queries(&self) -> usize {
        self.hash_queries.load(Ordering::SeqCst)
    }

    fn select(
        &self,
        predicate: impl Fn(&IndexedTransaction) -> bool,
    ) -> Result<IndexedTransactions, IndexerError> {
        if *self.failing.lock() {
            return Err(IndexerError::RequestFailed("indexer unavailable".to_string()));
        }
        let mut transactions: Vec<_> = self
            .transactions
            .lock()
            .iter()
            .filter(|tx| predicate(tx))
            .cloned()
            .collect();
        transactions.sort_by_key(|tx| tx.block_timestamp);

        Ok(IndexedTransactions {
            transactions,
            block_number: self.block_number.load(Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl TransactionIndexer for MemoryIndexer {
    async fn transactions_by_hash(&self, hash: &str) -> Result<IndexedTransactions, IndexerError> {
        self.hash_queries.fetch_add(1, Ordering::SeqCst);
        let behind = *self.hash_lookups_behind.lock();
        self.select(|tx| !behind && tx.hash == hash)
    }

    async fn transactions_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<IndexedTransactions, IndexerError> {
        self.select(|tx| tx.channel_id == channel_id)
    }

    async fn transactions_by_topics(
        &self,
        topics: &[String],
    ) -> Result<IndexedTransactions, IndexerError> {
        self.select(|tx| tx.topics.iter().any(|topic| topics.contains(topic)))
    }

    async fn block_number(&self) -> Result<u64, IndexerError> {
        if *self.failing.lock() {
            return Err(IndexerError::RequestFailed("indexer unavailable".to_string()));
        }
        Ok(self.block_number.load(Ordering::SeqCst))
    }
}
