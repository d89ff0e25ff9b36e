//! Read access to an external indexer of anchored transactions.
//!
//! The indexer is eventually consistent with the chain: a freshly anchored
//! write shows up only after the indexer has processed its block.

use std::collections::BTreeMap;

use alloy::primitives::{
    Address,
    B256,
};
use anchor_storage_core::{
    AnchorMetadata,
    ContentId,
    IpfsMeta,
    StorageMeta,
    StorageState,
    StorageType,
    Transaction,
};
use async_trait::async_trait;
use thiserror::Error;

mod graphql;

#[cfg(any(test, feature = "test"))]
pub mod memory;

pub use graphql::{
    SubgraphIndexer,
    SubgraphIndexerConfig,
};

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Indexer request failed: {0}")]
    RequestFailed(String),
    #[error("Failed to parse indexer response: {0}")]
    ParseError(String),
}

/// A channel transaction as recorded by the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTransaction {
    /// Content id of the data block holding the transaction.
    pub hash: ContentId,
    pub channel_id: String,
    pub data: Option<String>,
    pub encrypted_data: Option<String>,
    pub encryption_method: Option<String>,
    pub public_keys: Vec<String>,
    pub encrypted_keys: Vec<String>,
    pub topics: Vec<String>,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: B256,
    pub smart_contract_address: Address,
    pub size: u64,
}

impl IndexedTransaction {
    /// The channel transaction, with public keys paired to their encrypted
    /// keys.
    pub fn transaction(&self) -> Transaction {
        let keys = (!self.public_keys.is_empty()).then(|| {
            self.public_keys
                .iter()
                .cloned()
                .zip(self.encrypted_keys.iter().cloned())
                .collect::<BTreeMap<_, _>>()
        });

        Transaction {
            data: self.data.clone(),
            encrypted_data: self.encrypted_data.clone(),
            encryption_method: self.encryption_method.clone(),
            keys,
        }
    }

    /// Storage metadata relative to the indexer head `indexed_block`.
    pub fn storage_meta(&self, indexed_block: u64, network_name: &str) -> StorageMeta {
        StorageMeta {
            storage_type: StorageType::EthereumIpfs,
            state: StorageState::Confirmed,
            timestamp: self.block_timestamp,
            ipfs: Some(IpfsMeta { size: self.size }),
            ethereum: Some(AnchorMetadata {
                block_confirmation: indexed_block.saturating_sub(self.block_number),
                block_number: self.block_number,
                block_timestamp: self.block_timestamp,
                network_name: network_name.to_string(),
                smart_contract_address: self.smart_contract_address,
                transaction_hash: self.transaction_hash,
                cost: None,
                fee: None,
                gas_fee: None,
            }),
        }
    }
}

/// Query result together with the last block the indexer has processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedTransactions {
    pub transactions: Vec<IndexedTransaction>,
    pub block_number: u64,
}

#[async_trait]
pub trait TransactionIndexer: Send + Sync {
    /// Transactions stored in the data block `hash`.
    async fn transactions_by_hash(&self, hash: &str) -> Result<IndexedTransactions, IndexerError>;

    async fn transactions_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<IndexedTransactions, IndexerError>;

    /// Transactions tagged with any of `topics`.
    async fn transactions_by_topics(
        &self,
        topics: &[String],
    ) -> Result<IndexedTransactions, IndexerError>;

    /// Last block processed by the indexer.
    async fn block_number(&self) -> Result<u64, IndexerError>;
}
