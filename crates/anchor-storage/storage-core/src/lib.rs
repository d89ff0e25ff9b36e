//! Data model shared by the anchoring crates.
//!
//! Field names serialize in camelCase so records can be exchanged with the
//! indexer and persisted blocks without a translation layer.

use std::collections::BTreeMap;

use alloy::primitives::{
    Address,
    B256,
    U256,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Content address returned by the blob store.
pub type ContentId = String;

/// Version written into the header of every [`DataBlock`].
pub const DATA_BLOCK_VERSION: &str = "0.1.0";

/// Tightest pair of blocks bracketing a timestamp.
///
/// Both fields hold the same block when the timestamp matches a block exactly
/// or falls outside the searchable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNumbersInterval {
    pub block_before: u64,
    pub block_after: u64,
}

/// Optional unix timestamp range used to filter anchor listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampBoundaries {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl TimestampBoundaries {
    pub fn new(from: Option<u64>, to: Option<u64>) -> Self {
        Self { from, to }
    }

    /// Whether `timestamp` lies inside the boundaries, both ends inclusive.
    pub fn contains(&self, timestamp: u64) -> bool {
        self.from.is_none_or(|from| timestamp >= from) && self.to.is_none_or(|to| timestamp <= to)
    }
}

/// Anchor metadata enriched with chain state at lookup time.
///
/// `block_confirmation` is relative to the head observed when the metadata was
/// built, so it goes stale as new blocks are mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorMetadata {
    pub block_confirmation: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub network_name: String,
    pub smart_contract_address: Address,
    pub transaction_hash: B256,
    /// `gas_fee + fee`, only known for submissions made by this process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_fee: Option<U256>,
}

/// A content hash and declared size anchored on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRecord {
    pub hash: ContentId,
    pub size: u64,
    pub meta: AnchorMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    EthereumIpfs,
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageState {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpfsMeta {
    pub size: u64,
}

/// Where and when a piece of content was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMeta {
    pub storage_type: StorageType,
    pub state: StorageState,
    /// Block timestamp once anchored, wall clock while pending.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipfs: Option<IpfsMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethereum: Option<AnchorMetadata>,
}

/// Content together with its address and storage metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContent {
    pub id: ContentId,
    pub content: String,
    pub meta: StorageMeta,
}

/// A transaction written to a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<BTreeMap<String, String>>,
}

impl Transaction {
    pub fn clear(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBlockHeader {
    /// Channel id to the indexes of its transactions in the block.
    pub channel_ids: BTreeMap<String, Vec<usize>>,
    pub topics: BTreeMap<String, Vec<String>>,
    pub version: String,
}

/// The unit of content written to the blob store by the indexed write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlock {
    pub header: DataBlockHeader,
    pub transactions: Vec<Transaction>,
}

impl DataBlock {
    /// Block holding a single transaction for `channel_id`.
    pub fn single(transaction: Transaction, channel_id: &str, topics: Vec<String>) -> Self {
        Self {
            header: DataBlockHeader {
                channel_ids: BTreeMap::from([(channel_id.to_string(), vec![0])]),
                topics: BTreeMap::from([(channel_id.to_string(), topics)]),
                version: DATA_BLOCK_VERSION.to_string(),
            },
            transactions: vec![transaction],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionState {
    Pending,
    Confirmed,
}

/// A channel transaction together with when it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampedTransaction {
    pub state: TransactionState,
    pub timestamp: u64,
    pub transaction: Transaction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn data_block_serializes_with_camel_case_header() {
        let block = DataBlock::single(
            Transaction::clear("payload"),
            "channel-1",
            vec!["topic-a".to_string()],
        );

        let json = serde_json::to_value(&block).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "header": {
                    "channelIds": { "channel-1": [0] },
                    "topics": { "channel-1": ["topic-a"] },
                    "version": "0.1.0",
                },
                "transactions": [{ "data": "payload" }],
            })
        );
    }

    #[test]
    fn timestamp_boundaries_are_inclusive() {
        let boundaries = TimestampBoundaries::new(Some(10), Some(20));

        assert!(boundaries.contains(10));
        assert!(boundaries.contains(20));
        assert!(!boundaries.contains(9));
        assert!(!boundaries.contains(21));
        assert!(TimestampBoundaries::default().contains(0));
    }

    #[test]
    fn metadata_omits_unknown_costs() {
        let meta = AnchorMetadata {
            block_confirmation: 2,
            block_number: 7,
            block_timestamp: 1_000,
            network_name: "private".to_string(),
            smart_contract_address: Address::ZERO,
            transaction_hash: B256::ZERO,
            cost: None,
            fee: None,
            gas_fee: None,
        };

        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("cost").is_none());
        assert_eq!(json["blockConfirmation"], 2);

        let back: AnchorMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}
