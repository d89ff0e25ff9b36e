//! Boundary between the anchoring logic and the chain it anchors on.
//!
//! [`AnchorChain`] exposes only the calls the anchor client needs. Raw logs
//! are converted into [`ChainEvent`]s here so nothing untyped reaches the
//! client.

use std::time::Duration;

use alloy::primitives::{
    Address,
    B256,
    U256,
};
use async_trait::async_trait;
use thiserror::Error;

mod rpc;

#[cfg(any(test, feature = "test"))]
pub mod mock;

pub use rpc::AlloyAnchorChain;

/// Name of the event emitted for every anchored content hash.
pub const ANCHOR_EVENT_NAME: &str = "AnchorSubmitted";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("RPC request failed: {0}")]
    Rpc(String),
    #[error("Log query matched too many results")]
    TooManyResults,
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// An `AnchorSubmitted` log.
///
/// `hash` and `size` are `None` when the log data could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorSubmittedEvent {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub hash: Option<String>,
    pub size: Option<U256>,
}

/// A log emitted by the anchor contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    AnchorSubmitted(AnchorSubmittedEvent),
    Other { name: String, block_number: u64 },
}

impl ChainEvent {
    pub fn block_number(&self) -> u64 {
        match self {
            Self::AnchorSubmitted(event) => event.block_number,
            Self::Other { block_number, .. } => *block_number,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::AnchorSubmitted(_) => ANCHOR_EVENT_NAME,
            Self::Other { name, .. } => name,
        }
    }
}

/// Anchor transaction to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorSubmission {
    pub from: Address,
    pub hash: String,
    pub size: u64,
    /// Protocol fee sent as the transaction value.
    pub fee: U256,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// Blocks to wait for on top of the inclusion block.
    pub confirmations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
}

#[async_trait]
pub trait AnchorChain: Send + Sync {
    /// Timestamp of block `number`, `None` if the chain has no such block.
    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn accounts(&self) -> Result<Vec<Address>, ChainError>;

    /// Node's suggested gas price in wei.
    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Fee the anchor contract charges for content of `size` bytes.
    async fn estimate_fee(&self, size: u64) -> Result<U256, ChainError>;

    /// Sends the anchor transaction and resolves once it has the requested
    /// number of confirmations.
    async fn submit_anchor(&self, submission: AnchorSubmission)
    -> Result<AnchorReceipt, ChainError>;

    /// Logs of the anchor contract between `from_block` and `to_block`
    /// inclusive, in chain order.
    async fn past_events(&self, from_block: u64, to_block: u64)
    -> Result<Vec<ChainEvent>, ChainError>;
}
