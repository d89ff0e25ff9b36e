//! Block number and timestamp resolution for chains without a timestamp
//! index.
//!
//! Resolved block timestamps are cached forever since mined blocks never
//! change. Timestamp lookups first narrow the search window using cached
//! blocks and only then bisect over the network.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::Arc,
    time::Duration,
};

use anchor_storage_core::BlockNumbersInterval;
use parking_lot::{
    Mutex,
    RwLock,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{
    debug,
    trace,
};

use crate::{
    chain::{
        AnchorChain,
        ChainError,
    },
    metrics,
    utils::{
        RetryPolicy,
        retry,
        with_timeout,
    },
};

#[derive(Debug, Clone)]
pub struct BlockIndexConfig {
    /// Lowest block that can hold an anchor, usually the contract creation
    /// block.
    pub first_significant_block: u64,
    /// Minimum time between two live head lookups. Zero disables debouncing.
    pub last_block_number_delay: Duration,
    /// Budget for a single block or head request.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BlockIndexConfig {
    fn default() -> Self {
        Self {
            first_significant_block: 0,
            last_block_number_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::new(3, Duration::from_millis(250)),
        }
    }
}

#[derive(Debug, Error)]
pub enum BlockIndexError {
    #[error("Block {0} not found")]
    BlockNotFound(u64),
    #[error("Chain request failed: {0}")]
    Chain(#[from] ChainError),
    #[error("Failed to compute confirmations of block {block_number}")]
    ConfirmationLookupFailed {
        block_number: u64,
        #[source]
        source: Box<BlockIndexError>,
    },
}

pub struct BlockTimestampIndex {
    chain: Arc<dyn AnchorChain>,
    config: BlockIndexConfig,
    timestamps: RwLock<BTreeMap<u64, u64>>,
    /// Last observed head and when it was fetched.
    last_block: Mutex<Option<(Instant, u64)>>,
}

impl std::fmt::Debug for BlockTimestampIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTimestampIndex")
            .field("config", &self.config)
            .field("cached_blocks", &self.timestamps.read().len())
            .finish_non_exhaustive()
    }
}

impl BlockTimestampIndex {
    pub fn new(chain: Arc<dyn AnchorChain>, config: BlockIndexConfig) -> Self {
        Self {
            chain,
            config,
            timestamps: RwLock::new(BTreeMap::new()),
            last_block: Mutex::new(None),
        }
    }

    pub fn first_significant_block(&self) -> u64 {
        self.config.first_significant_block
    }

    pub fn cached_timestamp(&self, block_number: u64) -> Option<u64> {
        self.timestamps.read().get(&block_number).copied()
    }

    /// Timestamp of `block_number`, fetched once and cached.
    ///
    /// Concurrent lookups of the same uncached block may each hit the chain.
    /// The first value written wins and every caller returns it.
    pub async fn get_block_timestamp(&self, block_number: u64) -> Result<u64, BlockIndexError> {
        if let Some(timestamp) = self.cached_timestamp(block_number) {
            return Ok(timestamp);
        }

        let timestamp = retry(
            self.config.retry,
            "get_block_timestamp",
            |_: &ChainError| true,
            || {
                self.attempt(
                    "get_block_timestamp",
                    self.chain.block_timestamp(block_number),
                )
            },
        )
        .await?
        .ok_or(BlockIndexError::BlockNotFound(block_number))?;
        metrics::record_block_fetch();
        trace!(target: "blocks", block_number, timestamp, "Fetched block timestamp");

        Ok(*self
            .timestamps
            .write()
            .entry(block_number)
            .or_insert(timestamp))
    }

    /// Current head, re-fetched at most once per debounce window.
    pub async fn get_last_block_number(&self) -> Result<u64, BlockIndexError> {
        let delay = self.config.last_block_number_delay;
        let observed = *self.last_block.lock();
        match observed {
            Some((fetched_at, number)) if !delay.is_zero() && fetched_at.elapsed() < delay => {
                return Ok(number);
            }
            _ => {}
        }

        let number = retry(
            self.config.retry,
            "get_last_block_number",
            |_: &ChainError| true,
            || self.attempt("get_last_block_number", self.chain.block_number()),
        )
        .await?;
        *self.last_block.lock() = Some((Instant::now(), number));

        Ok(number)
    }

    pub async fn get_second_last_block_number(&self) -> Result<u64, BlockIndexError> {
        Ok(self.get_last_block_number().await?.saturating_sub(1))
    }

    /// Blocks mined on top of `block_number`.
    pub async fn get_confirmation_number(&self, block_number: u64) -> Result<u64, BlockIndexError> {
        match self.get_last_block_number().await {
            Ok(last) => Ok(last.saturating_sub(block_number)),
            Err(source) => {
                Err(BlockIndexError::ConfirmationLookupFailed {
                    block_number,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Tightest pair of blocks around `timestamp`.
    ///
    /// Timestamps outside the range between the first significant block and
    /// the head are clamped to the nearest of the two.
    pub async fn get_block_numbers_from_timestamp(
        &self,
        timestamp: u64,
    ) -> Result<BlockNumbersInterval, BlockIndexError> {
        let first = self.config.first_significant_block;
        let first_timestamp = self.get_block_timestamp(first).await?;
        let last = self.get_last_block_number().await?;
        let last_timestamp = self.get_block_timestamp(last).await?;

        if timestamp <= first_timestamp {
            return Ok(interval(first, first));
        }
        if timestamp >= last_timestamp {
            return Ok(interval(last, last));
        }

        let (mut low, mut high) = (first, last);
        {
            let cache = self.timestamps.read();
            for (&block, &block_timestamp) in cache.range(first..=last) {
                if block_timestamp == timestamp {
                    return Ok(interval(block, block));
                }
                if block_timestamp > timestamp {
                    high = block;
                    break;
                }
                low = block;
            }
        }
        debug!(target: "blocks", timestamp, low, high, "Bisecting block range");

        while high - low > 1 {
            let middle = low + (high - low) / 2;
            let middle_timestamp = self.get_block_timestamp(middle).await?;
            match middle_timestamp.cmp(&timestamp) {
                std::cmp::Ordering::Equal => return Ok(interval(middle, middle)),
                std::cmp::Ordering::Less => low = middle,
                std::cmp::Ordering::Greater => high = middle,
            }
        }

        Ok(interval(low, high))
    }

    /// One chain request bounded by the configured timeout. Timeouts are
    /// retried like any other chain failure.
    async fn attempt<T>(
        &self,
        operation: &'static str,
        request: impl Future<Output = Result<T, ChainError>>,
    ) -> Result<T, ChainError> {
        let after = self.config.timeout;
        with_timeout(after, request, || ChainError::Timeout { operation, after }).await
    }
}

fn interval(block_before: u64, block_after: u64) -> BlockNumbersInterval {
    BlockNumbersInterval {
        block_before,
        block_after,
    }
}
