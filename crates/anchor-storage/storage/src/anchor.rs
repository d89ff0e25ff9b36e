//! Submission and replay of content anchors.

use std::{
    sync::Arc,
    time::Duration,
};

use alloy::primitives::{
    Address,
    B256,
    U256,
};
use anchor_storage_core::{
    AnchorMetadata,
    AnchorRecord,
    ContentId,
    TimestampBoundaries,
};
use futures::{
    StreamExt,
    TryStreamExt,
    stream,
};
use thiserror::Error;
use tracing::{
    debug,
    info,
    instrument,
};

use crate::{
    blocks::{
        BlockIndexError,
        BlockTimestampIndex,
    },
    chain::{
        AnchorChain,
        AnchorSubmission,
        AnchorSubmittedEvent,
        ChainError,
        ChainEvent,
    },
    metrics,
    utils::{
        RetryPolicy,
        retry,
        with_timeout,
    },
};

/// Blocks an anchor transaction must have on top of it before its
/// submission resolves.
pub const ANCHOR_CONFIRMATIONS: u64 = 6;

pub const ANCHOR_GAS_LIMIT: u64 = 100_000;

/// Events enriched with metadata concurrently while listing.
const METADATA_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub struct AnchorClientConfig {
    pub network_name: String,
    pub contract_address: Address,
    pub creation_block_number: u64,
    /// Budget for account, fee and event queries.
    pub timeout: Duration,
    /// Gas price in wei. The node's suggestion is used when unset.
    pub gas_price: Option<u128>,
    /// Applied to metadata lookups after a submission.
    pub retry: RetryPolicy,
}

impl Default for AnchorClientConfig {
    fn default() -> Self {
        Self {
            network_name: "private".to_string(),
            contract_address: Address::ZERO,
            creation_block_number: 0,
            timeout: Duration::from_secs(10),
            gas_price: None,
            retry: RetryPolicy::new(3, Duration::from_millis(250)),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("No account found")]
    NoAccountFound,
    #[error("Content {0} is not anchored")]
    NotIndexed(ContentId),
    #[error("Invalid block range: {from_block} > {to_block}")]
    InvalidRange { from_block: u64, to_block: u64 },
    #[error("Malformed anchor event in block {block_number}: {reason}")]
    MalformedEvent {
        block_number: u64,
        reason: &'static str,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Blocks(#[from] BlockIndexError),
}

/// Anchors `(hash, size)` pairs on chain and replays them.
pub struct AnchorClient {
    chain: Arc<dyn AnchorChain>,
    blocks: Arc<BlockTimestampIndex>,
    config: AnchorClientConfig,
}

impl std::fmt::Debug for AnchorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AnchorClient {
    pub fn new(
        chain: Arc<dyn AnchorChain>,
        blocks: Arc<BlockTimestampIndex>,
        config: AnchorClientConfig,
    ) -> Self {
        Self {
            chain,
            blocks,
            config,
        }
    }

    pub fn config(&self) -> &AnchorClientConfig {
        &self.config
    }

    /// First account of the node, used to send anchor transactions.
    pub async fn get_main_account(&self) -> Result<Address, AnchorError> {
        let accounts = with_timeout(
            self.config.timeout,
            async { self.chain.accounts().await.map_err(AnchorError::from) },
            || {
                AnchorError::Timeout {
                    operation: "get_main_account",
                    after: self.config.timeout,
                }
            },
        )
        .await?;

        accounts.first().copied().ok_or(AnchorError::NoAccountFound)
    }

    /// Anchors `hash` with its `size` and resolves once the transaction has
    /// [`ANCHOR_CONFIRMATIONS`] confirmations.
    ///
    /// `gas_price` overrides the configured gas price for this submission.
    #[instrument(skip(self), level = "debug")]
    pub async fn add_hash_and_size_to_anchor(
        &self,
        hash: &str,
        size: u64,
        gas_price: Option<u128>,
    ) -> Result<AnchorMetadata, AnchorError> {
        let from = self.get_main_account().await?;
        let fee = with_timeout(
            self.config.timeout,
            async { self.chain.estimate_fee(size).await.map_err(AnchorError::from) },
            || {
                AnchorError::Timeout {
                    operation: "estimate_fee",
                    after: self.config.timeout,
                }
            },
        )
        .await?;
        let gas_price = match gas_price.or(self.config.gas_price) {
            Some(gas_price) => gas_price,
            None => {
                with_timeout(
                    self.config.timeout,
                    async { self.chain.gas_price().await.map_err(AnchorError::from) },
                    || {
                        AnchorError::Timeout {
                            operation: "gas_price",
                            after: self.config.timeout,
                        }
                    },
                )
                .await?
            }
        };

        let receipt = self
            .chain
            .submit_anchor(AnchorSubmission {
                from,
                hash: hash.to_string(),
                size,
                fee,
                gas_price,
                gas_limit: ANCHOR_GAS_LIMIT,
                confirmations: ANCHOR_CONFIRMATIONS,
            })
            .await?;
        metrics::record_anchor_submitted();

        let mut meta = retry(
            self.config.retry,
            "create_metadata",
            |_: &AnchorError| true,
            || self.create_metadata(receipt.block_number, receipt.transaction_hash),
        )
        .await?;

        let gas_fee = U256::from(receipt.gas_used) * U256::from(gas_price);
        meta.gas_fee = Some(gas_fee);
        meta.fee = Some(fee);
        meta.cost = Some(gas_fee + fee);

        info!(
            target: "anchor",
            content_id = hash,
            size,
            block_number = meta.block_number,
            transaction_hash = %meta.transaction_hash,
            "Content anchored"
        );
        Ok(meta)
    }

    /// Metadata of the earliest anchor of `hash`.
    pub async fn get_meta_from_anchor(&self, hash: &str) -> Result<AnchorMetadata, AnchorError> {
        let events = with_timeout(
            self.config.timeout,
            async {
                let head = self.blocks.get_last_block_number().await?;
                let events = self
                    .past_events(self.config.creation_block_number, head)
                    .await?;
                Ok::<_, AnchorError>(events)
            },
            || {
                AnchorError::Timeout {
                    operation: "get_meta_from_anchor",
                    after: self.config.timeout,
                }
            },
        )
        .await?;

        let event = events
            .into_iter()
            .find_map(|event| {
                match event {
                    ChainEvent::AnchorSubmitted(event) if event.hash.as_deref() == Some(hash) => {
                        Some(event)
                    }
                    _ => None,
                }
            })
            .ok_or_else(|| AnchorError::NotIndexed(hash.to_string()))?;

        self.create_metadata(event.block_number, event.transaction_hash)
            .await
    }

    /// Every anchor within `boundaries`, in chain order.
    ///
    /// Duplicate anchors of the same content are all returned.
    pub async fn get_hashes_and_sizes_from_anchor(
        &self,
        boundaries: Option<TimestampBoundaries>,
    ) -> Result<Vec<AnchorRecord>, AnchorError> {
        let boundaries = boundaries.unwrap_or_default();
        let from_block = match boundaries.from {
            Some(from) => {
                self.blocks
                    .get_block_numbers_from_timestamp(from)
                    .await?
                    .block_after
            }
            None => self.config.creation_block_number,
        };
        let to_block = match boundaries.to {
            Some(to) => {
                self.blocks
                    .get_block_numbers_from_timestamp(to)
                    .await?
                    .block_before
            }
            None => self.blocks.get_last_block_number().await?,
        };
        if to_block < from_block {
            return Err(AnchorError::InvalidRange {
                from_block,
                to_block,
            });
        }

        let events = with_timeout(
            self.config.timeout,
            self.past_events(from_block, to_block),
            || {
                AnchorError::Timeout {
                    operation: "get_past_events",
                    after: self.config.timeout,
                }
            },
        )
        .await?;

        let anchors = events
            .into_iter()
            .filter_map(|event| {
                match event {
                    ChainEvent::AnchorSubmitted(event) => Some(validate_event(event)),
                    ChainEvent::Other { name, block_number } => {
                        debug!(target: "anchor", %name, block_number, "Ignoring unrelated event");
                        None
                    }
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(target: "anchor", from_block, to_block, count = anchors.len(), "Replayed anchors");

        stream::iter(anchors)
            .map(|(hash, size, event)| {
                async move {
                    let meta = self
                        .create_metadata(event.block_number, event.transaction_hash)
                        .await?;
                    Ok::<_, AnchorError>(AnchorRecord { hash, size, meta })
                }
            })
            .buffered(METADATA_CONCURRENCY)
            .try_collect()
            .await
    }

    /// Contract events between two blocks, splitting the range whenever the
    /// node refuses to return that many logs at once.
    async fn past_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, AnchorError> {
        let mut ranges = vec![(from_block, to_block)];
        let mut events = Vec::new();

        while let Some((from, to)) = ranges.pop() {
            match self.chain.past_events(from, to).await {
                Ok(batch) => events.extend(batch),
                Err(ChainError::TooManyResults) if to > from => {
                    let middle = from + (to - from) / 2;
                    debug!(target: "anchor", from, to, "Splitting event query");
                    // popped in ascending order
                    ranges.push((middle + 1, to));
                    ranges.push((from, middle));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(events)
    }

    async fn create_metadata(
        &self,
        block_number: u64,
        transaction_hash: B256,
    ) -> Result<AnchorMetadata, AnchorError> {
        let (block_confirmation, block_timestamp) = tokio::try_join!(
            self.blocks.get_confirmation_number(block_number),
            self.blocks.get_block_timestamp(block_number),
        )?;

        Ok(AnchorMetadata {
            block_confirmation,
            block_number,
            block_timestamp,
            network_name: self.config.network_name.clone(),
            smart_contract_address: self.config.contract_address,
            transaction_hash,
            cost: None,
            fee: None,
            gas_fee: None,
        })
    }
}

/// Rejects anchor events missing their hash or size. Empty hashes and zero
/// sizes are accepted.
fn validate_event(
    event: AnchorSubmittedEvent,
) -> Result<(ContentId, u64, AnchorSubmittedEvent), AnchorError> {
    let malformed = |reason| {
        AnchorError::MalformedEvent {
            block_number: event.block_number,
            reason,
        }
    };
    let hash = event.hash.clone().ok_or_else(|| malformed("missing hash"))?;
    let size = event.size.ok_or_else(|| malformed("missing size"))?;
    let size = u64::try_from(size).map_err(|_| malformed("size does not fit in 64 bits"))?;
    Ok((hash, size, event))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        blocks::BlockIndexConfig,
        chain::mock::{
            MockCall,
            MockChain,
        },
    };

    const GENESIS: u64 = 1_600_000_000;

    fn setup(blocks: u64) -> (Arc<MockChain>, AnchorClient) {
        let chain = Arc::new(MockChain::with_blocks(blocks, GENESIS));
        let index = Arc::new(BlockTimestampIndex::new(
            chain.clone(),
            BlockIndexConfig {
                first_significant_block: 0,
                last_block_number_delay: Duration::ZERO,
                retry: RetryPolicy::none(),
                ..Default::default()
            },
        ));
        let client = AnchorClient::new(
            chain.clone(),
            index,
            AnchorClientConfig {
                network_name: "private".to_string(),
                contract_address: Address::with_last_byte(0x42),
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        (chain, client)
    }

    #[tokio::test]
    async fn test_main_account() {
        let (chain, client) = setup(10);
        assert_eq!(
            client.get_main_account().await.unwrap(),
            Address::with_last_byte(0xaa)
        );

        chain.set_accounts(vec![]);
        assert_matches!(
            client.get_main_account().await,
            Err(AnchorError::NoAccountFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_main_account_times_out() {
        let (chain, client) = setup(10);
        chain.set_response_delay(Duration::from_secs(5));

        assert_matches!(
            client.get_main_account().await,
            Err(AnchorError::Timeout {
                operation: "get_main_account",
                ..
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fee_estimation_times_out() {
        let (chain, client) = setup(10);
        chain.delay_call(MockCall::EstimateFee, Duration::from_secs(5));

        assert_matches!(
            client.add_hash_and_size_to_anchor("QmHash", 1, None).await,
            Err(AnchorError::Timeout {
                operation: "estimate_fee",
                ..
            })
        );
        assert!(chain.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_gas_price_times_out() {
        let (chain, client) = setup(10);
        chain.delay_call(MockCall::GasPrice, Duration::from_secs(5));

        assert_matches!(
            client.add_hash_and_size_to_anchor("QmHash", 1, None).await,
            Err(AnchorError::Timeout {
                operation: "gas_price",
                ..
            })
        );

        // a configured gas price skips the node
        client
            .add_hash_and_size_to_anchor("QmHash", 1, Some(3))
            .await
            .unwrap();
        assert_eq!(chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_submission_waits_for_confirmations_and_prices_the_anchor() {
        let (chain, client) = setup(10);
        chain.set_gas(50_000, 2);
        chain.set_fee_per_byte(U256::from(3));

        let meta = client
            .add_hash_and_size_to_anchor("QmHash", 100, None)
            .await
            .unwrap();

        assert_eq!(meta.block_number, 10);
        assert_eq!(meta.block_confirmation, ANCHOR_CONFIRMATIONS);
        assert_eq!(meta.block_timestamp, chain.timestamp_of(10).unwrap());
        assert_eq!(meta.fee, Some(U256::from(300)));
        assert_eq!(meta.gas_fee, Some(U256::from(100_000)));
        assert_eq!(meta.cost, Some(U256::from(100_300)));
        assert_eq!(meta.smart_contract_address, Address::with_last_byte(0x42));

        let submission = &chain.submissions()[0];
        assert_eq!(submission.gas_limit, ANCHOR_GAS_LIMIT);
        assert_eq!(submission.gas_price, 2);
        assert_eq!(submission.fee, U256::from(300));
    }

    #[tokio::test]
    async fn test_explicit_gas_price_wins() {
        let (chain, client) = setup(10);

        client
            .add_hash_and_size_to_anchor("QmHash", 1, Some(7))
            .await
            .unwrap();
        assert_eq!(chain.submissions()[0].gas_price, 7);
    }

    #[tokio::test]
    async fn test_failed_transaction_is_rejected() {
        let (chain, client) = setup(10);
        chain.fail_submissions("execution reverted");

        assert_matches!(
            client.add_hash_and_size_to_anchor("QmHash", 1, None).await,
            Err(AnchorError::Chain(ChainError::TransactionFailed(_)))
        );
    }

    #[tokio::test]
    async fn test_meta_from_first_anchor() {
        let (chain, client) = setup(20);
        chain.push_anchor(3, "QmOther", 5);
        let first = chain.push_anchor(5, "QmHash", 10);
        chain.push_anchor(8, "QmHash", 10);

        let meta = client.get_meta_from_anchor("QmHash").await.unwrap();
        assert_eq!(meta.block_number, 5);
        assert_eq!(meta.transaction_hash, first);
        assert_eq!(meta.block_confirmation, 14);
    }

    #[tokio::test]
    async fn test_meta_of_unknown_hash() {
        let (_chain, client) = setup(20);

        assert_matches!(
            client.get_meta_from_anchor("QmMissing").await,
            Err(AnchorError::NotIndexed(hash)) if hash == "QmMissing"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_lookup_times_out() {
        let (chain, client) = setup(20);
        chain.push_anchor(5, "QmHash", 10);
        chain.delay_call(MockCall::PastEvents, Duration::from_secs(3600));

        let started = tokio::time::Instant::now();
        assert_matches!(
            client.get_meta_from_anchor("QmHash").await,
            Err(AnchorError::Timeout {
                operation: "get_meta_from_anchor",
                ..
            })
        );
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_lookup_with_stalled_head_times_out() {
        let (chain, client) = setup(20);
        chain.push_anchor(5, "QmHash", 10);
        chain.delay_call(MockCall::BlockNumber, Duration::from_secs(3600));

        assert_matches!(
            client.get_meta_from_anchor("QmHash").await,
            Err(AnchorError::Timeout {
                operation: "get_meta_from_anchor",
                ..
            })
        );
    }

    #[tokio::test]
    async fn test_listing_filters_unrelated_events_and_keeps_duplicates() {
        let (chain, client) = setup(20);
        chain.push_anchor(2, "QmA", 1);
        chain.push_event(ChainEvent::Other {
            name: "OwnershipTransferred".to_string(),
            block_number: 3,
        });
        chain.push_anchor(4, "QmA", 1);
        chain.push_anchor(6, "", 0);

        let records = client.get_hashes_and_sizes_from_anchor(None).await.unwrap();
        let summary: Vec<(&str, u64, u64)> = records
            .iter()
            .map(|r| (r.hash.as_str(), r.size, r.meta.block_number))
            .collect();

        assert_eq!(summary, vec![("QmA", 1, 2), ("QmA", 1, 4), ("", 0, 6)]);
        assert_eq!(records[0].meta.block_timestamp, GENESIS + 2 * 12);
    }

    #[tokio::test]
    async fn test_listing_rejects_events_missing_fields() {
        let (chain, client) = setup(20);
        chain.push_event(ChainEvent::AnchorSubmitted(AnchorSubmittedEvent {
            block_number: 4,
            transaction_hash: B256::ZERO,
            hash: Some("QmA".to_string()),
            size: None,
        }));

        assert_matches!(
            client.get_hashes_and_sizes_from_anchor(None).await,
            Err(AnchorError::MalformedEvent {
                block_number: 4,
                reason: "missing size"
            })
        );
    }

    #[tokio::test]
    async fn test_listing_by_time_range() {
        let (chain, client) = setup(20);
        for block in [2, 5, 9, 15] {
            chain.push_anchor(block, &format!("Qm{block}"), 1);
        }

        let from = GENESIS + 4 * 12 + 1; // just after block 4
        let to = GENESIS + 10 * 12 - 1; // just before block 10
        let records = client
            .get_hashes_and_sizes_from_anchor(Some(TimestampBoundaries::new(Some(from), Some(to))))
            .await
            .unwrap();

        let hashes: Vec<&str> = records.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes, vec!["Qm5", "Qm9"]);
    }

    #[tokio::test]
    async fn test_inverted_time_range() {
        let (_chain, client) = setup(20);

        let from = GENESIS + 10 * 12 + 1;
        let to = GENESIS + 10 * 12 + 2;
        assert_matches!(
            client
                .get_hashes_and_sizes_from_anchor(Some(TimestampBoundaries::new(
                    Some(from),
                    Some(to)
                )))
                .await,
            Err(AnchorError::InvalidRange {
                from_block: 11,
                to_block: 10
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_event_fetch_times_out() {
        let (chain, client) = setup(20);
        chain.push_anchor(2, "QmA", 1);
        chain.delay_call(MockCall::PastEvents, Duration::from_secs(3600));

        assert_matches!(
            client.get_hashes_and_sizes_from_anchor(None).await,
            Err(AnchorError::Timeout {
                operation: "get_past_events",
                after,
            }) if after == Duration::from_secs(1)
        );
        assert_eq!(chain.log_queries(), 1);
    }

    #[tokio::test]
    async fn test_oversized_log_queries_are_split() {
        let (chain, client) = setup(64);
        for block in 0..40 {
            chain.push_anchor(block, &format!("Qm{block}"), 1);
        }
        chain.set_max_logs(8);

        let records = client.get_hashes_and_sizes_from_anchor(None).await.unwrap();

        let blocks: Vec<u64> = records.iter().map(|r| r.meta.block_number).collect();
        assert_eq!(blocks, (0..40).collect::<Vec<_>>());
        assert!(chain.log_queries() > 1);
    }
}
