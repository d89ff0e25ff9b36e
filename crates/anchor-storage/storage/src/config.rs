//! Command-line and environment configuration.

use std::{
    sync::Arc,
    time::Duration,
};

use alloy::primitives::Address;
use anchor_storage_ipfs::{
    IpfsClient,
    IpfsConfig,
};
use anyhow::Context;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::{
    anchor::{
        AnchorClient,
        AnchorClientConfig,
    },
    blocks::{
        BlockIndexConfig,
        BlockTimestampIndex,
    },
    chain::AlloyAnchorChain,
    data_access::{
        IndexedDataAccess,
        IndexedDataAccessConfig,
    },
    indexer::{
        SubgraphIndexer,
        SubgraphIndexerConfig,
    },
    storage::AnchoredStorage,
    utils::RetryPolicy,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Base URL of the IPFS HTTP API.
    #[arg(long, env = "ANCHOR_STORAGE_IPFS_URL", default_value = "http://localhost:5001")]
    pub ipfs_url: String,

    #[arg(long, env = "ANCHOR_STORAGE_IPFS_TIMEOUT_MS", default_value = "10000")]
    pub ipfs_timeout_ms: u64,

    #[arg(long, env = "ANCHOR_STORAGE_IPFS_MAX_RETRIES", default_value = "3")]
    pub ipfs_max_retries: u32,

    #[arg(long, env = "ANCHOR_STORAGE_IPFS_RETRY_DELAY_MS", default_value = "100")]
    pub ipfs_retry_delay_ms: u64,

    /// Multiaddrs the IPFS node connects to on startup, comma separated.
    #[arg(long, env = "ANCHOR_STORAGE_IPFS_BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub ipfs_bootstrap_peers: Vec<String>,

    #[arg(long, env = "ANCHOR_STORAGE_RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: Url,

    /// Address of the anchoring contract.
    #[arg(long, env = "ANCHOR_STORAGE_CONTRACT_ADDRESS")]
    pub contract_address: Address,

    /// Block the anchoring contract was created in.
    #[arg(long, env = "ANCHOR_STORAGE_CREATION_BLOCK", default_value = "0")]
    pub creation_block: u64,

    #[arg(long, env = "ANCHOR_STORAGE_NETWORK_NAME", default_value = "private")]
    pub network_name: String,

    /// Gas price in wei. The node's suggestion is used when unset.
    #[arg(long, env = "ANCHOR_STORAGE_GAS_PRICE")]
    pub gas_price: Option<u128>,

    #[arg(long, env = "ANCHOR_STORAGE_CHAIN_TIMEOUT_MS", default_value = "10000")]
    pub chain_timeout_ms: u64,

    /// How long to wait for an anchor transaction to be confirmed.
    #[arg(long, env = "ANCHOR_STORAGE_RECEIPT_TIMEOUT_MS", default_value = "300000")]
    pub receipt_timeout_ms: u64,

    #[arg(long, env = "ANCHOR_STORAGE_LAST_BLOCK_DELAY_MS", default_value = "10000")]
    pub last_block_delay_ms: u64,

    #[arg(long, env = "ANCHOR_STORAGE_BLOCK_MAX_RETRIES", default_value = "3")]
    pub block_max_retries: u32,

    #[arg(long, env = "ANCHOR_STORAGE_BLOCK_RETRY_DELAY_MS", default_value = "250")]
    pub block_retry_delay_ms: u64,

    /// GraphQL endpoint of the transaction indexer. Channel commands need it.
    #[arg(long, env = "ANCHOR_STORAGE_INDEXER_URL")]
    pub indexer_url: Option<String>,

    #[arg(long, env = "ANCHOR_STORAGE_INDEXER_MAX_RETRIES", default_value = "100")]
    pub indexer_max_retries: u32,

    #[arg(long, env = "ANCHOR_STORAGE_INDEXER_RETRY_DELAY_MS", default_value = "1000")]
    pub indexer_retry_delay_ms: u64,

    #[arg(long, env = "ANCHOR_STORAGE_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

impl Config {
    pub fn ipfs_config(&self) -> IpfsConfig {
        IpfsConfig {
            url: self.ipfs_url.clone(),
            timeout: Duration::from_millis(self.ipfs_timeout_ms),
            max_retries: self.ipfs_max_retries,
            delay_between_retries: Duration::from_millis(self.ipfs_retry_delay_ms),
        }
    }

    pub fn block_index_config(&self) -> BlockIndexConfig {
        BlockIndexConfig {
            first_significant_block: self.creation_block,
            last_block_number_delay: Duration::from_millis(self.last_block_delay_ms),
            timeout: Duration::from_millis(self.chain_timeout_ms),
            retry: RetryPolicy::new(
                self.block_max_retries,
                Duration::from_millis(self.block_retry_delay_ms),
            ),
        }
    }

    pub fn anchor_client_config(&self) -> AnchorClientConfig {
        AnchorClientConfig {
            network_name: self.network_name.clone(),
            contract_address: self.contract_address,
            creation_block_number: self.creation_block,
            timeout: Duration::from_millis(self.chain_timeout_ms),
            gas_price: self.gas_price,
            retry: RetryPolicy::new(
                self.block_max_retries,
                Duration::from_millis(self.block_retry_delay_ms),
            ),
        }
    }

    pub fn data_access_config(&self) -> IndexedDataAccessConfig {
        IndexedDataAccessConfig {
            network_name: self.network_name.clone(),
            poll: RetryPolicy::new(
                self.indexer_max_retries,
                Duration::from_millis(self.indexer_retry_delay_ms),
            ),
        }
    }

    /// Wires the IPFS client and the chain connection into an
    /// [`AnchoredStorage`]. Nothing is contacted until the storage is used.
    pub fn build_storage(&self) -> anyhow::Result<AnchoredStorage> {
        let ipfs = IpfsClient::new(self.ipfs_config()).context("invalid IPFS configuration")?;
        let chain = Arc::new(AlloyAnchorChain::new(
            self.rpc_url.clone(),
            self.contract_address,
            Duration::from_millis(self.receipt_timeout_ms),
        ));
        let blocks = Arc::new(BlockTimestampIndex::new(
            chain.clone(),
            self.block_index_config(),
        ));
        let anchor = Arc::new(AnchorClient::new(
            chain,
            blocks.clone(),
            self.anchor_client_config(),
        ));

        Ok(AnchoredStorage::new(Arc::new(ipfs), anchor, blocks)
            .with_bootstrap_peers(self.ipfs_bootstrap_peers.clone()))
    }

    /// Data access over `storage` and the configured indexer.
    pub fn build_data_access(
        &self,
        storage: Arc<AnchoredStorage>,
    ) -> anyhow::Result<IndexedDataAccess> {
        let graphql_url = self
            .indexer_url
            .clone()
            .context("--indexer-url is required for channel access")?;
        let indexer = SubgraphIndexer::new(SubgraphIndexerConfig {
            graphql_url,
            timeout: Duration::from_millis(self.chain_timeout_ms),
        });

        Ok(IndexedDataAccess::new(
            storage,
            Arc::new(indexer),
            self.data_access_config(),
        ))
    }
}
