use std::time::Duration;

use alloy::{
    network::TransactionBuilder,
    primitives::{
        Address,
        B256,
        U256,
    },
    providers::{
        Provider,
        ProviderBuilder,
        RootProvider,
    },
    rpc::types::{
        Filter,
        Log,
        TransactionRequest,
    },
    sol,
    sol_types::{
        SolCall,
        SolEvent,
    },
};
use async_trait::async_trait;
use tracing::{
    debug,
    info,
};
use url::Url;

use super::{
    AnchorChain,
    AnchorReceipt,
    AnchorSubmission,
    AnchorSubmittedEvent,
    ChainError,
    ChainEvent,
};

sol! {
    event AnchorSubmitted(string hash, uint256 size);

    function estimateFee(uint256 size) external view returns (uint256);
    function submitHash(string hash, uint256 size) external payable;
}

/// Node error fragments returned when a log query covers too many results.
const TOO_MANY_RESULTS: [&str; 4] = [
    "query returned more than",
    "log response size exceeded",
    "block range is too wide",
    "exceed maximum block range",
];

/// [`AnchorChain`] backed by a JSON-RPC node through alloy.
#[derive(Debug, Clone)]
pub struct AlloyAnchorChain {
    provider: RootProvider,
    contract: Address,
    receipt_timeout: Duration,
}

impl AlloyAnchorChain {
    pub fn new(rpc_url: Url, contract: Address, receipt_timeout: Duration) -> Self {
        let provider = ProviderBuilder::new().connect_http(rpc_url).root().clone();
        Self {
            provider,
            contract,
            receipt_timeout,
        }
    }

    fn convert_log(&self, log: &Log) -> ChainEvent {
        let block_number = log.block_number.unwrap_or_default();
        let topic = log.topics().first().copied();

        if topic != Some(AnchorSubmitted::SIGNATURE_HASH) {
            return ChainEvent::Other {
                name: topic.map(|t| t.to_string()).unwrap_or_default(),
                block_number,
            };
        }

        let transaction_hash = log.transaction_hash.unwrap_or(B256::ZERO);
        match log.log_decode::<AnchorSubmitted>() {
            Ok(decoded) => {
                let AnchorSubmitted { hash, size } = decoded.inner.data;
                ChainEvent::AnchorSubmitted(AnchorSubmittedEvent {
                    block_number,
                    transaction_hash,
                    hash: Some(hash),
                    size: Some(size),
                })
            }
            Err(err) => {
                debug!(target: "chain", %transaction_hash, error = %err, "Undecodable anchor log");
                ChainEvent::AnchorSubmitted(AnchorSubmittedEvent {
                    block_number,
                    transaction_hash,
                    hash: None,
                    size: None,
                })
            }
        }
    }
}

fn rpc_error(err: impl std::fmt::Display) -> ChainError {
    let message = err.to_string();
    let lowercase = message.to_lowercase();
    if TOO_MANY_RESULTS
        .iter()
        .any(|fragment| lowercase.contains(fragment))
    {
        ChainError::TooManyResults
    } else {
        ChainError::Rpc(message)
    }
}

#[async_trait]
impl AnchorChain for AlloyAnchorChain {
    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, ChainError> {
        let block = self
            .provider
            .get_block_by_number(number.into())
            .await
            .map_err(rpc_error)?;
        Ok(block.map(|block| block.header.timestamp))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(rpc_error)
    }

    async fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        self.provider.get_accounts().await.map_err(rpc_error)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.provider.get_gas_price().await.map_err(rpc_error)
    }

    async fn estimate_fee(&self, size: u64) -> Result<U256, ChainError> {
        let call = estimateFeeCall {
            size: U256::from(size),
        };
        let tx = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(call.abi_encode());

        let output = self.provider.call(tx).await.map_err(rpc_error)?;
        estimateFeeCall::abi_decode_returns(output.as_ref())
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }

    async fn submit_anchor(
        &self,
        submission: AnchorSubmission,
    ) -> Result<AnchorReceipt, ChainError> {
        let call = submitHashCall {
            hash: submission.hash.clone(),
            size: U256::from(submission.size),
        };
        let tx = TransactionRequest::default()
            .with_from(submission.from)
            .with_to(self.contract)
            .with_input(call.abi_encode())
            .with_value(submission.fee)
            .with_gas_limit(submission.gas_limit)
            .with_gas_price(submission.gas_price);

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| ChainError::TransactionFailed(e.to_string()))?;
        info!(
            target: "chain",
            transaction_hash = %pending.tx_hash(),
            content_id = %submission.hash,
            "Anchor transaction sent"
        );

        let receipt = pending
            .with_required_confirmations(submission.confirmations + 1)
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| ChainError::TransactionFailed(e.to_string()))?;

        if !receipt.status() {
            return Err(ChainError::TransactionFailed(format!(
                "transaction {} reverted",
                receipt.transaction_hash
            )));
        }

        let block_number = receipt.block_number.ok_or_else(|| {
            ChainError::InvalidResponse("receipt has no block number".to_string())
        })?;

        Ok(AnchorReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number,
            gas_used: receipt.gas_used,
        })
    }

    async fn past_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let filter = Filter::new()
            .address(self.contract)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.provider.get_logs(&filter).await.map_err(rpc_error)?;
        Ok(logs.iter().map(|log| self.convert_log(log)).collect())
    }
}
