//! In-memory [`AnchorChain`] with call counters and failure injection.

use std::{
    collections::HashMap,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
    time::Duration,
};

use alloy::primitives::{
    Address,
    B256,
    U256,
};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AnchorChain,
    AnchorReceipt,
    AnchorSubmission,
    AnchorSubmittedEvent,
    ChainError,
    ChainEvent,
};

/// Seconds between blocks mined by [`MockChain::submit_anchor`].
pub const MOCK_BLOCK_TIME: u64 = 12;

/// Chain calls whose responses can be delayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    BlockTimestamp,
    BlockNumber,
    Accounts,
    GasPrice,
    EstimateFee,
    PastEvents,
}

#[derive(Debug)]
struct MockState {
    timestamps: Vec<u64>,
    events: Vec<ChainEvent>,
    accounts: Vec<Address>,
    fee_per_byte: U256,
    gas_used: u64,
    gas_price: u128,
    max_logs: Option<usize>,
    failing_block_fetches: usize,
    submission_error: Option<String>,
    delays: HashMap<MockCall, Duration>,
    submissions: Vec<AnchorSubmission>,
}

#[derive(Debug)]
pub struct MockChain {
    state: Mutex<MockState>,
    block_fetches: AtomicUsize,
    head_fetches: AtomicUsize,
    log_queries: AtomicUsize,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::with_timestamps(vec![1_000])
    }
}

impl MockChain {
    /// Chain whose block `i` has timestamp `timestamps[i]`.
    pub fn with_timestamps(timestamps: Vec<u64>) -> Self {
        Self {
            state: Mutex::new(MockState {
                timestamps,
                events: Vec::new(),
                accounts: vec![Address::with_last_byte(0xaa)],
                fee_per_byte: U256::from(10),
                gas_used: 21_000,
                gas_price: 100,
                max_logs: None,
                failing_block_fetches: 0,
                submission_error: None,
                delays: HashMap::new(),
                submissions: Vec::new(),
            }),
            block_fetches: AtomicUsize::new(0),
            head_fetches: AtomicUsize::new(0),
            log_queries: AtomicUsize::new(0),
        }
    }

    /// Chain of `count` blocks spaced [`MOCK_BLOCK_TIME`] seconds apart.
    pub fn with_blocks(count: u64, genesis_timestamp: u64) -> Self {
        Self::with_timestamps(
            (0..count)
                .map(|i| genesis_timestamp + i * MOCK_BLOCK_TIME)
                .collect(),
        )
    }

    pub fn head(&self) -> u64 {
        (self.state.lock().timestamps.len() as u64).saturating_sub(1)
    }

    pub fn timestamp_of(&self, block: u64) -> Option<u64> {
        self.state
            .lock()
            .timestamps
            .get(usize::try_from(block).ok()?)
            .copied()
    }

    pub fn mine_blocks(&self, count: u64) {
        let mut state = self.state.lock();
        for _ in 0..count {
            let next = state.timestamps.last().map_or(0, |ts| ts + MOCK_BLOCK_TIME);
            state.timestamps.push(next);
        }
    }

    pub fn push_event(&self, event: ChainEvent) {
        self.state.lock().events.push(event);
    }

    /// Records an anchor for `hash` in `block_number` and returns its
    /// transaction hash.
    pub fn push_anchor(&self, block_number: u64, hash: &str, size: u64) -> B256 {
        let mut state = self.state.lock();
        let mut transaction_hash = [0u8; 32];
        transaction_hash[24..].copy_from_slice(&(state.events.len() as u64 + 1).to_be_bytes());
        let transaction_hash = B256::from(transaction_hash);
        state
            .events
            .push(ChainEvent::AnchorSubmitted(AnchorSubmittedEvent {
                block_number,
                transaction_hash,
                hash: Some(hash.to_string()),
                size: Some(U256::from(size)),
            }));
        transaction_hash
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.state.lock().accounts = accounts;
    }

    pub fn set_fee_per_byte(&self, fee: U256) {
        self.state.lock().fee_per_byte = fee;
    }

    pub fn set_gas(&self, gas_used: u64, gas_price: u128) {
        let mut state = self.state.lock();
        state.gas_used = gas_used;
        state.gas_price = gas_price;
    }

    /// Log queries matching more than `max` events fail with
    /// [`ChainError::TooManyResults`].
    pub fn set_max_logs(&self, max: usize) {
        self.state.lock().max_logs = Some(max);
    }

    /// The next `count` block fetches fail with an RPC error.
    pub fn fail_block_fetches(&self, count: usize) {
        self.state.lock().failing_block_fetches = count;
    }

    pub fn fail_submissions(&self, message: &str) {
        self.state.lock().submission_error = Some(message.to_string());
    }

    /// Delays account, gas, fee and log responses.
    pub fn set_response_delay(&self, delay: Duration) {
        let mut state = self.state.lock();
        for call in [
            MockCall::Accounts,
            MockCall::GasPrice,
            MockCall::EstimateFee,
            MockCall::PastEvents,
        ] {
            state.delays.insert(call, delay);
        }
    }

    pub fn delay_call(&self, call: MockCall, delay: Duration) {
        self.state.lock().delays.insert(call, delay);
    }

    pub fn submissions(&self) -> Vec<AnchorSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn block_fetches(&self) -> usize {
        self.block_fetches.load(Ordering::SeqCst)
    }

    pub fn head_fetches(&self) -> usize {
        self.head_fetches.load(Ordering::SeqCst)
    }

    pub fn log_queries(&self) -> usize {
        self.log_queries.load(Ordering::SeqCst)
    }

    async fn delay(&self, call: MockCall) {
        let delay = self.state.lock().delays.get(&call).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AnchorChain for MockChain {
    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, ChainError> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);
        self.delay(MockCall::BlockTimestamp).await;
        let mut state = self.state.lock();
        if state.failing_block_fetches > 0 {
            state.failing_block_fetches -= 1;
            return Err(ChainError::Rpc("block fetch failed".to_string()));
        }
        Ok(usize::try_from(number)
            .ok()
            .and_then(|index| state.timestamps.get(index).copied()))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.head_fetches.fetch_add(1, Ordering::SeqCst);
        self.delay(MockCall::BlockNumber).await;
        Ok(self.head())
    }

    async fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        self.delay(MockCall::Accounts).await;
        Ok(self.state.lock().accounts.clone())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.delay(MockCall::GasPrice).await;
        Ok(self.state.lock().gas_price)
    }

    async fn estimate_fee(&self, size: u64) -> Result<U256, ChainError> {
        self.delay(MockCall::EstimateFee).await;
        Ok(self.state.lock().fee_per_byte * U256::from(size))
    }

    async fn submit_anchor(
        &self,
        submission: AnchorSubmission,
    ) -> Result<AnchorReceipt, ChainError> {
        if let Some(message) = self.state.lock().submission_error.clone() {
            return Err(ChainError::TransactionFailed(message));
        }

        self.mine_blocks(1);
        let block_number = self.head();
        let transaction_hash = self.push_anchor(block_number, &submission.hash, submission.size);
        self.mine_blocks(submission.confirmations);

        let mut state = self.state.lock();
        let gas_used = state.gas_used;
        state.submissions.push(submission);

        Ok(AnchorReceipt {
            transaction_hash,
            block_number,
            gas_used,
        })
    }

    async fn past_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        self.log_queries.fetch_add(1, Ordering::SeqCst);
        self.delay(MockCall::PastEvents).await;

        let state = self.state.lock();
        let mut events: Vec<ChainEvent> = state
            .events
            .iter()
            .filter(|event| (from_block..=to_block).contains(&event.block_number()))
            .cloned()
            .collect();
        events.sort_by_key(ChainEvent::block_number);

        if state.max_logs.is_some_and(|max| events.len() > max) {
            return Err(ChainError::TooManyResults);
        }
        Ok(events)
    }
}
