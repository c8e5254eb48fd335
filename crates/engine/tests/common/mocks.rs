//! Scripted chain node for engine tests.
use std::collections::{HashMap, VecDeque};

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use anyhow::{Result, bail};
use async_trait::async_trait;
use bundler_chain::{BroadcastError, ChainClient, ChainLog, FeeData, LogFilter};
use bundler_core::{TransactionReceipt, UnsignedTransaction};
use parking_lot::Mutex;

#[derive(Debug)]
struct NodeState {
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    receipts: HashMap<B256, TransactionReceipt>,
    logs: Vec<ChainLog>,
    fee_data: FeeData,
    block_number: u64,
    /// Outcomes for upcoming broadcasts; empty means accept.
    broadcast_results: VecDeque<BroadcastError>,
    broadcasts: Vec<Bytes>,
    /// Estimates revert for any call data carrying one of these senders.
    reverting_senders: Vec<Address>,
    estimate_calls: usize,
    receipts_unavailable: bool,
}

/// In-memory stand-in for a chain's JSON-RPC node.
///
/// Broadcasts are recorded and answered with the payload's keccak hash, which
/// is the transaction hash of a signed envelope.
#[derive(Debug)]
pub struct MockChainClient {
    chain_id: u64,
    state: Mutex<NodeState>,
}

impl MockChainClient {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(NodeState {
                nonces: HashMap::new(),
                balances: HashMap::new(),
                receipts: HashMap::new(),
                logs: Vec::new(),
                fee_data: FeeData {
                    gas_price: 1_000_000_000,
                    max_priority_fee_per_gas: Some(100_000_000),
                },
                block_number: 100,
                broadcast_results: VecDeque::new(),
                broadcasts: Vec::new(),
                reverting_senders: Vec::new(),
                estimate_calls: 0,
                receipts_unavailable: false,
            }),
        }
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().nonces.insert(address, nonce);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().balances.insert(address, balance);
    }

    pub fn set_fee_data(&self, fee_data: FeeData) {
        self.state.lock().fee_data = fee_data;
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.state.lock().block_number = block_number;
    }

    pub fn add_receipt(&self, receipt: TransactionReceipt) {
        self.state
            .lock()
            .receipts
            .insert(receipt.transaction_hash, receipt);
    }

    pub fn add_log(&self, log: ChainLog) {
        self.state.lock().logs.push(log);
    }

    /// Rejects the next broadcast with `error`.
    pub fn fail_next_broadcast(&self, error: BroadcastError) {
        self.state.lock().broadcast_results.push_back(error);
    }

    /// Makes gas estimation revert for every bundle containing `sender`.
    pub fn revert_estimates_for(&self, sender: Address) {
        self.state.lock().reverting_senders.push(sender);
    }

    pub fn estimate_calls(&self) -> usize {
        self.state.lock().estimate_calls
    }

    /// Fails every receipt lookup while set.
    pub fn set_receipts_unavailable(&self, unavailable: bool) {
        self.state.lock().receipts_unavailable = unavailable;
    }

    pub fn broadcasts(&self) -> Vec<Bytes> {
        self.state.lock().broadcasts.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.state.lock().broadcasts.len()
    }
}

pub fn receipt(transaction_hash: B256, block_number: u64, success: bool) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash,
        block_hash: Some(B256::repeat_byte(0xbb)),
        block_number: Some(block_number),
        success,
        gas_used: 250_000,
        effective_gas_price: 1_000_000_000,
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64> {
        Ok(self.state.lock().nonces.get(&address).copied().unwrap_or_default())
    }

    async fn get_balance(&self, address: Address) -> Result<U256> {
        Ok(self.state.lock().balances.get(&address).copied().unwrap_or_default())
    }

    async fn estimate_gas(&self, tx: &UnsignedTransaction) -> Result<u64> {
        let mut state = self.state.lock();
        state.estimate_calls += 1;
        let reverting = state
            .reverting_senders
            .iter()
            .any(|sender| tx.call_data.windows(20).any(|word| word == sender.as_slice()));
        if reverting {
            bail!("execution reverted: AA23 reverted");
        }
        Ok(500_000)
    }

    async fn broadcast_transaction(&self, raw: &Bytes) -> Result<B256, BroadcastError> {
        let mut state = self.state.lock();
        state.broadcasts.push(raw.clone());
        match state.broadcast_results.pop_front() {
            Some(error) => Err(error),
            None => Ok(keccak256(raw)),
        }
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>> {
        let state = self.state.lock();
        if state.receipts_unavailable {
            bail!("connection refused");
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>> {
        Ok(self
            .state
            .lock()
            .logs
            .iter()
            .filter(|log| {
                filter.addresses.contains(&log.address)
                    && log.topics.first() == Some(&filter.topic0)
                    && log
                        .block_number
                        .is_some_and(|n| n >= filter.from_block && n <= filter.to_block)
            })
            .cloned()
            .collect())
    }

    async fn get_fee_data(&self) -> Result<FeeData> {
        Ok(self.state.lock().fee_data)
    }

    async fn get_block_number(&self) -> Result<u64> {
        Ok(self.state.lock().block_number)
    }
}
