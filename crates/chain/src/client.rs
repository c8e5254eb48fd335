use std::future::Future;
use std::time::Duration;

use alloy_network::ReceiptResponse;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types::{Filter, Log, TransactionInput, TransactionRequest};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bundler_core::{TransactionReceipt, UnsignedTransaction};
use tracing::debug;
use url::Url;

use crate::error::BroadcastError;

/// Network fee snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    /// `eth_gasPrice`.
    pub gas_price: u128,
    /// `eth_maxPriorityFeePerGas`, absent on chains priced with legacy transactions.
    pub max_priority_fee_per_gas: Option<u128>,
}

/// Log query bounded to a block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

/// The parts of a log the monitor matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub transaction_hash: Option<B256>,
    pub block_number: Option<u64>,
}

impl From<&Log> for ChainLog {
    fn from(log: &Log) -> Self {
        Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            transaction_hash: log.transaction_hash,
            block_number: log.block_number,
        }
    }
}

/// Per-chain RPC surface the engine depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Nonce including the node's pending pool.
    async fn get_transaction_count(&self, address: Address) -> Result<u64>;

    async fn get_balance(&self, address: Address) -> Result<U256>;

    async fn estimate_gas(&self, tx: &UnsignedTransaction) -> Result<u64>;

    async fn broadcast_transaction(&self, raw: &Bytes) -> Result<B256, BroadcastError>;

    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>>;

    async fn get_fee_data(&self) -> Result<FeeData>;

    async fn get_block_number(&self) -> Result<u64>;
}

/// [`ChainClient`] over an alloy HTTP provider; every call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct AlloyChainClient {
    chain_id: u64,
    eip1559: bool,
    timeout: Duration,
    provider: RootProvider,
}

impl AlloyChainClient {
    pub fn new(chain_id: u64, rpc_url: &str, eip1559: bool, timeout: Duration) -> Result<Self> {
        let url: Url = rpc_url
            .parse()
            .with_context(|| format!("invalid rpc url for chain {chain_id}"))?;
        Ok(Self {
            chain_id,
            eip1559,
            timeout,
            provider: RootProvider::new_http(url),
        })
    }

    async fn bounded<T, E, F>(&self, method: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| anyhow!("{method} timed out after {:?}", self.timeout))?
            .with_context(|| format!("{method} failed on chain {}", self.chain_id))
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64> {
        self.bounded(
            "eth_getTransactionCount",
            self.provider.get_transaction_count(address).pending().into_future(),
        )
        .await
    }

    async fn get_balance(&self, address: Address) -> Result<U256> {
        self.bounded("eth_getBalance", self.provider.get_balance(address).into_future())
            .await
    }

    async fn estimate_gas(&self, tx: &UnsignedTransaction) -> Result<u64> {
        let request = TransactionRequest {
            from: Some(tx.from),
            to: Some(TxKind::Call(tx.to)),
            input: TransactionInput::new(tx.call_data.clone()),
            ..Default::default()
        };
        self.bounded("eth_estimateGas", self.provider.estimate_gas(request).into_future())
            .await
    }

    async fn broadcast_transaction(&self, raw: &Bytes) -> Result<B256, BroadcastError> {
        let sent = tokio::time::timeout(self.timeout, self.provider.send_raw_transaction(raw))
            .await
            .map_err(|_| BroadcastError::Rpc(format!("eth_sendRawTransaction timed out after {:?}", self.timeout)))?;
        match sent {
            Ok(pending) => Ok(*pending.tx_hash()),
            Err(err) => {
                debug!(message = "broadcast rejected", chain_id = self.chain_id, error = %err);
                Err(BroadcastError::classify(err.to_string()))
            }
        }
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>> {
        let receipt = self
            .bounded(
                "eth_getTransactionReceipt",
                self.provider.get_transaction_receipt(hash),
            )
            .await?;
        Ok(receipt.map(|receipt| TransactionReceipt {
            transaction_hash: receipt.transaction_hash(),
            block_hash: receipt.block_hash(),
            block_number: receipt.block_number(),
            success: receipt.status(),
            gas_used: receipt.gas_used(),
            effective_gas_price: receipt.effective_gas_price(),
        }))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>> {
        let query = Filter::new()
            .address(filter.addresses.clone())
            .event_signature(filter.topic0)
            .from_block(filter.from_block)
            .to_block(filter.to_block);
        let logs = self.bounded("eth_getLogs", self.provider.get_logs(&query)).await?;
        Ok(logs.iter().map(ChainLog::from).collect())
    }

    async fn get_fee_data(&self) -> Result<FeeData> {
        let gas_price = self
            .bounded("eth_gasPrice", self.provider.get_gas_price().into_future())
            .await?;
        let max_priority_fee_per_gas = if self.eip1559 {
            Some(
                self.bounded(
                    "eth_maxPriorityFeePerGas",
                    self.provider.get_max_priority_fee_per_gas().into_future(),
                )
                .await?,
            )
        } else {
            None
        };
        Ok(FeeData { gas_price, max_priority_fee_per_gas })
    }

    async fn get_block_number(&self) -> Result<u64> {
        self.bounded("eth_blockNumber", self.provider.get_block_number().into_future())
            .await
    }
}
