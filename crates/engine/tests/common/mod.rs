#![allow(dead_code)]

//! Shared fixtures for engine integration tests.

pub mod mocks;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use bundler_audit::{BundlerEvent, Notifier};
use bundler_core::test_utils::{TEST_CHAIN_ID, TEST_ENTRY_POINT, sender, user_op_v06};
use bundler_core::{
    BundlerSettings, ChainConfig, TransactionId, TransactionRecord, TransactionStatus,
    UserOperationRequest,
};
use bundler_datastore::{InMemoryRepository, Repository, TransactionQuery, WriteBatch};
use bundler_engine::ChainBundler;
use bundler_user_op_pool::{OperationPool, PoolSettings};
use chrono::Utc;
use tokio::sync::mpsc;

pub use mocks::MockChainClient;

/// Anvil's first three development keys.
pub const SIGNER_KEYS: [&str; 3] = [
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
    "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
];

pub fn chain_config(signer_count: usize) -> ChainConfig {
    serde_json::from_value(serde_json::json!({
        "chainId": TEST_CHAIN_ID,
        "rpcUrl": "http://localhost:8545",
        "entryPoints": [TEST_ENTRY_POINT],
        "signerKeys": &SIGNER_KEYS[..signer_count],
    }))
    .unwrap()
}

pub fn settings() -> BundlerSettings {
    BundlerSettings {
        replacement_cooldown: Duration::ZERO,
        ..BundlerSettings::default()
    }
}

pub fn request(sender_byte: u8, nonce: u64) -> UserOperationRequest {
    UserOperationRequest::new(
        user_op_v06(sender(sender_byte), U256::from(nonce), 200_000),
        TEST_ENTRY_POINT,
    )
}

/// One chain wired to a mock node and an in-memory repository.
pub struct Harness {
    pub client: Arc<MockChainClient>,
    pub repository: Arc<InMemoryRepository>,
    pub pool: Arc<OperationPool>,
    pub bundler: ChainBundler,
    pub events: mpsc::UnboundedReceiver<BundlerEvent>,
}

impl Harness {
    pub async fn new(chain: ChainConfig) -> Self {
        Self::with_settings(chain, settings()).await
    }

    pub async fn with_settings(chain: ChainConfig, settings: BundlerSettings) -> Self {
        let client = Arc::new(MockChainClient::new(chain.chain_id));
        let repository = Arc::new(InMemoryRepository::new());
        let (notifier, events) = Notifier::channel();
        let pool = Arc::new(OperationPool::new(
            repository.clone(),
            notifier.clone(),
            PoolSettings::from(&settings),
        ));
        let bundler = ChainBundler::new(chain, settings, client.clone(), pool.clone(), notifier)
            .await
            .unwrap();
        Self {
            client,
            repository,
            pool,
            bundler,
            events,
        }
    }

    pub fn signer(&self, index: usize) -> Address {
        self.bundler.allocator().addresses()[index]
    }

    pub async fn admit(&self, sender_byte: u8, nonce: u64) -> B256 {
        self.pool
            .admit(self.bundler.chain(), request(sender_byte, nonce))
            .await
            .unwrap()
    }

    pub async fn transactions(&self, status: TransactionStatus) -> Vec<TransactionRecord> {
        self.repository
            .list_transactions(&TransactionQuery::chain(TEST_CHAIN_ID).with_status(status))
            .await
            .unwrap()
    }

    pub async fn transaction(&self, id: TransactionId) -> TransactionRecord {
        self.repository.get_transaction(id).await.unwrap().unwrap()
    }

    /// Pretends the transaction was last broadcast `age` ago.
    pub async fn age_transaction(&self, id: TransactionId, age: Duration) {
        let mut tx = self.transaction(id).await;
        tx.latest_sent_at = Some(Utc::now() - chrono::Duration::from_std(age).unwrap());
        let mut batch = WriteBatch::new();
        batch.update_transaction(tx);
        self.repository.commit(batch).await.unwrap();
    }

    pub fn drain_events(&mut self) -> Vec<BundlerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
