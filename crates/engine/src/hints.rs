//! Advisory caches fed by sibling bundler processes.
//!
//! Nothing here is required for correctness: a missing or stale hint only
//! means the monitor asks the chain instead.
use std::collections::{HashMap, VecDeque};

use alloy_primitives::B256;
use bundler_core::TransactionReceipt;
use parking_lot::Mutex;

const DEFAULT_CAPACITY: usize = 4_096;

#[derive(Debug, Default)]
struct Entries {
    receipts: HashMap<B256, TransactionReceipt>,
    order: VecDeque<B256>,
}

/// Bounded receipt cache keyed by transaction hash; oldest entries fall out first.
#[derive(Debug)]
pub struct ReceiptCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl Default for ReceiptCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ReceiptCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn insert(&self, receipt: TransactionReceipt) {
        let mut entries = self.entries.lock();
        let hash = receipt.transaction_hash;
        if entries.receipts.insert(hash, receipt).is_none() {
            entries.order.push_back(hash);
        }
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.receipts.remove(&oldest);
            }
        }
    }

    pub fn get(&self, hash: &B256) -> Option<TransactionReceipt> {
        self.entries.lock().receipts.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
