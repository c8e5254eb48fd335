use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use bundler_audit::{BundlerEvent, Notifier};
use bundler_chain::{ChainClient, TransactionSigner};
use bundler_core::{ChainConfig, TransactionStatus, TtlLockGuard, TtlLockSet};
use bundler_datastore::Repository;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::packer::SignerBudget;

/// A signer locked for one bundling round, with its remaining in-flight budget.
#[derive(Debug)]
pub struct AllocatedSigner {
    pub address: Address,
    pub budget: u64,
    _guard: TtlLockGuard<Address>,
}

impl AllocatedSigner {
    pub const fn budget(&self) -> SignerBudget {
        SignerBudget {
            signer: self.address,
            budget: self.budget,
        }
    }
}

#[derive(Debug, Default)]
struct SignerState {
    blocked: HashMap<Address, String>,
    pending: HashMap<Address, u64>,
    done_max_nonce: HashMap<Address, u64>,
    /// Rotates ties so equal-budget signers take turns.
    rotation: usize,
}

/// Owns a chain's signers and everything known about them.
pub struct SignerAllocator {
    chain_id: u64,
    signers: Vec<TransactionSigner>,
    pending_limit: u64,
    max_pack_count: usize,
    min_balance: U256,
    development: bool,
    notifier: Notifier,
    locks: TtlLockSet<Address>,
    state: Mutex<SignerState>,
}

impl Debug for SignerAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerAllocator")
            .field("chain_id", &self.chain_id)
            .field("signers", &self.signers.len())
            .field("blocked", &self.state.lock().blocked.len())
            .finish()
    }
}

impl SignerAllocator {
    pub fn new(
        chain: &ChainConfig,
        development: bool,
        lock_ttl: Duration,
        notifier: Notifier,
    ) -> Result<Self> {
        let signers = chain
            .signer_keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                TransactionSigner::from_private_key(key)
                    .with_context(|| format!("signer #{index} of chain {}", chain.chain_id))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            chain_id: chain.chain_id,
            signers,
            pending_limit: chain.pending_transaction_signer_handle_limit,
            max_pack_count: chain.max_user_op_pack_count,
            min_balance: U256::from(chain.min_signer_balance),
            development,
            notifier,
            locks: TtlLockSet::new(lock_ttl),
            state: Mutex::new(SignerState::default()),
        })
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.signers.iter().map(TransactionSigner::address).collect()
    }

    pub fn signer(&self, address: &Address) -> Option<&TransactionSigner> {
        self.signers.iter().find(|signer| signer.address() == *address)
    }

    /// How many signers one round may lock.
    pub fn take_once(&self) -> usize {
        let total = self.signers.len();
        if self.development {
            return total;
        }
        total.div_ceil(5).min(self.max_pack_count)
    }

    /// Locks up to [`Self::take_once`] unblocked signers with budget left,
    /// highest budget first.
    ///
    /// Signers locked by a concurrent round are skipped; their guards are
    /// released when the returned values drop.
    pub fn available_signers(&self) -> Vec<AllocatedSigner> {
        let mut candidates: Vec<(Address, u64)> = {
            let mut state = self.state.lock();
            let total = self.signers.len().max(1);
            let offset = state.rotation % total;
            state.rotation = state.rotation.wrapping_add(1);

            let mut candidates: Vec<_> = self
                .signers
                .iter()
                .cycle()
                .skip(offset)
                .take(self.signers.len())
                .map(TransactionSigner::address)
                .filter(|address| !state.blocked.contains_key(address))
                .map(|address| {
                    let pending = state.pending.get(&address).copied().unwrap_or_default();
                    (address, self.pending_limit.saturating_sub(pending))
                })
                .collect();
            candidates.retain(|(_, budget)| *budget > 0);
            candidates
        };
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let take_once = self.take_once();
        let mut allocated = Vec::with_capacity(take_once);
        for (address, budget) in candidates {
            if allocated.len() >= take_once {
                break;
            }
            if let Some(guard) = self.locks.try_lock(address) {
                allocated.push(AllocatedSigner {
                    address,
                    budget,
                    _guard: guard,
                });
            }
        }
        allocated
    }

    /// Locks one specific signer, for work outside the bundling round.
    pub fn try_lock(&self, address: Address) -> Option<TtlLockGuard<Address>> {
        self.locks.try_lock(address)
    }

    /// Returns `true` if the signer was not blocked before.
    pub fn block(&self, address: Address, reason: &str) -> bool {
        let newly = self
            .state
            .lock()
            .blocked
            .insert(address, reason.to_string())
            .is_none();
        if newly {
            warn!(chain_id = self.chain_id, signer = %address, reason, "Blocking signer");
            self.notifier.emit(BundlerEvent::SignerBlocked {
                chain_id: self.chain_id,
                signer: address,
                reason: reason.to_string(),
            });
        }
        newly
    }

    /// Returns `true` if the signer was blocked.
    pub fn unblock(&self, address: Address) -> bool {
        let was_blocked = self.state.lock().blocked.remove(&address).is_some();
        if was_blocked {
            info!(chain_id = self.chain_id, signer = %address, "Unblocking signer");
            self.notifier.emit(BundlerEvent::SignerUnblocked {
                chain_id: self.chain_id,
                signer: address,
            });
        }
        was_blocked
    }

    pub fn is_blocked(&self, address: &Address) -> bool {
        self.state.lock().blocked.contains_key(address)
    }

    pub fn blocked(&self) -> Vec<Address> {
        self.state.lock().blocked.keys().copied().collect()
    }

    pub fn pending_count(&self, address: &Address) -> u64 {
        self.state.lock().pending.get(address).copied().unwrap_or_default()
    }

    pub fn increment_pending(&self, address: Address) {
        *self.state.lock().pending.entry(address).or_default() += 1;
    }

    pub fn decrement_pending(&self, address: Address) {
        let mut state = self.state.lock();
        if let Some(count) = state.pending.get_mut(&address) {
            *count = count.saturating_sub(1);
        }
    }

    /// Raises the signer's highest nonce known to be consumed on chain.
    pub fn record_done_nonce(&self, address: Address, nonce: u64) {
        let mut state = self.state.lock();
        let done = state.done_max_nonce.entry(address).or_insert(nonce);
        *done = (*done).max(nonce);
    }

    pub fn done_max_nonce(&self, address: &Address) -> Option<u64> {
        self.state.lock().done_max_nonce.get(address).copied()
    }

    /// Rebuilds in-flight counters from the unfinished transactions in `repository`.
    pub async fn sync_pending_counts(&self, repository: &dyn Repository) -> Result<()> {
        let mut pending = HashMap::new();
        for address in self.addresses() {
            let mut count = 0;
            for status in [TransactionStatus::Local, TransactionStatus::Pending] {
                count += repository
                    .count_transactions(self.chain_id, address, status)
                    .await?;
            }
            pending.insert(address, count);
        }
        self.state.lock().pending = pending;
        Ok(())
    }

    /// Unblocks every blocked signer whose balance is back at the configured minimum.
    pub async fn check_blocked_balances(&self, client: &dyn ChainClient) -> Vec<Address> {
        let mut unblocked = Vec::new();
        for address in self.blocked() {
            match client.get_balance(address).await {
                Ok(balance) if balance >= self.min_balance && !balance.is_zero() => {
                    if self.unblock(address) {
                        unblocked.push(address);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(chain_id = self.chain_id, signer = %address, error = %e, "Balance check failed");
                }
            }
        }
        unblocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [&str; 3] = [
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
    ];

    fn allocator(keys: &[&str], limit: u64, development: bool) -> SignerAllocator {
        let mut chain: ChainConfig = serde_json::from_value(serde_json::json!({
            "chainId": 1,
            "rpcUrl": "http://localhost:8545",
            "entryPoints": [],
            "signerKeys": keys,
        }))
        .unwrap();
        chain.pending_transaction_signer_handle_limit = limit;
        SignerAllocator::new(&chain, development, Duration::from_secs(60), Notifier::disabled())
            .unwrap()
    }

    #[test]
    fn take_once_is_a_fifth_of_the_signers() {
        assert_eq!(allocator(&KEYS, 5, false).take_once(), 1);
        assert_eq!(allocator(&KEYS, 5, true).take_once(), 3);
    }

    #[test]
    fn blocked_and_exhausted_signers_are_skipped() {
        let allocator = allocator(&KEYS, 2, true);
        let addresses = allocator.addresses();
        let (a, b, c) = (addresses[0], addresses[1], addresses[2]);

        allocator.block(a, "insufficient funds");
        allocator.increment_pending(b);
        allocator.increment_pending(b);
        allocator.increment_pending(c);

        let allocated = allocator.available_signers();
        assert_eq!(allocated.len(), 1);
        assert_eq!(allocated[0].address, c);
        assert_eq!(allocated[0].budget, 1);
    }

    #[test]
    fn signers_are_sorted_by_budget() {
        let allocator = allocator(&KEYS, 3, true);
        let addresses = allocator.addresses();
        allocator.increment_pending(addresses[0]);
        allocator.increment_pending(addresses[0]);
        allocator.increment_pending(addresses[1]);

        let budgets: Vec<u64> = allocator.available_signers().iter().map(|s| s.budget).collect();
        assert_eq!(budgets, vec![3, 2, 1]);
    }

    #[test]
    fn locked_signer_is_not_allocated_twice() {
        let allocator = allocator(&KEYS[..1], 5, false);
        let first = allocator.available_signers();
        let second = allocator.available_signers();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());

        drop(first);
        assert_eq!(allocator.available_signers().len(), 1);
    }

    #[test]
    fn concurrent_allocation_has_exactly_one_winner() {
        let allocator = allocator(&KEYS[..1], 5, false);
        let barrier = std::sync::Barrier::new(8);

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        let allocated = allocator.available_signers();
                        let won = allocated.len();
                        // hold the lock until every contender has tried
                        barrier.wait();
                        won
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn block_and_unblock_report_transitions() {
        let allocator = allocator(&KEYS[..1], 5, false);
        let signer = allocator.addresses()[0];
        assert!(allocator.block(signer, "insufficient funds"));
        assert!(!allocator.block(signer, "again"));
        assert!(allocator.is_blocked(&signer));
        assert!(allocator.available_signers().is_empty());
        assert!(allocator.unblock(signer));
        assert!(!allocator.unblock(signer));
    }

    #[test]
    fn pending_counter_never_underflows() {
        let allocator = allocator(&KEYS[..1], 5, false);
        let signer = allocator.addresses()[0];
        allocator.decrement_pending(signer);
        allocator.increment_pending(signer);
        allocator.decrement_pending(signer);
        allocator.decrement_pending(signer);
        assert_eq!(allocator.pending_count(&signer), 0);
    }

    #[test]
    fn done_nonce_only_moves_forward() {
        let allocator = allocator(&KEYS[..1], 5, false);
        let signer = allocator.addresses()[0];
        assert_eq!(allocator.done_max_nonce(&signer), None);
        allocator.record_done_nonce(signer, 7);
        allocator.record_done_nonce(signer, 3);
        assert_eq!(allocator.done_max_nonce(&signer), Some(7));
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let chain: ChainConfig = serde_json::from_value(serde_json::json!({
            "chainId": 1,
            "rpcUrl": "http://localhost:8545",
            "entryPoints": [],
            "signerKeys": ["not-a-key"],
        }))
        .unwrap();
        let err = SignerAllocator::new(&chain, false, Duration::from_secs(1), Notifier::disabled())
            .unwrap_err();
        assert!(err.to_string().contains("signer #0"));
    }
}
