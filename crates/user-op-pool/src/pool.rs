use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use bundler_audit::{BundlerEvent, DropReason, Notifier};
use bundler_core::{
    BundlerSettings, ChainConfig, TransactionStatus, TtlLockGuard, TtlLockSet,
    UserOperationPayload, UserOperationRecord, UserOperationRequest, UserOperationStatus,
};
use bundler_datastore::{DatastoreError, Repository, WriteBatch};
use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The hash or nonce slot is held by an operation that may not be replaced.
    #[error("user operation conflicts with active operation {0}")]
    DuplicateOperation(B256),
    #[error("maxFeePerGas {max_fee_per_gas} is below the chain minimum {minimum}")]
    FeeTooLow { max_fee_per_gas: U256, minimum: u128 },
    #[error("invalid user operation: {0}")]
    InvalidOperation(String),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub replacement_cooldown: Duration,
    pub max_pool_size: usize,
    pub max_op_age: Duration,
    pub lock_ttl: Duration,
}

impl From<&BundlerSettings> for PoolSettings {
    fn from(settings: &BundlerSettings) -> Self {
        Self {
            replacement_cooldown: settings.replacement_cooldown,
            max_pool_size: settings.max_pool_size,
            max_op_age: settings.max_op_age,
            lock_ttl: settings.lock_ttl,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&BundlerSettings::default())
    }
}

/// A Local operation reserved for one packing round.
///
/// The reservation ends when this value (or its guard) is dropped.
#[derive(Debug)]
pub struct LockedOperation {
    pub record: UserOperationRecord,
    guard: TtlLockGuard<B256>,
}

impl LockedOperation {
    pub fn into_parts(self) -> (UserOperationRecord, TtlLockGuard<B256>) {
        (self.record, self.guard)
    }
}

/// Admission, sampling and eviction of user operations on top of a [`Repository`].
#[derive(Clone)]
pub struct OperationPool {
    repository: Arc<dyn Repository>,
    notifier: Notifier,
    locks: TtlLockSet<B256>,
    settings: PoolSettings,
}

impl Debug for OperationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationPool")
            .field("settings", &self.settings)
            .field("locks", &self.locks)
            .finish()
    }
}

impl OperationPool {
    pub fn new(repository: Arc<dyn Repository>, notifier: Notifier, settings: PoolSettings) -> Self {
        Self {
            repository,
            notifier,
            locks: TtlLockSet::new(settings.lock_ttl),
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Stores the request as a Local record, siblings as Associated records.
    pub async fn admit(
        &self,
        chain: &ChainConfig,
        request: UserOperationRequest,
    ) -> Result<B256, PoolError> {
        let Some(version) = chain.entry_point_version(&request.entry_point) else {
            return Err(PoolError::InvalidOperation(format!(
                "entry point {} is not served on chain {}",
                request.entry_point, chain.chain_id
            )));
        };

        let minimum = U256::from(chain.min_max_fee_per_gas);
        for op in std::iter::once(&request.user_operation).chain(&request.associated_user_operations) {
            if op.version() != version {
                return Err(PoolError::InvalidOperation(format!(
                    "{:?} operation sent to {:?} entry point {}",
                    op.version(),
                    version,
                    request.entry_point
                )));
            }
            let max_fee_per_gas = op.max_fee_per_gas();
            if max_fee_per_gas < minimum {
                return Err(PoolError::FeeTooLow {
                    max_fee_per_gas,
                    minimum: chain.min_max_fee_per_gas,
                });
            }
        }

        let record = UserOperationRecord::new_local(
            chain.chain_id,
            request.entry_point,
            request.user_operation,
            request.associated_user_operations,
        );
        let siblings: Vec<_> = record
            .associated_user_ops
            .iter()
            .map(|sibling| record.associated_record(sibling))
            .collect();

        let mut slots = HashSet::new();
        let mut hashes = HashSet::new();
        for candidate in std::iter::once(&record).chain(&siblings) {
            if !slots.insert(candidate.slot()) || !hashes.insert(candidate.user_op_hash) {
                return Err(PoolError::InvalidOperation(format!(
                    "nonce {} of sender {} appears twice in one submission",
                    candidate.nonce_value, candidate.sender
                )));
            }
            if self
                .repository
                .get_user_operation(candidate.user_op_hash)
                .await?
                .is_some()
            {
                return Err(PoolError::DuplicateOperation(candidate.user_op_hash));
            }
        }

        let mut batch = WriteBatch::new();
        let mut replaced = HashSet::new();
        for candidate in std::iter::once(&record).chain(&siblings) {
            let Some(existing) = self
                .repository
                .find_user_operation_by_slot(&candidate.slot())
                .await?
            else {
                continue;
            };
            if !replaced.insert(existing.user_op_hash) {
                continue;
            }
            self.ensure_replaceable(&existing).await?;

            debug!(
                chain_id = chain.chain_id,
                replaced = %existing.user_op_hash,
                replacement = %candidate.user_op_hash,
                "Replacing stale user operation"
            );
            batch.delete_user_operation(existing.user_op_hash);
            for sibling in &existing.associated_user_ops {
                if replaced.insert(sibling.user_op_hash) {
                    batch.delete_user_operation(sibling.user_op_hash);
                }
            }
        }

        for sibling in siblings {
            batch.upsert_user_operation(sibling);
        }
        let user_op_hash = record.user_op_hash;
        let sender = record.sender;
        let nonce = record.origin.nonce();
        batch.upsert_user_operation(record);

        match self.repository.commit(batch).await {
            Ok(()) => {}
            Err(DatastoreError::UniqueViolation(reason)) => {
                debug!(%user_op_hash, %reason, "Admission lost a race for its slot");
                return Err(PoolError::DuplicateOperation(user_op_hash));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            chain_id = chain.chain_id,
            %user_op_hash,
            %sender,
            %nonce,
            "Admitted user operation"
        );
        self.notifier.emit(BundlerEvent::UserOperationAdmitted {
            chain_id: chain.chain_id,
            user_op_hash,
            sender,
            nonce,
        });
        Ok(user_op_hash)
    }

    async fn ensure_replaceable(&self, existing: &UserOperationRecord) -> Result<(), PoolError> {
        let conflict = PoolError::DuplicateOperation(existing.user_op_hash);
        let done = existing.status == UserOperationStatus::Done;

        if existing.is_sibling() && !done {
            return Err(conflict);
        }
        if !done {
            if let Some(transaction_id) = existing.transaction_id {
                let live = self
                    .repository
                    .get_transaction(transaction_id)
                    .await?
                    .is_some_and(|tx| tx.status != TransactionStatus::Done);
                if live {
                    return Err(conflict);
                }
            }
        }

        let idle = Utc::now() - existing.updated_at;
        let cooled_down = idle
            .to_std()
            .is_ok_and(|idle| idle >= self.settings.replacement_cooldown);
        if !cooled_down || self.locks.is_locked(&existing.user_op_hash) {
            return Err(conflict);
        }
        Ok(())
    }

    /// Random sample of up to `limit` Local operations, each locked for packing.
    ///
    /// Operations already locked by an overlapping round are skipped.
    pub async fn pick_batch(
        &self,
        chain_id: u64,
        limit: usize,
    ) -> Result<Vec<LockedOperation>, PoolError> {
        let mut records = self
            .repository
            .list_user_operations(chain_id, UserOperationStatus::Local)
            .await?;
        records.shuffle(&mut rand::thread_rng());

        let mut picked = Vec::with_capacity(limit.min(records.len()));
        for record in records {
            if picked.len() >= limit {
                break;
            }
            if let Some(guard) = self.locks.try_lock(record.user_op_hash) {
                picked.push(LockedOperation { record, guard });
            }
        }
        Ok(picked)
    }

    /// Drops Local operations past the maximum age, then the oldest beyond capacity.
    pub async fn evict(&self, chain_id: u64) -> Result<usize, PoolError> {
        let records = self
            .repository
            .list_user_operations(chain_id, UserOperationStatus::Local)
            .await?;
        let now = Utc::now();

        let mut dropped = Vec::new();
        let mut kept = Vec::new();
        for record in records {
            let expired = (now - record.created_at)
                .to_std()
                .is_ok_and(|age| age > self.settings.max_op_age);
            if expired {
                dropped.push((record, DropReason::Expired));
            } else {
                kept.push(record);
            }
        }

        let overflow = kept.len().saturating_sub(self.settings.max_pool_size);
        dropped.extend(
            kept.into_iter()
                .take(overflow)
                .map(|record| (record, DropReason::PoolFull)),
        );

        // records being packed right now are left for the next round
        dropped.retain(|(record, _)| !self.locks.is_locked(&record.user_op_hash));
        if dropped.is_empty() {
            return Ok(0);
        }
        self.remove(chain_id, dropped).await
    }

    /// Permanently removes operations that can never be bundled.
    pub async fn discard(
        &self,
        records: Vec<(UserOperationRecord, DropReason)>,
    ) -> Result<usize, PoolError> {
        let Some(chain_id) = records.first().map(|(record, _)| record.chain_id) else {
            return Ok(0);
        };
        for (record, reason) in &records {
            warn!(
                chain_id = record.chain_id,
                user_op_hash = %record.user_op_hash,
                ?reason,
                "Discarding user operation that cannot be bundled"
            );
        }
        self.remove(chain_id, records).await
    }

    /// Removes every Local operation of the chain.
    pub async fn clear_local(&self, chain_id: u64) -> Result<usize, PoolError> {
        let records = self
            .repository
            .list_user_operations(chain_id, UserOperationStatus::Local)
            .await?;
        self.remove(
            chain_id,
            records
                .into_iter()
                .map(|record| (record, DropReason::Cleared))
                .collect(),
        )
        .await
    }

    /// Operations admitted on the chain that have not reached Done yet.
    pub async fn pending_count(&self, chain_id: u64) -> Result<usize, PoolError> {
        let local = self
            .repository
            .count_user_operations(chain_id, UserOperationStatus::Local)
            .await?;
        let pending = self
            .repository
            .count_user_operations(chain_id, UserOperationStatus::Pending)
            .await?;
        Ok(local + pending)
    }

    async fn remove(
        &self,
        chain_id: u64,
        records: Vec<(UserOperationRecord, DropReason)>,
    ) -> Result<usize, PoolError> {
        let mut batch = WriteBatch::new();
        for (record, _) in &records {
            batch.delete_user_operation(record.user_op_hash);
            for sibling in &record.associated_user_ops {
                batch.delete_user_operation(sibling.user_op_hash);
            }
        }
        self.repository.commit(batch).await?;

        let removed = records.len();
        for (record, reason) in records {
            self.notifier.emit(BundlerEvent::UserOperationDropped {
                chain_id,
                user_op_hash: record.user_op_hash,
                reason,
            });
        }
        info!(chain_id, removed, "Removed user operations from pool");
        Ok(removed)
    }
}
