use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, B256};
use bundler_core::{
    OperationSlot, TransactionId, TransactionRecord, TransactionStatus, UserOperationRecord,
    UserOperationStatus,
};
use parking_lot::RwLock;
use tracing::debug;

use crate::traits::{
    DatastoreError, Repository, Result, TransactionOrder, TransactionQuery, WriteBatch, WriteOp,
};

type SignerSlot = (u64, Address, u64);

#[derive(Debug, Default)]
struct State {
    user_ops: HashMap<B256, UserOperationRecord>,
    op_slots: HashMap<OperationSlot, B256>,
    transactions: BTreeMap<TransactionId, TransactionRecord>,
    tx_slots: HashMap<SignerSlot, TransactionId>,
}

const fn signer_slot(tx: &TransactionRecord) -> SignerSlot {
    (tx.chain_id, tx.from, tx.nonce)
}

/// Prior value of one entry a commit touched.
#[derive(Debug)]
enum Undo {
    UserOp(B256, Option<UserOperationRecord>),
    OpSlot(OperationSlot, Option<B256>),
    Transaction(TransactionId, Option<TransactionRecord>),
    TxSlot(SignerSlot, Option<TransactionId>),
}

/// Mutations of one commit, with what they replaced.
#[derive(Debug, Default)]
struct Journal {
    undo: Vec<Undo>,
    /// Operations whose owner must be rechecked before the commit lands.
    touched: Vec<B256>,
}

impl State {
    fn apply(&mut self, op: WriteOp, journal: &mut Journal) -> Result<()> {
        match op {
            WriteOp::InsertTransaction(tx) => {
                if self.transactions.contains_key(&tx.id) {
                    return Err(DatastoreError::UniqueViolation(format!("transaction id {}", tx.id)));
                }
                self.claim_tx_slot(&tx, journal)?;
                self.check_members_free(&tx)?;
                self.put_transaction(tx.id, Some(*tx), journal);
            }
            WriteOp::UpdateTransaction(tx) => {
                let Some(existing) = self.transactions.get(&tx.id) else {
                    return Err(DatastoreError::NotFound(format!("transaction {}", tx.id)));
                };
                let previous = signer_slot(existing);
                if previous != signer_slot(&tx) {
                    self.put_tx_slot(previous, None, journal);
                    self.claim_tx_slot(&tx, journal)?;
                }
                self.put_transaction(tx.id, Some(*tx), journal);
            }
            WriteOp::DeleteTransaction(id) => {
                let Some(tx) = self.put_transaction(id, None, journal) else {
                    return Err(DatastoreError::NotFound(format!("transaction {id}")));
                };
                self.put_tx_slot(signer_slot(&tx), None, journal);
                journal.touched.extend(tx.user_operation_hashes);
            }
            WriteOp::UpsertUserOperation(record) => {
                let slot = record.slot();
                match self.op_slots.get(&slot) {
                    Some(holder) if *holder != record.user_op_hash => {
                        return Err(DatastoreError::UniqueViolation(format!(
                            "slot ({}, {}, {}, {}) held by {holder}",
                            slot.chain_id, slot.sender, slot.nonce_key, slot.nonce_value
                        )));
                    }
                    _ => {}
                }
                if let Some(previous) = self.user_ops.get(&record.user_op_hash).map(UserOperationRecord::slot) {
                    self.put_op_slot(previous, None, journal);
                }
                self.put_op_slot(slot, Some(record.user_op_hash), journal);
                journal.touched.push(record.user_op_hash);
                self.put_user_op(record.user_op_hash, Some(*record), journal);
            }
            WriteOp::DeleteUserOperation(hash) => {
                if let Some(record) = self.put_user_op(hash, None, journal) {
                    self.put_op_slot(record.slot(), None, journal);
                }
            }
        }
        Ok(())
    }

    fn put_user_op(
        &mut self,
        hash: B256,
        record: Option<UserOperationRecord>,
        journal: &mut Journal,
    ) -> Option<UserOperationRecord> {
        let previous = match record {
            Some(record) => self.user_ops.insert(hash, record),
            None => self.user_ops.remove(&hash),
        };
        journal.undo.push(Undo::UserOp(hash, previous.clone()));
        previous
    }

    fn put_op_slot(&mut self, slot: OperationSlot, hash: Option<B256>, journal: &mut Journal) {
        let previous = match hash {
            Some(hash) => self.op_slots.insert(slot, hash),
            None => self.op_slots.remove(&slot),
        };
        journal.undo.push(Undo::OpSlot(slot, previous));
    }

    fn put_transaction(
        &mut self,
        id: TransactionId,
        tx: Option<TransactionRecord>,
        journal: &mut Journal,
    ) -> Option<TransactionRecord> {
        let previous = match tx {
            Some(tx) => self.transactions.insert(id, tx),
            None => self.transactions.remove(&id),
        };
        journal.undo.push(Undo::Transaction(id, previous.clone()));
        previous
    }

    fn put_tx_slot(&mut self, slot: SignerSlot, id: Option<TransactionId>, journal: &mut Journal) {
        let previous = match id {
            Some(id) => self.tx_slots.insert(slot, id),
            None => self.tx_slots.remove(&slot),
        };
        journal.undo.push(Undo::TxSlot(slot, previous));
    }

    /// Restores every touched entry, newest first.
    fn rollback(&mut self, journal: Journal) {
        for undo in journal.undo.into_iter().rev() {
            match undo {
                Undo::UserOp(hash, Some(record)) => {
                    self.user_ops.insert(hash, record);
                }
                Undo::UserOp(hash, None) => {
                    self.user_ops.remove(&hash);
                }
                Undo::OpSlot(slot, Some(hash)) => {
                    self.op_slots.insert(slot, hash);
                }
                Undo::OpSlot(slot, None) => {
                    self.op_slots.remove(&slot);
                }
                Undo::Transaction(id, Some(tx)) => {
                    self.transactions.insert(id, tx);
                }
                Undo::Transaction(id, None) => {
                    self.transactions.remove(&id);
                }
                Undo::TxSlot(slot, Some(id)) => {
                    self.tx_slots.insert(slot, id);
                }
                Undo::TxSlot(slot, None) => {
                    self.tx_slots.remove(&slot);
                }
            }
        }
    }

    fn claim_tx_slot(&mut self, tx: &TransactionRecord, journal: &mut Journal) -> Result<()> {
        let slot = signer_slot(tx);
        if let Some(holder) = self.tx_slots.get(&slot) {
            if *holder != tx.id {
                return Err(DatastoreError::UniqueViolation(format!(
                    "signer slot ({}, {}, {}) held by transaction {holder}",
                    slot.0, slot.1, slot.2
                )));
            }
        }
        self.put_tx_slot(slot, Some(tx.id), journal);
        Ok(())
    }

    /// A new transaction may not take members another live transaction holds.
    fn check_members_free(&self, tx: &TransactionRecord) -> Result<()> {
        for hash in &tx.user_operation_hashes {
            let Some(record) = self.user_ops.get(hash) else {
                continue;
            };
            if record.status != UserOperationStatus::Pending {
                continue;
            }
            if let Some(owner) = record.transaction_id.filter(|owner| *owner != tx.id) {
                let live = self
                    .transactions
                    .get(&owner)
                    .is_some_and(|owner| owner.status != TransactionStatus::Done);
                if live {
                    return Err(DatastoreError::PendingConflict {
                        user_op_hash: *hash,
                        transaction_id: owner,
                    });
                }
            }
        }
        Ok(())
    }

    /// Every touched Pending operation must point at a transaction that exists.
    fn validate(&self, touched: &[B256]) -> Result<()> {
        for record in touched.iter().filter_map(|hash| self.user_ops.get(hash)) {
            if record.status != UserOperationStatus::Pending {
                continue;
            }
            match record.transaction_id {
                Some(id) if self.transactions.contains_key(&id) => {}
                Some(id) => {
                    return Err(DatastoreError::NotFound(format!(
                        "transaction {id} owning pending user operation {}",
                        record.user_op_hash
                    )));
                }
                None => {
                    return Err(DatastoreError::NotFound(format!(
                        "transaction owning pending user operation {}",
                        record.user_op_hash
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Repository held entirely in memory.
///
/// A commit mutates the state in place under the write lock and journals what
/// it replaced; a failed mutation or constraint check restores the journal.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
    async fn get_user_operation(&self, user_op_hash: B256) -> Result<Option<UserOperationRecord>> {
        Ok(self.state.read().user_ops.get(&user_op_hash).cloned())
    }

    async fn get_user_operations(&self, user_op_hashes: &[B256]) -> Result<Vec<UserOperationRecord>> {
        let state = self.state.read();
        Ok(user_op_hashes
            .iter()
            .filter_map(|hash| state.user_ops.get(hash).cloned())
            .collect())
    }

    async fn find_user_operation_by_slot(
        &self,
        slot: &OperationSlot,
    ) -> Result<Option<UserOperationRecord>> {
        let state = self.state.read();
        Ok(state
            .op_slots
            .get(slot)
            .and_then(|hash| state.user_ops.get(hash))
            .cloned())
    }

    async fn list_user_operations(
        &self,
        chain_id: u64,
        status: UserOperationStatus,
    ) -> Result<Vec<UserOperationRecord>> {
        let mut records: Vec<_> = self
            .state
            .read()
            .user_ops
            .values()
            .filter(|record| record.chain_id == chain_id && record.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn count_user_operations(&self, chain_id: u64, status: UserOperationStatus) -> Result<usize> {
        Ok(self
            .state
            .read()
            .user_ops
            .values()
            .filter(|record| record.chain_id == chain_id && record.status == status)
            .count())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        Ok(self.state.read().transactions.get(&id).cloned())
    }

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>> {
        let mut transactions: Vec<_> = self
            .state
            .read()
            .transactions
            .values()
            .filter(|tx| query.matches(tx))
            .cloned()
            .collect();
        if query.order == TransactionOrder::Confirmations {
            transactions.sort_by_key(|tx| (tx.confirmations, tx.id));
        }
        if let Some(limit) = query.limit {
            transactions.truncate(limit);
        }
        Ok(transactions)
    }

    async fn latest_transaction_for_signer(
        &self,
        chain_id: u64,
        from: Address,
    ) -> Result<Option<TransactionRecord>> {
        Ok(self
            .state
            .read()
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.from == from)
            .max_by_key(|tx| tx.nonce)
            .cloned())
    }

    async fn count_transactions(
        &self,
        chain_id: u64,
        from: Address,
        status: TransactionStatus,
    ) -> Result<u64> {
        Ok(self
            .state
            .read()
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.from == from && tx.status == status)
            .count() as u64)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let size = batch.len();
        let mut state = self.state.write();
        let mut journal = Journal::default();
        let mut applied = Ok(());
        for op in batch.into_ops() {
            applied = state.apply(op, &mut journal);
            if applied.is_err() {
                break;
            }
        }
        if let Err(e) = applied.and_then(|()| state.validate(&journal.touched)) {
            state.rollback(journal);
            return Err(e);
        }
        debug!(message = "committed write batch", ops = size);
        Ok(())
    }
}
