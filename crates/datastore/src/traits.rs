use alloy_primitives::{Address, B256};
use bundler_core::{
    OperationSlot, TransactionId, TransactionRecord, TransactionStatus, UserOperationRecord,
    UserOperationStatus,
};
use chrono::{DateTime, Utc};

pub type Result<T> = std::result::Result<T, DatastoreError>;

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("user operation {user_op_hash} is already pending in transaction {transaction_id}")]
    PendingConflict {
        user_op_hash: B256,
        transaction_id: TransactionId,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// One mutation inside an atomic [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertTransaction(Box<TransactionRecord>),
    UpdateTransaction(Box<TransactionRecord>),
    DeleteTransaction(TransactionId),
    UpsertUserOperation(Box<UserOperationRecord>),
    DeleteUserOperation(B256),
}

/// Mutations applied all together or not at all, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transaction(&mut self, tx: TransactionRecord) -> &mut Self {
        self.ops.push(WriteOp::InsertTransaction(Box::new(tx)));
        self
    }

    pub fn update_transaction(&mut self, tx: TransactionRecord) -> &mut Self {
        self.ops.push(WriteOp::UpdateTransaction(Box::new(tx)));
        self
    }

    pub fn delete_transaction(&mut self, id: TransactionId) -> &mut Self {
        self.ops.push(WriteOp::DeleteTransaction(id));
        self
    }

    pub fn upsert_user_operation(&mut self, op: UserOperationRecord) -> &mut Self {
        self.ops.push(WriteOp::UpsertUserOperation(Box::new(op)));
        self
    }

    pub fn delete_user_operation(&mut self, user_op_hash: B256) -> &mut Self {
        self.ops.push(WriteOp::DeleteUserOperation(user_op_hash));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionOrder {
    /// Fewest confirmations first, ties broken by id.
    Confirmations,
    /// Oldest id first.
    #[default]
    Id,
}

/// Filter for [`Repository::list_transactions`].
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub chain_id: u64,
    pub status: Option<TransactionStatus>,
    pub from: Option<Address>,
    /// Last broadcast (or creation) at or after this instant.
    pub sent_after: Option<DateTime<Utc>>,
    /// Last broadcast (or creation) strictly before this instant.
    pub sent_before: Option<DateTime<Utc>>,
    pub order: TransactionOrder,
    pub limit: Option<usize>,
}

impl TransactionQuery {
    pub fn chain(chain_id: u64) -> Self {
        Self { chain_id, ..Default::default() }
    }

    pub const fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub const fn with_from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub const fn sent_after(mut self, at: DateTime<Utc>) -> Self {
        self.sent_after = Some(at);
        self
    }

    pub const fn sent_before(mut self, at: DateTime<Utc>) -> Self {
        self.sent_before = Some(at);
        self
    }

    pub const fn ordered_by(mut self, order: TransactionOrder) -> Self {
        self.order = order;
        self
    }

    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, tx: &TransactionRecord) -> bool {
        let sent_at = tx.latest_sent_at.unwrap_or(tx.created_at);
        tx.chain_id == self.chain_id
            && self.status.is_none_or(|status| tx.status == status)
            && self.from.is_none_or(|from| tx.from == from)
            && self.sent_after.is_none_or(|after| sent_at >= after)
            && self.sent_before.is_none_or(|before| sent_at < before)
    }
}

/// Trait defining the interface for bundler record storage
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn get_user_operation(&self, user_op_hash: B256) -> Result<Option<UserOperationRecord>>;

    /// Records for the given hashes, skipping unknown ones.
    async fn get_user_operations(&self, user_op_hashes: &[B256]) -> Result<Vec<UserOperationRecord>>;

    async fn find_user_operation_by_slot(
        &self,
        slot: &OperationSlot,
    ) -> Result<Option<UserOperationRecord>>;

    async fn list_user_operations(
        &self,
        chain_id: u64,
        status: UserOperationStatus,
    ) -> Result<Vec<UserOperationRecord>>;

    async fn count_user_operations(&self, chain_id: u64, status: UserOperationStatus) -> Result<usize>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>>;

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>>;

    /// The signer's transaction with the highest nonce, in any status.
    async fn latest_transaction_for_signer(
        &self,
        chain_id: u64,
        from: Address,
    ) -> Result<Option<TransactionRecord>>;

    async fn count_transactions(
        &self,
        chain_id: u64,
        from: Address,
        status: TransactionStatus,
    ) -> Result<u64>;

    /// Applies every mutation of the batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}
