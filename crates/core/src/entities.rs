//! Persisted records shared by the pool, the submitter and the monitor.
use std::collections::HashMap;
use std::fmt;

use alloy_primitives::{Address, B256, Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gas::GasProfile;
use crate::user_operation::{UserOperationPayload, VersionedUserOperation};

/// Time-ordered transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserOperationStatus {
    Local,
    Pending,
    Done,
    Associated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Local,
    Pending,
    Done,
}

/// Uniqueness key of a user operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationSlot {
    pub chain_id: u64,
    pub sender: Address,
    pub nonce_key: U256,
    pub nonce_value: U256,
}

/// A sibling operation that must land in the same transaction as its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedUserOperation {
    pub user_op_hash: B256,
    pub user_operation: VersionedUserOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationRecord {
    pub id: Uuid,
    pub chain_id: u64,
    pub entry_point: Address,
    pub user_op_hash: B256,
    pub sender: Address,
    pub nonce_key: U256,
    pub nonce_value: U256,
    pub origin: VersionedUserOperation,
    pub status: UserOperationStatus,
    pub transaction_id: Option<TransactionId>,
    pub tx_hash: Option<B256>,
    pub block_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub associated_user_ops: Vec<AssociatedUserOperation>,
    pub parent_user_op_hash: Option<B256>,
    /// Consecutive rounds in which this operation alone failed gas estimation.
    #[serde(default)]
    pub estimate_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserOperationRecord {
    /// Builds a freshly admitted record; siblings are hashed but not yet persisted.
    pub fn new_local(
        chain_id: u64,
        entry_point: Address,
        origin: VersionedUserOperation,
        associated: Vec<VersionedUserOperation>,
    ) -> Self {
        let now = Utc::now();
        let nonce = origin.nonce_parts();
        let associated_user_ops = associated
            .into_iter()
            .map(|user_operation| AssociatedUserOperation {
                user_op_hash: user_operation.hash(entry_point, chain_id),
                user_operation,
            })
            .collect();

        Self {
            id: Uuid::now_v7(),
            chain_id,
            entry_point,
            user_op_hash: origin.hash(entry_point, chain_id),
            sender: origin.sender(),
            nonce_key: nonce.key,
            nonce_value: nonce.value,
            origin,
            status: UserOperationStatus::Local,
            transaction_id: None,
            tx_hash: None,
            block_hash: None,
            block_number: None,
            associated_user_ops,
            parent_user_op_hash: None,
            estimate_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record reserving a sibling's slot under this parent.
    pub fn associated_record(&self, sibling: &AssociatedUserOperation) -> Self {
        let nonce = sibling.user_operation.nonce_parts();
        Self {
            id: Uuid::now_v7(),
            chain_id: self.chain_id,
            entry_point: self.entry_point,
            user_op_hash: sibling.user_op_hash,
            sender: sibling.user_operation.sender(),
            nonce_key: nonce.key,
            nonce_value: nonce.value,
            origin: sibling.user_operation.clone(),
            status: UserOperationStatus::Associated,
            transaction_id: None,
            tx_hash: None,
            block_hash: None,
            block_number: None,
            associated_user_ops: Vec::new(),
            parent_user_op_hash: Some(self.user_op_hash),
            estimate_failures: 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub const fn slot(&self) -> OperationSlot {
        OperationSlot {
            chain_id: self.chain_id,
            sender: self.sender,
            nonce_key: self.nonce_key,
            nonce_value: self.nonce_value,
        }
    }

    pub const fn is_sibling(&self) -> bool {
        self.parent_user_op_hash.is_some()
    }

    /// Parent plus siblings, ordered by (sender, nonce key, nonce value).
    pub fn flattened(&self) -> Vec<(B256, VersionedUserOperation)> {
        let mut ops = Vec::with_capacity(1 + self.associated_user_ops.len());
        ops.push((self.user_op_hash, self.origin.clone()));
        ops.extend(
            self.associated_user_ops
                .iter()
                .map(|sibling| (sibling.user_op_hash, sibling.user_operation.clone())),
        );
        ops.sort_by_key(|(_, op)| (op.sender(), op.nonce_parts()));
        ops
    }

    /// Combined gas of the parent and its siblings.
    pub fn total_gas(&self, profile: &GasProfile) -> u64 {
        self.associated_user_ops
            .iter()
            .map(|sibling| sibling.user_operation.total_gas(profile))
            .fold(self.origin.total_gas(profile), u64::saturating_add)
    }

    pub fn mark_pending(&mut self, transaction_id: TransactionId) {
        self.status = UserOperationStatus::Pending;
        self.transaction_id = Some(transaction_id);
        self.updated_at = Utc::now();
    }

    /// Detaches from the owning transaction; siblings fall back to `Associated`.
    pub fn revert_to_local(&mut self) {
        self.status = if self.is_sibling() {
            UserOperationStatus::Associated
        } else {
            UserOperationStatus::Local
        };
        self.transaction_id = None;
        self.tx_hash = None;
        self.block_hash = None;
        self.block_number = None;
        self.updated_at = Utc::now();
    }

    /// A `None` receipt finalizes the operation as dropped with empty fields.
    pub fn mark_done(&mut self, receipt: Option<&TransactionReceipt>) {
        self.status = UserOperationStatus::Done;
        self.tx_hash = receipt.map(|r| r.transaction_hash);
        self.block_hash = receipt.and_then(|r| r.block_hash);
        self.block_number = receipt.and_then(|r| r.block_number);
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub success: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// Fee shape of a bundle transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GasFees {
    #[serde(rename_all = "camelCase")]
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    #[serde(rename_all = "camelCase")]
    Legacy { gas_price: u128 },
}

impl GasFees {
    /// Highest price per gas this transaction may pay.
    pub const fn max_fee_per_gas(&self) -> u128 {
        match self {
            Self::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
            Self::Legacy { gas_price } => *gas_price,
        }
    }
}

/// Call fields of a bundle transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub call_data: Bytes,
    pub gas_limit: u64,
    pub fees: GasFees,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub user_operation_hashes: Vec<B256>,
    pub call_data: Bytes,
    pub gas_limit: u64,
    pub fees: GasFees,
    pub signed_txs: HashMap<B256, Bytes>,
    pub status: TransactionStatus,
    pub tx_hashes: Vec<B256>,
    pub confirmations: u64,
    pub receipts: HashMap<B256, TransactionReceipt>,
    pub user_operation_hash_map_tx_hash: HashMap<B256, B256>,
    pub retry_count: u32,
    pub latest_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new_local(
        unsigned: UnsignedTransaction,
        user_operation_hashes: Vec<B256>,
        signed: SignedTransaction,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            chain_id: unsigned.chain_id,
            from: unsigned.from,
            to: unsigned.to,
            nonce: unsigned.nonce,
            user_operation_hashes,
            call_data: unsigned.call_data,
            gas_limit: unsigned.gas_limit,
            fees: unsigned.fees,
            signed_txs: HashMap::from([(signed.hash, signed.raw)]),
            status: TransactionStatus::Local,
            tx_hashes: vec![signed.hash],
            confirmations: 0,
            receipts: HashMap::new(),
            user_operation_hash_map_tx_hash: HashMap::new(),
            retry_count: 0,
            latest_sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn unsigned(&self) -> UnsignedTransaction {
        UnsignedTransaction {
            chain_id: self.chain_id,
            from: self.from,
            to: self.to,
            nonce: self.nonce,
            call_data: self.call_data.clone(),
            gas_limit: self.gas_limit,
            fees: self.fees,
        }
    }

    pub fn latest_tx_hash(&self) -> Option<B256> {
        self.tx_hashes.last().copied()
    }

    pub fn latest_signed_tx(&self) -> Option<&Bytes> {
        self.latest_tx_hash().and_then(|hash| self.signed_txs.get(&hash))
    }

    pub fn mark_sent(&mut self) {
        let now = Utc::now();
        self.status = TransactionStatus::Pending;
        self.latest_sent_at = Some(now);
        self.updated_at = now;
    }

    /// Appends a fee-escalated replacement to the history.
    pub fn record_replacement(&mut self, signed: SignedTransaction, fees: GasFees) {
        let now = Utc::now();
        self.tx_hashes.push(signed.hash);
        self.signed_txs.insert(signed.hash, signed.raw);
        self.fees = fees;
        self.retry_count += 1;
        self.latest_sent_at = Some(now);
        self.updated_at = now;
    }

    /// Age of the last broadcast, falling back to creation time.
    pub fn pending_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.latest_sent_at.unwrap_or(self.created_at)
    }

    /// Resolves every member operation to the receipt that included it.
    pub fn finalize(&mut self, resolved: HashMap<B256, TransactionReceipt>) {
        for (user_op_hash, receipt) in &resolved {
            self.user_operation_hash_map_tx_hash
                .insert(*user_op_hash, receipt.transaction_hash);
        }
        for receipt in resolved.into_values() {
            self.receipts.insert(receipt.transaction_hash, receipt);
        }
        self.status = TransactionStatus::Done;
        self.updated_at = Utc::now();
    }
}
