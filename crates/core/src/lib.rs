//! Shared data model of the bundler: user operation payloads, persisted
//! records, entry point ABI, per-chain configuration and advisory locks.
pub mod config;
pub mod entities;
pub mod entry_point;
pub mod gas;
pub mod lock;
pub mod logger;
pub mod nonce;
pub mod user_operation;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{BundlerSettings, ChainConfig};
pub use entities::{
    AssociatedUserOperation, GasFees, OperationSlot, SignedTransaction, TransactionId,
    TransactionReceipt, TransactionRecord, TransactionStatus, UnsignedTransaction,
    UserOperationRecord, UserOperationStatus,
};
pub use gas::{GasLimits, GasProfile};
pub use lock::{TtlLockGuard, TtlLockSet};
pub use nonce::{NonceParts, pack_nonce, unpack_nonce};
pub use user_operation::{
    EntryPointVersion, UserOperationPayload, UserOperationRequest, UserOperationV06,
    UserOperationV07, VersionedUserOperation,
};
