use alloy_primitives::{Address, B256, U256};
use bundler_core::{TransactionId, TransactionReceipt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// The operation alone needs more gas than a bundle may carry.
    ExceedsBundleGas,
    /// The operation and its siblings outnumber the bundle size cap.
    ExceedsPackCount,
    /// Bundling the operation keeps failing: wrong entry point version or a
    /// reverting gas estimate.
    Unbundleable,
    Expired,
    PoolFull,
    Cleared,
}

/// Advisory cache updates shared between sibling bundler processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Hint {
    #[serde(rename_all = "camelCase")]
    DoneNonce {
        chain_id: u64,
        signer: Address,
        nonce: u64,
    },
    #[serde(rename_all = "camelCase")]
    Receipt {
        chain_id: u64,
        receipt: TransactionReceipt,
    },
}

impl Hint {
    pub const fn chain_id(&self) -> u64 {
        match self {
            Self::DoneNonce { chain_id, .. } | Self::Receipt { chain_id, .. } => *chain_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BundlerEvent {
    UserOperationAdmitted {
        chain_id: u64,
        user_op_hash: B256,
        sender: Address,
        nonce: U256,
    },
    UserOperationDropped {
        chain_id: u64,
        user_op_hash: B256,
        reason: DropReason,
    },
    TransactionSubmitted {
        chain_id: u64,
        transaction_id: TransactionId,
        signer: Address,
        nonce: u64,
        tx_hash: B256,
        user_op_hashes: Vec<B256>,
    },
    TransactionReplaced {
        chain_id: u64,
        transaction_id: TransactionId,
        tx_hash: B256,
        retry_count: u32,
    },
    TransactionFinalized {
        chain_id: u64,
        transaction_id: TransactionId,
        tx_hash: Option<B256>,
        success: bool,
        mev_preempted: bool,
    },
    TransactionInvalidated {
        chain_id: u64,
        transaction_id: TransactionId,
        reason: String,
    },
    SignerBlocked {
        chain_id: u64,
        signer: Address,
        reason: String,
    },
    SignerUnblocked {
        chain_id: u64,
        signer: Address,
    },
    Alert {
        chain_id: Option<u64>,
        message: String,
    },
    Hint(Hint),
}

impl BundlerEvent {
    pub const fn chain_id(&self) -> Option<u64> {
        match self {
            Self::UserOperationAdmitted { chain_id, .. }
            | Self::UserOperationDropped { chain_id, .. }
            | Self::TransactionSubmitted { chain_id, .. }
            | Self::TransactionReplaced { chain_id, .. }
            | Self::TransactionFinalized { chain_id, .. }
            | Self::TransactionInvalidated { chain_id, .. }
            | Self::SignerBlocked { chain_id, .. }
            | Self::SignerUnblocked { chain_id, .. } => Some(*chain_id),
            Self::Alert { chain_id, .. } => *chain_id,
            Self::Hint(hint) => Some(hint.chain_id()),
        }
    }

    /// Partition key; events of one chain stay ordered.
    pub fn key(&self) -> String {
        self.chain_id()
            .map_or_else(|| "global".to_string(), |chain_id| chain_id.to_string())
    }
}
