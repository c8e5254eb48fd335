//! Entry point contract ABI: `handleOps` calldata and `UserOperationEvent` matching.
use alloy_primitives::{Address, B256, Bytes, address};
use alloy_sol_types::{SolCall, SolEvent, sol};

use crate::user_operation::{
    EntryPointVersion, UserOperationV06, UserOperationV07, VersionedUserOperation,
};

/// Canonical v0.6 entry point deployment.
pub const ENTRY_POINT_V06: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");
/// Canonical v0.7 entry point deployment.
pub const ENTRY_POINT_V07: Address = address!("0000000071727De22E5E9d8BAf0edAc6f37da032");

/// Version of a canonical entry point deployment.
pub fn canonical_version(entry_point: &Address) -> Option<EntryPointVersion> {
    match *entry_point {
        ENTRY_POINT_V06 => Some(EntryPointVersion::V06),
        ENTRY_POINT_V07 => Some(EntryPointVersion::V07),
        _ => None,
    }
}

sol! {
    interface IEntryPointV06 {
        struct UserOperation {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            uint256 callGasLimit;
            uint256 verificationGasLimit;
            uint256 preVerificationGas;
            uint256 maxFeePerGas;
            uint256 maxPriorityFeePerGas;
            bytes paymasterAndData;
            bytes signature;
        }

        function handleOps(UserOperation[] calldata ops, address payable beneficiary) external;

        event UserOperationEvent(
            bytes32 indexed userOpHash,
            address indexed sender,
            address indexed paymaster,
            uint256 nonce,
            bool success,
            uint256 actualGasCost,
            uint256 actualGasUsed
        );
    }

    interface IEntryPointV07 {
        struct PackedUserOperation {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            bytes32 accountGasLimits;
            uint256 preVerificationGas;
            bytes32 gasFees;
            bytes paymasterAndData;
            bytes signature;
        }

        function handleOps(PackedUserOperation[] calldata ops, address payable beneficiary) external;
    }
}

/// `UserOperationEvent` topic0; identical across entry point versions.
pub const USER_OPERATION_EVENT_TOPIC: B256 = IEntryPointV06::UserOperationEvent::SIGNATURE_HASH;

impl From<&UserOperationV06> for IEntryPointV06::UserOperation {
    fn from(op: &UserOperationV06) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            initCode: op.init_code.clone(),
            callData: op.call_data.clone(),
            callGasLimit: op.call_gas_limit,
            verificationGasLimit: op.verification_gas_limit,
            preVerificationGas: op.pre_verification_gas,
            maxFeePerGas: op.max_fee_per_gas,
            maxPriorityFeePerGas: op.max_priority_fee_per_gas,
            paymasterAndData: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}

impl From<&UserOperationV07> for IEntryPointV07::PackedUserOperation {
    fn from(op: &UserOperationV07) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            initCode: op.init_code(),
            callData: op.call_data.clone(),
            accountGasLimits: op.account_gas_limits(),
            preVerificationGas: op.pre_verification_gas,
            gasFees: op.gas_fees(),
            paymasterAndData: op.paymaster_and_data(),
            signature: op.signature.clone(),
        }
    }
}

/// Encodes `handleOps(ops, beneficiary)`.
///
/// Returns `None` for an empty bundle or one mixing entry point versions.
pub fn encode_handle_ops(ops: &[VersionedUserOperation], beneficiary: Address) -> Option<Bytes> {
    match ops.first()? {
        VersionedUserOperation::EntryPointV06(_) => {
            let ops = ops
                .iter()
                .map(|op| match op {
                    VersionedUserOperation::EntryPointV06(op) => Some(op.into()),
                    VersionedUserOperation::EntryPointV07(_) => None,
                })
                .collect::<Option<Vec<IEntryPointV06::UserOperation>>>()?;
            Some(IEntryPointV06::handleOpsCall { ops, beneficiary }.abi_encode().into())
        }
        VersionedUserOperation::EntryPointV07(_) => {
            let ops = ops
                .iter()
                .map(|op| match op {
                    VersionedUserOperation::EntryPointV07(op) => Some(op.into()),
                    VersionedUserOperation::EntryPointV06(_) => None,
                })
                .collect::<Option<Vec<IEntryPointV07::PackedUserOperation>>>()?;
            Some(IEntryPointV07::handleOpsCall { ops, beneficiary }.abi_encode().into())
        }
    }
}

/// Extracts the user operation hash from a `UserOperationEvent` log's topics.
pub fn user_op_hash_from_topics(topics: &[B256]) -> Option<B256> {
    match topics {
        [signature, user_op_hash, ..] if *signature == USER_OPERATION_EVENT_TOPIC => Some(*user_op_hash),
        _ => None,
    }
}
