//! Payload and record builders for tests across the workspace.
use alloy_primitives::{Address, Bytes, U256};

use crate::entities::UserOperationRecord;
use crate::entry_point::{ENTRY_POINT_V06, ENTRY_POINT_V07};
use crate::user_operation::{UserOperationV06, UserOperationV07, VersionedUserOperation};

pub const TEST_ENTRY_POINT: Address = ENTRY_POINT_V06;
pub const TEST_ENTRY_POINT_V07: Address = ENTRY_POINT_V07;
pub const TEST_CHAIN_ID: u64 = 8453;

const VERIFICATION_GAS: u64 = 100_000;
const PRE_VERIFICATION_GAS: u64 = 50_000;

/// v0.6 operation with the given call gas and a 1 gwei fee.
pub fn user_op_v06(sender: Address, nonce: U256, call_gas_limit: u64) -> VersionedUserOperation {
    VersionedUserOperation::EntryPointV06(UserOperationV06 {
        sender,
        nonce,
        init_code: Bytes::new(),
        call_data: Bytes::new(),
        call_gas_limit: U256::from(call_gas_limit),
        verification_gas_limit: U256::from(VERIFICATION_GAS),
        pre_verification_gas: U256::from(PRE_VERIFICATION_GAS),
        max_fee_per_gas: U256::from(1_000_000_000u64),
        max_priority_fee_per_gas: U256::from(1_000_000u64),
        paymaster_and_data: Bytes::new(),
        signature: Bytes::from_static(&[0x01]),
    })
}

pub fn user_op_v07(sender: Address, nonce: U256, call_gas_limit: u64) -> VersionedUserOperation {
    VersionedUserOperation::EntryPointV07(UserOperationV07 {
        sender,
        nonce,
        factory: None,
        factory_data: Bytes::new(),
        call_data: Bytes::new(),
        call_gas_limit: U256::from(call_gas_limit),
        verification_gas_limit: U256::from(VERIFICATION_GAS),
        pre_verification_gas: U256::from(PRE_VERIFICATION_GAS),
        max_fee_per_gas: U256::from(1_000_000_000u64),
        max_priority_fee_per_gas: U256::from(1_000_000u64),
        paymaster: None,
        paymaster_verification_gas_limit: U256::ZERO,
        paymaster_post_op_gas_limit: U256::ZERO,
        paymaster_data: Bytes::new(),
        signature: Bytes::from_static(&[0x01]),
    })
}

/// v0.6 operation whose total gas under the default profile equals `total_gas`.
pub fn user_op_with_total_gas(sender: Address, nonce: U256, total_gas: u64) -> VersionedUserOperation {
    user_op_v06(
        sender,
        nonce,
        total_gas.saturating_sub(VERIFICATION_GAS + PRE_VERIFICATION_GAS),
    )
}

/// Local record on [`TEST_CHAIN_ID`] and [`TEST_ENTRY_POINT`].
pub fn local_record(op: VersionedUserOperation) -> UserOperationRecord {
    UserOperationRecord::new_local(TEST_CHAIN_ID, TEST_ENTRY_POINT, op, Vec::new())
}

/// Sender derived from a small integer, for readable fixtures.
pub fn sender(n: u8) -> Address {
    Address::repeat_byte(n)
}
