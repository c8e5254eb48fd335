//! EIP-4337 Account Abstraction User Operation payloads
use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_sol_types::{SolValue, sol};
use serde::{Deserialize, Serialize};

use crate::gas::{GasLimits, GasProfile};
use crate::nonce::{NonceParts, unpack_nonce};

sol! {
    struct UserOperationV06Hashed {
        address sender;
        uint256 nonce;
        bytes32 initCodeHash;
        bytes32 callDataHash;
        uint256 callGasLimit;
        uint256 verificationGasLimit;
        uint256 preVerificationGas;
        uint256 maxFeePerGas;
        uint256 maxPriorityFeePerGas;
        bytes32 paymasterAndDataHash;
    }

    struct UserOperationV07Hashed {
        address sender;
        uint256 nonce;
        bytes32 initCodeHash;
        bytes32 callDataHash;
        bytes32 accountGasLimits;
        uint256 preVerificationGas;
        bytes32 gasFees;
        bytes32 paymasterAndDataHash;
    }
}

/// Entry point contract generation a payload targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryPointVersion {
    /// Entry point v0.6 (unpacked user operations).
    V06,
    /// Entry point v0.7+ (packed user operations).
    V07,
}

/// User Operation as defined by EIP-4337 v0.6
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationV06 {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// User Operation as defined by EIP-4337 v0.7+
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationV07 {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default)]
    pub factory_data: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default)]
    pub paymaster_verification_gas_limit: U256,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: U256,
    #[serde(default)]
    pub paymaster_data: Bytes,
    pub signature: Bytes,
}

fn low_128(value: U256) -> U256 {
    value & ((U256::from(1u64) << 128) - U256::from(1u64))
}

fn pack_u128_pair(high: U256, low: U256) -> B256 {
    B256::from((low_128(high) << 128) | low_128(low))
}

impl UserOperationV07 {
    /// `factory ++ factoryData`, empty when the account is already deployed.
    pub fn init_code(&self) -> Bytes {
        match self.factory {
            Some(factory) => {
                let mut buf = Vec::with_capacity(20 + self.factory_data.len());
                buf.extend_from_slice(factory.as_slice());
                buf.extend_from_slice(&self.factory_data);
                Bytes::from(buf)
            }
            None => Bytes::new(),
        }
    }

    /// `paymaster ++ uint128(verificationGas) ++ uint128(postOpGas) ++ paymasterData`.
    pub fn paymaster_and_data(&self) -> Bytes {
        match self.paymaster {
            Some(paymaster) => {
                let mut buf = Vec::with_capacity(52 + self.paymaster_data.len());
                buf.extend_from_slice(paymaster.as_slice());
                buf.extend_from_slice(
                    &low_128(self.paymaster_verification_gas_limit).to_be_bytes::<32>()[16..],
                );
                buf.extend_from_slice(
                    &low_128(self.paymaster_post_op_gas_limit).to_be_bytes::<32>()[16..],
                );
                buf.extend_from_slice(&self.paymaster_data);
                Bytes::from(buf)
            }
            None => Bytes::new(),
        }
    }

    pub fn account_gas_limits(&self) -> B256 {
        pack_u128_pair(self.verification_gas_limit, self.call_gas_limit)
    }

    pub fn gas_fees(&self) -> B256 {
        pack_u128_pair(self.max_priority_fee_per_gas, self.max_fee_per_gas)
    }
}

/// Final EIP-4337 hash: `keccak256(abi.encode(keccak256(pack(op)), entryPoint, chainId))`.
fn user_op_hash(packed_hash: B256, entry_point: Address, chain_id: u64) -> B256 {
    keccak256((packed_hash, entry_point, U256::from(chain_id)).abi_encode())
}

/// Capabilities every wire version of a user operation shares.
pub trait UserOperationPayload {
    /// Smart account that executes the operation.
    fn sender(&self) -> Address;

    /// Full 256-bit nonce (key and sequence).
    fn nonce(&self) -> U256;

    fn max_fee_per_gas(&self) -> U256;

    fn max_priority_fee_per_gas(&self) -> U256;

    /// Gas fields the bundle gas estimate is computed from.
    fn gas_limits(&self) -> GasLimits;

    /// Canonical user operation hash for the given entry point and chain.
    fn hash(&self, entry_point: Address, chain_id: u64) -> B256;

    /// Nonce split into its 192-bit key and 64-bit sequence.
    fn nonce_parts(&self) -> NonceParts {
        unpack_nonce(self.nonce())
    }

    /// Gas this operation contributes to a bundle under the chain's profile.
    fn total_gas(&self, profile: &GasProfile) -> u64 {
        profile.total_gas(&self.gas_limits())
    }
}

impl UserOperationPayload for UserOperationV06 {
    fn sender(&self) -> Address {
        self.sender
    }

    fn nonce(&self) -> U256 {
        self.nonce
    }

    fn max_fee_per_gas(&self) -> U256 {
        self.max_fee_per_gas
    }

    fn max_priority_fee_per_gas(&self) -> U256 {
        self.max_priority_fee_per_gas
    }

    fn gas_limits(&self) -> GasLimits {
        GasLimits {
            version: EntryPointVersion::V06,
            call_gas_limit: self.call_gas_limit,
            verification_gas_limit: self.verification_gas_limit,
            pre_verification_gas: self.pre_verification_gas,
            paymaster_verification_gas_limit: U256::ZERO,
            paymaster_post_op_gas_limit: U256::ZERO,
            has_paymaster: !self.paymaster_and_data.is_empty(),
        }
    }

    fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let packed = UserOperationV06Hashed {
            sender: self.sender,
            nonce: self.nonce,
            initCodeHash: keccak256(&self.init_code),
            callDataHash: keccak256(&self.call_data),
            callGasLimit: self.call_gas_limit,
            verificationGasLimit: self.verification_gas_limit,
            preVerificationGas: self.pre_verification_gas,
            maxFeePerGas: self.max_fee_per_gas,
            maxPriorityFeePerGas: self.max_priority_fee_per_gas,
            paymasterAndDataHash: keccak256(&self.paymaster_and_data),
        };
        user_op_hash(keccak256(packed.abi_encode()), entry_point, chain_id)
    }
}

impl UserOperationPayload for UserOperationV07 {
    fn sender(&self) -> Address {
        self.sender
    }

    fn nonce(&self) -> U256 {
        self.nonce
    }

    fn max_fee_per_gas(&self) -> U256 {
        self.max_fee_per_gas
    }

    fn max_priority_fee_per_gas(&self) -> U256 {
        self.max_priority_fee_per_gas
    }

    fn gas_limits(&self) -> GasLimits {
        GasLimits {
            version: EntryPointVersion::V07,
            call_gas_limit: self.call_gas_limit,
            verification_gas_limit: self.verification_gas_limit,
            pre_verification_gas: self.pre_verification_gas,
            paymaster_verification_gas_limit: self.paymaster_verification_gas_limit,
            paymaster_post_op_gas_limit: self.paymaster_post_op_gas_limit,
            has_paymaster: self.paymaster.is_some(),
        }
    }

    fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let packed = UserOperationV07Hashed {
            sender: self.sender,
            nonce: self.nonce,
            initCodeHash: keccak256(self.init_code()),
            callDataHash: keccak256(&self.call_data),
            accountGasLimits: self.account_gas_limits(),
            preVerificationGas: self.pre_verification_gas,
            gasFees: self.gas_fees(),
            paymasterAndDataHash: keccak256(self.paymaster_and_data()),
        };
        user_op_hash(keccak256(packed.abi_encode()), entry_point, chain_id)
    }
}

/// User Operation that can be either v0.6 or v0.7+, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VersionedUserOperation {
    EntryPointV06(UserOperationV06),
    EntryPointV07(UserOperationV07),
}

impl VersionedUserOperation {
    pub const fn version(&self) -> EntryPointVersion {
        match self {
            Self::EntryPointV06(_) => EntryPointVersion::V06,
            Self::EntryPointV07(_) => EntryPointVersion::V07,
        }
    }

    fn payload(&self) -> &dyn UserOperationPayload {
        match self {
            Self::EntryPointV06(op) => op,
            Self::EntryPointV07(op) => op,
        }
    }
}

impl UserOperationPayload for VersionedUserOperation {
    fn sender(&self) -> Address {
        self.payload().sender()
    }

    fn nonce(&self) -> U256 {
        self.payload().nonce()
    }

    fn max_fee_per_gas(&self) -> U256 {
        self.payload().max_fee_per_gas()
    }

    fn max_priority_fee_per_gas(&self) -> U256 {
        self.payload().max_priority_fee_per_gas()
    }

    fn gas_limits(&self) -> GasLimits {
        self.payload().gas_limits()
    }

    fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        self.payload().hash(entry_point, chain_id)
    }
}

/// A submission: one operation plus the siblings that must land with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationRequest {
    pub user_operation: VersionedUserOperation,
    pub entry_point: Address,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associated_user_operations: Vec<VersionedUserOperation>,
}

impl UserOperationRequest {
    pub const fn new(user_operation: VersionedUserOperation, entry_point: Address) -> Self {
        Self {
            user_operation,
            entry_point,
            associated_user_operations: Vec::new(),
        }
    }

    pub fn hash(&self, chain_id: u64) -> B256 {
        self.user_operation.hash(self.entry_point, chain_id)
    }
}
