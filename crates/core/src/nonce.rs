//! Two-dimensional account nonces.
//!
//! The upper 192 bits of an EIP-4337 nonce are a key selecting an independent
//! sequence, the lower 64 bits are the position in that sequence.
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

const SEQUENCE_BITS: usize = 64;

/// A nonce split into key and sequence value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NonceParts {
    /// 192-bit sequence key.
    pub key: U256,
    /// 64-bit position within the keyed sequence.
    pub value: U256,
}

impl NonceParts {
    /// Key as `0x`-prefixed minimal hex, e.g. `0x0`.
    pub fn key_hex(&self) -> String {
        format!("0x{:x}", self.key)
    }

    /// Value as `0x`-prefixed minimal hex, e.g. `0x3`.
    pub fn value_hex(&self) -> String {
        format!("0x{:x}", self.value)
    }

    /// Recombines the parts into the on-chain nonce.
    pub fn packed(&self) -> U256 {
        pack_nonce(self.key, self.value)
    }
}

fn sequence_mask() -> U256 {
    (U256::from(1u64) << SEQUENCE_BITS) - U256::from(1u64)
}

/// Combines a key and sequence value into a single nonce.
pub fn pack_nonce(key: U256, value: U256) -> U256 {
    (key << SEQUENCE_BITS) | (value & sequence_mask())
}

/// Splits a nonce into key and sequence value.
pub fn unpack_nonce(nonce: U256) -> NonceParts {
    NonceParts {
        key: nonce >> SEQUENCE_BITS,
        value: nonce & sequence_mask(),
    }
}
