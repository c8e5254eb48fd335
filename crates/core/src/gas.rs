//! Gas accounting for bundle packing and transaction limits.
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::user_operation::EntryPointVersion;

/// Raw gas fields of a user operation, version-normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasLimits {
    pub version: EntryPointVersion,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    /// Zero for v0.6, where the paymaster shares the verification limit.
    pub paymaster_verification_gas_limit: U256,
    /// Zero for v0.6.
    pub paymaster_post_op_gas_limit: U256,
    /// Whether `paymasterAndData` (v0.6) or `paymaster` (v0.7) is set.
    pub has_paymaster: bool,
}

/// Per-chain gas and fee tuning.
///
/// The extra-gas and ratio values are empirically tuned per network and are
/// carried as configuration as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GasProfile {
    /// Applied to the verification part of every operation.
    pub verification_gas_multiplier_percent: u64,
    /// v0.6 runs verification up to three times when a paymaster is present.
    pub paymaster_verification_factor: u64,
    /// Flat amount added per operation.
    pub extra_gas_per_op: u64,
    /// Safety margin applied to a bundle's gas when building the transaction.
    pub gas_limit_multiplier_percent: u64,
    /// Applied to network fee data when pricing a new bundle.
    pub fee_ratio_percent: u64,
}

impl Default for GasProfile {
    fn default() -> Self {
        Self {
            verification_gas_multiplier_percent: 100,
            paymaster_verification_factor: 3,
            extra_gas_per_op: 0,
            gas_limit_multiplier_percent: 120,
            fee_ratio_percent: 100,
        }
    }
}

fn saturating_u64(value: U256) -> u64 {
    value.saturating_to::<u64>()
}

impl GasProfile {
    /// Gas one operation contributes to a bundle.
    pub fn total_gas(&self, limits: &GasLimits) -> u64 {
        let verification = match limits.version {
            EntryPointVersion::V06 => {
                let factor = if limits.has_paymaster {
                    self.paymaster_verification_factor.max(1)
                } else {
                    1
                };
                saturating_u64(limits.verification_gas_limit).saturating_mul(factor)
            }
            EntryPointVersion::V07 => saturating_u64(limits.verification_gas_limit)
                .saturating_add(saturating_u64(limits.paymaster_verification_gas_limit))
                .saturating_add(saturating_u64(limits.paymaster_post_op_gas_limit)),
        };
        let verification = verification.saturating_mul(self.verification_gas_multiplier_percent) / 100;

        saturating_u64(limits.pre_verification_gas)
            .saturating_add(verification)
            .saturating_add(saturating_u64(limits.call_gas_limit))
            .saturating_add(self.extra_gas_per_op)
    }

    /// Transaction gas limit for a bundle of `bundle_gas`.
    pub fn bundle_gas_limit(&self, bundle_gas: u64) -> u64 {
        bundle_gas.saturating_mul(self.gas_limit_multiplier_percent) / 100
    }

    /// Scales a network fee by `fee_ratio_percent`.
    pub fn apply_fee_ratio(&self, fee: u128) -> u128 {
        fee.saturating_mul(u128::from(self.fee_ratio_percent)) / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(version: EntryPointVersion, has_paymaster: bool) -> GasLimits {
        GasLimits {
            version,
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(50_000),
            pre_verification_gas: U256::from(21_000),
            paymaster_verification_gas_limit: U256::from(30_000),
            paymaster_post_op_gas_limit: U256::from(10_000),
            has_paymaster,
        }
    }

    #[test]
    fn v06_without_paymaster_sums_fields() {
        let profile = GasProfile::default();
        assert_eq!(profile.total_gas(&limits(EntryPointVersion::V06, false)), 171_000);
    }

    #[test]
    fn v06_with_paymaster_triples_verification() {
        let profile = GasProfile::default();
        assert_eq!(profile.total_gas(&limits(EntryPointVersion::V06, true)), 271_000);
    }

    #[test]
    fn v07_adds_paymaster_limits() {
        let profile = GasProfile::default();
        assert_eq!(profile.total_gas(&limits(EntryPointVersion::V07, true)), 211_000);
    }

    #[test]
    fn multiplier_and_extra_gas_apply() {
        let profile = GasProfile {
            verification_gas_multiplier_percent: 200,
            extra_gas_per_op: 5_000,
            ..Default::default()
        };
        assert_eq!(profile.total_gas(&limits(EntryPointVersion::V06, false)), 226_000);
    }

    #[test]
    fn huge_fields_saturate() {
        let mut huge = limits(EntryPointVersion::V06, false);
        huge.call_gas_limit = U256::MAX;
        assert_eq!(GasProfile::default().total_gas(&huge), u64::MAX);
    }

    #[test]
    fn bundle_limit_and_fee_ratio() {
        let profile = GasProfile { fee_ratio_percent: 150, ..Default::default() };
        assert_eq!(profile.bundle_gas_limit(1_000_000), 1_200_000);
        assert_eq!(profile.apply_fee_ratio(100), 150);
    }
}
