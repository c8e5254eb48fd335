//! Groups pooled operations into gas-bounded bundles and spreads them over signers.
use std::collections::BTreeMap;

use alloy_primitives::{Address, B256};
use bundler_audit::DropReason;
use bundler_core::{
    EntryPointVersion, GasProfile, UserOperationPayload, UserOperationRecord,
    VersionedUserOperation,
};

/// A signer and how many more bundles it may carry this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignerBudget {
    pub signer: Address,
    pub budget: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub entry_point: Address,
    /// Version shared by every payload in the bundle.
    pub version: EntryPointVersion,
    /// Pooled records in (sender, nonce key, nonce value) order.
    pub records: Vec<UserOperationRecord>,
    /// Sum of the records' total gas.
    pub gas: u64,
}

impl Bundle {
    fn new(entry_point: Address, version: EntryPointVersion) -> Self {
        Self {
            entry_point,
            version,
            records: Vec::new(),
            gas: 0,
        }
    }

    /// Splits the records into two halves, keeping their order.
    ///
    /// Returns the bundle unchanged when it holds a single record.
    pub fn bisect(mut self, profile: &GasProfile) -> Result<(Self, Self), Self> {
        if self.records.len() < 2 {
            return Err(self);
        }
        let gas_of = |records: &[UserOperationRecord]| {
            records
                .iter()
                .map(|r| r.total_gas(profile))
                .fold(0, u64::saturating_add)
        };
        let tail = self.records.split_off(self.records.len() / 2);
        let mut second = Self::new(self.entry_point, self.version);
        second.gas = gas_of(&tail);
        second.records = tail;
        self.gas = gas_of(&self.records);
        Ok((self, second))
    }

    /// Number of user operations, siblings included.
    pub fn op_count(&self) -> usize {
        self.records.iter().map(record_op_count).sum()
    }

    /// Every operation with its hash, siblings flattened in nonce order.
    pub fn flattened(&self) -> Vec<(B256, VersionedUserOperation)> {
        let mut ops: Vec<_> = self.records.iter().flat_map(UserOperationRecord::flattened).collect();
        ops.sort_by_key(|(_, op)| (op.sender(), op.nonce_parts()));
        ops
    }
}

#[derive(Debug, Default)]
pub struct PackResult {
    /// Bundles per signer, signers in budget order.
    pub assignments: Vec<(Address, Vec<Bundle>)>,
    /// Operations that cannot fit in any bundle.
    pub discarded: Vec<(UserOperationRecord, DropReason)>,
    /// Operations left over once every budget was spent.
    pub unused: Vec<UserOperationRecord>,
}

fn record_op_count(record: &UserOperationRecord) -> usize {
    1 + record.associated_user_ops.len()
}

/// Packs `records` into bundles of at most `max_bundle_gas` gas and
/// `max_pack_count` operations, then deals them round-robin to `signers`.
pub fn pack_bundles(
    mut records: Vec<UserOperationRecord>,
    signers: &[SignerBudget],
    max_bundle_gas: u64,
    max_pack_count: usize,
    profile: &GasProfile,
) -> PackResult {
    records.sort_by(|a, b| {
        (a.sender, a.nonce_key, a.nonce_value).cmp(&(b.sender, b.nonce_key, b.nonce_value))
    });

    let mut by_target: BTreeMap<(Address, EntryPointVersion), Vec<UserOperationRecord>> =
        BTreeMap::new();
    for record in records {
        by_target
            .entry((record.entry_point, record.origin.version()))
            .or_default()
            .push(record);
    }

    let mut result = PackResult::default();
    let mut bundles = Vec::new();
    for ((entry_point, version), group) in by_target {
        let mut current = Bundle::new(entry_point, version);
        for record in group {
            let gas = record.total_gas(profile);
            if gas > max_bundle_gas {
                result.discarded.push((record, DropReason::ExceedsBundleGas));
                continue;
            }
            let count = record_op_count(&record);
            if count > max_pack_count {
                result.discarded.push((record, DropReason::ExceedsPackCount));
                continue;
            }

            let over_gas = current.gas.saturating_add(gas) > max_bundle_gas;
            let over_count = current.op_count() + count > max_pack_count;
            if !current.records.is_empty() && (over_gas || over_count) {
                bundles.push(std::mem::replace(&mut current, Bundle::new(entry_point, version)));
            }
            current.gas = current.gas.saturating_add(gas);
            current.records.push(record);
        }
        if !current.records.is_empty() {
            bundles.push(current);
        }
    }

    let mut order: Vec<SignerBudget> = signers.iter().copied().filter(|s| s.budget > 0).collect();
    order.sort_by(|a, b| b.budget.cmp(&a.budget));
    let mut assigned: Vec<(Address, Vec<Bundle>)> =
        order.iter().map(|s| (s.signer, Vec::new())).collect();

    let mut next = 0;
    let mut bundles = bundles.into_iter();
    'deal: for bundle in bundles.by_ref() {
        for _ in 0..order.len() {
            let slot = next % order.len();
            next += 1;
            if order[slot].budget > 0 {
                order[slot].budget -= 1;
                assigned[slot].1.push(bundle);
                continue 'deal;
            }
        }
        result.unused.extend(bundle.records);
        break;
    }
    for bundle in bundles {
        result.unused.extend(bundle.records);
    }

    result.assignments = assigned
        .into_iter()
        .filter(|(_, bundles)| !bundles.is_empty())
        .collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use bundler_core::test_utils::{
        TEST_CHAIN_ID, TEST_ENTRY_POINT, TEST_ENTRY_POINT_V07, local_record, sender,
        user_op_v07, user_op_with_total_gas,
    };

    fn budget(n: u8, budget: u64) -> SignerBudget {
        SignerBudget { signer: sender(0xa0 + n), budget }
    }

    fn op(sender_byte: u8, nonce: u64, gas: u64) -> UserOperationRecord {
        local_record(user_op_with_total_gas(sender(sender_byte), U256::from(nonce), gas))
    }

    fn sizes(result: &PackResult) -> Vec<usize> {
        result
            .assignments
            .iter()
            .flat_map(|(_, bundles)| bundles.iter().map(|b| b.records.len()))
            .collect()
    }

    #[test]
    fn five_three_million_gas_ops_pack_two_two_one() {
        let records = (0..5).map(|nonce| op(1, nonce, 3_000_000)).collect();
        let result = pack_bundles(
            records,
            &[budget(1, 10)],
            7_000_000,
            10,
            &GasProfile::default(),
        );
        assert_eq!(sizes(&result), vec![2, 2, 1]);
        assert!(result.discarded.is_empty());
        assert!(result.unused.is_empty());
    }

    #[test]
    fn over_cap_operations_are_discarded_never_bundled() {
        let records = vec![op(1, 0, 1_000_000), op(2, 0, 8_000_000), op(3, 0, 1_000_000)];
        let result = pack_bundles(records, &[budget(1, 5)], 7_000_000, 10, &GasProfile::default());

        assert_eq!(result.discarded.len(), 1);
        assert_eq!(result.discarded[0].0.sender, sender(2));
        assert_eq!(result.discarded[0].1, DropReason::ExceedsBundleGas);
        for (_, bundles) in &result.assignments {
            for bundle in bundles {
                assert!(bundle.gas <= 7_000_000);
                assert!(bundle.records.iter().all(|r| r.sender != sender(2)));
            }
        }
    }

    #[test]
    fn pack_count_starts_new_bundle() {
        let records = (0..5).map(|nonce| op(1, nonce, 100_000)).collect();
        let result = pack_bundles(records, &[budget(1, 5)], 7_000_000, 2, &GasProfile::default());
        assert_eq!(sizes(&result), vec![2, 2, 1]);
    }

    #[test]
    fn same_sender_nonces_stay_ordered_across_bundles() {
        let records = vec![
            op(1, 3, 3_000_000),
            op(2, 0, 3_000_000),
            op(1, 1, 3_000_000),
            op(1, 2, 3_000_000),
            op(1, 0, 3_000_000),
        ];
        let result = pack_bundles(records, &[budget(1, 10)], 7_000_000, 10, &GasProfile::default());

        let nonces: Vec<u64> = result.assignments[0]
            .1
            .iter()
            .flat_map(|b| b.records.iter())
            .filter(|r| r.sender == sender(1))
            .map(|r| r.nonce_value.to::<u64>())
            .collect();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
    }

    #[test]
    fn bundles_are_dealt_round_robin_by_budget() {
        let records = (0..5).map(|nonce| op(1, nonce, 3_000_000)).collect();
        let result = pack_bundles(
            records,
            &[budget(1, 1), budget(2, 3)],
            3_000_000,
            10,
            &GasProfile::default(),
        );

        // highest budget first, then alternating until budgets run out
        assert_eq!(result.assignments.len(), 2);
        assert_eq!(result.assignments[0].0, budget(2, 0).signer);
        assert_eq!(result.assignments[0].1.len(), 3);
        assert_eq!(result.assignments[1].1.len(), 1);
        assert_eq!(result.unused.len(), 1);
        assert_eq!(result.unused[0].nonce_value, U256::from(4));
    }

    #[test]
    fn budgets_are_never_exceeded() {
        let records = (0..20).map(|nonce| op(1, nonce, 1_000_000)).collect();
        let signers = [budget(1, 2), budget(2, 0), budget(3, 1)];
        let result = pack_bundles(records, &signers, 1_000_000, 1, &GasProfile::default());

        for (signer, bundles) in &result.assignments {
            let limit = signers.iter().find(|s| s.signer == *signer).unwrap().budget;
            assert!(bundles.len() as u64 <= limit);
        }
        assert_eq!(result.unused.len(), 17);
    }

    #[test]
    fn entry_points_never_share_a_bundle() {
        let v07 = UserOperationRecord::new_local(
            TEST_CHAIN_ID,
            TEST_ENTRY_POINT_V07,
            user_op_v07(sender(1), U256::from(9), 100_000),
            vec![],
        );
        let records = vec![op(1, 0, 500_000), v07];
        let result = pack_bundles(records, &[budget(1, 5)], 7_000_000, 10, &GasProfile::default());

        let bundles = &result.assignments[0].1;
        assert_eq!(bundles.len(), 2);
        assert!(bundles.iter().any(|b| b.entry_point == TEST_ENTRY_POINT));
        assert!(bundles.iter().any(|b| b.entry_point == TEST_ENTRY_POINT_V07));
    }

    #[test]
    fn no_signers_leaves_everything_unused() {
        let records = vec![op(1, 0, 100_000)];
        let result = pack_bundles(records, &[], 7_000_000, 10, &GasProfile::default());
        assert!(result.assignments.is_empty());
        assert_eq!(result.unused.len(), 1);
    }

    #[test]
    fn siblings_count_toward_the_bundle() {
        let record = UserOperationRecord::new_local(
            TEST_CHAIN_ID,
            TEST_ENTRY_POINT,
            user_op_with_total_gas(sender(1), U256::from(1), 1_000_000),
            vec![user_op_with_total_gas(sender(1), U256::ZERO, 1_000_000)],
        );
        assert_eq!(record.total_gas(&GasProfile::default()), 2_000_000);

        let result = pack_bundles(
            vec![record, op(2, 0, 1_000_000)],
            &[budget(1, 5)],
            7_000_000,
            2,
            &GasProfile::default(),
        );
        let bundles = &result.assignments[0].1;
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].op_count(), 2);

        let flattened = bundles[0].flattened();
        assert_eq!(flattened[0].1.nonce_parts().value, U256::ZERO);
    }

    #[test]
    fn sibling_group_larger_than_pack_count_is_discarded() {
        let record = UserOperationRecord::new_local(
            TEST_CHAIN_ID,
            TEST_ENTRY_POINT,
            user_op_with_total_gas(sender(1), U256::from(2), 100_000),
            vec![
                user_op_with_total_gas(sender(1), U256::ZERO, 100_000),
                user_op_with_total_gas(sender(1), U256::from(1), 100_000),
            ],
        );
        let result = pack_bundles(
            vec![record, op(2, 0, 100_000), op(3, 0, 100_000)],
            &[budget(1, 5)],
            7_000_000,
            2,
            &GasProfile::default(),
        );

        assert_eq!(result.discarded.len(), 1);
        assert_eq!(result.discarded[0].0.sender, sender(1));
        assert_eq!(result.discarded[0].1, DropReason::ExceedsPackCount);
        for (_, bundles) in &result.assignments {
            assert!(bundles.iter().all(|b| b.op_count() <= 2));
        }
        assert_eq!(sizes(&result), vec![2]);
    }

    #[test]
    fn versions_never_share_a_bundle_at_one_entry_point() {
        // a v0.7 payload recorded against a v0.6 entry point stays on its own
        let stray = UserOperationRecord::new_local(
            TEST_CHAIN_ID,
            TEST_ENTRY_POINT,
            user_op_v07(sender(2), U256::ZERO, 100_000),
            vec![],
        );
        let result = pack_bundles(
            vec![op(1, 0, 500_000), stray, op(3, 0, 500_000)],
            &[budget(1, 5)],
            7_000_000,
            10,
            &GasProfile::default(),
        );

        let bundles = &result.assignments[0].1;
        assert_eq!(bundles.len(), 2);
        for bundle in bundles {
            assert!(bundle.records.iter().all(|r| r.origin.version() == bundle.version));
        }
    }

    #[test]
    fn bisect_keeps_order_and_gas() {
        let records = (0..5).map(|nonce| op(1, nonce, 1_000_000)).collect();
        let result = pack_bundles(records, &[budget(1, 1)], 7_000_000, 10, &GasProfile::default());
        let bundle = result.assignments[0].1[0].clone();

        let (first, second) = bundle.bisect(&GasProfile::default()).unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(second.records.len(), 3);
        assert_eq!(first.gas, 2_000_000);
        assert_eq!(second.gas, 3_000_000);
        assert_eq!(second.records[0].nonce_value, U256::from(2));

        let (single, _) = first.bisect(&GasProfile::default()).unwrap();
        assert!(single.bisect(&GasProfile::default()).is_err());
    }
}
