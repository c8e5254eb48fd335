//! Fee selection for new bundles and their replacements.
use bundler_chain::FeeData;
use bundler_core::{ChainConfig, GasFees};

/// Fees for a fresh bundle from the current network snapshot.
///
/// The chain's `fee_ratio_percent` scales both the base price and the tip.
pub fn initial_fees(chain: &ChainConfig, fee_data: &FeeData) -> GasFees {
    let gas_price = chain.gas.apply_fee_ratio(fee_data.gas_price);
    match (chain.eip1559, fee_data.max_priority_fee_per_gas) {
        (true, Some(priority)) => {
            let max_priority_fee_per_gas = chain.gas.apply_fee_ratio(priority);
            GasFees::Eip1559 {
                max_fee_per_gas: gas_price.saturating_add(max_priority_fee_per_gas),
                max_priority_fee_per_gas,
            }
        }
        _ => GasFees::Legacy { gas_price },
    }
}

/// `value * percent / 100`, rounded up, and strictly above `value` when `percent > 100`.
pub fn increase_by_percent(value: u128, percent: u64) -> u128 {
    let scaled = value.saturating_mul(u128::from(percent)).div_ceil(100);
    if percent > 100 { scaled.max(value.saturating_add(1)) } else { scaled }
}

/// Fees of a replacement: the previous fees bumped by `percent`, never below `network`.
pub fn escalate_fees(current: &GasFees, network: &GasFees, percent: u64) -> GasFees {
    match (current, network) {
        (
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
            GasFees::Eip1559 {
                max_fee_per_gas: network_max_fee,
                max_priority_fee_per_gas: network_priority_fee,
            },
        ) => {
            let max_priority_fee_per_gas =
                increase_by_percent(*max_priority_fee_per_gas, percent).max(*network_priority_fee);
            let max_fee_per_gas = increase_by_percent(*max_fee_per_gas, percent)
                .max(*network_max_fee)
                .max(max_priority_fee_per_gas);
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }
        }
        (GasFees::Legacy { gas_price }, GasFees::Legacy { gas_price: network_price }) => {
            GasFees::Legacy {
                gas_price: increase_by_percent(*gas_price, percent).max(*network_price),
            }
        }
        // the chain switched fee shapes; keep at least the previous ceiling
        (current, GasFees::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas }) => {
            GasFees::Eip1559 {
                max_fee_per_gas: (*max_fee_per_gas)
                    .max(increase_by_percent(current.max_fee_per_gas(), percent)),
                max_priority_fee_per_gas: *max_priority_fee_per_gas,
            }
        }
        (current, GasFees::Legacy { gas_price }) => GasFees::Legacy {
            gas_price: (*gas_price).max(increase_by_percent(current.max_fee_per_gas(), percent)),
        },
    }
}
