//! Per-chain and process-wide bundler settings.
use std::collections::BTreeMap;
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::entry_point::canonical_version;
use crate::gas::GasProfile;
use crate::user_operation::EntryPointVersion;

fn default_max_bundle_gas() -> u64 {
    10_000_000
}

fn default_max_user_op_pack_count() -> usize {
    10
}

fn default_pending_limit() -> u64 {
    5
}

fn default_retry_max_count() -> u32 {
    10
}

fn default_mev_lookback_blocks() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_required_confirmations() -> u64 {
    1
}

fn default_fee_increase_percent() -> u64 {
    110
}

/// Configuration of one chain the bundler serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    pub entry_points: Vec<Address>,
    /// Versions of non-canonical entry point deployments.
    #[serde(default)]
    pub entry_point_versions: BTreeMap<Address, EntryPointVersion>,
    #[serde(default = "default_max_bundle_gas")]
    pub max_bundle_gas: u64,
    #[serde(default = "default_max_user_op_pack_count")]
    pub max_user_op_pack_count: usize,
    #[serde(default = "default_pending_limit")]
    pub pending_transaction_signer_handle_limit: u64,
    #[serde(default = "default_true")]
    pub can_incr_gas_price_retry: bool,
    #[serde(default = "default_retry_max_count")]
    pub can_incr_gas_price_retry_max_count: u32,
    #[serde(default)]
    pub mev_check: bool,
    #[serde(default = "default_mev_lookback_blocks")]
    pub mev_check_lookback_blocks: u64,
    #[serde(default = "default_true")]
    pub eip1559: bool,
    #[serde(default)]
    pub requires_gas_estimate: bool,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
    /// Escalation coefficient for replacements, in percent of the previous fee.
    #[serde(default = "default_fee_increase_percent")]
    pub fee_increase_percent: u64,
    /// Admission floor for an operation's `maxFeePerGas`.
    #[serde(default)]
    pub min_max_fee_per_gas: u128,
    /// Blocked signers are released once their balance reaches this value (wei).
    #[serde(default)]
    pub min_signer_balance: u128,
    /// Receives the entry point's gas refunds; defaults to the submitting signer.
    #[serde(default)]
    pub beneficiary: Option<Address>,
    pub signer_keys: Vec<String>,
    #[serde(default)]
    pub gas: GasProfile,
}

impl ChainConfig {
    pub fn supports_entry_point(&self, entry_point: &Address) -> bool {
        self.entry_points.contains(entry_point)
    }

    /// Version of a served entry point: an explicit binding, else the canonical
    /// deployment's. `None` when the entry point is not served or its version is unknown.
    pub fn entry_point_version(&self, entry_point: &Address) -> Option<EntryPointVersion> {
        if !self.supports_entry_point(entry_point) {
            return None;
        }
        self.entry_point_versions
            .get(entry_point)
            .copied()
            .or_else(|| canonical_version(entry_point))
    }
}

/// Timing and sizing knobs shared by all chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlerSettings {
    pub tick_interval: Duration,
    /// A pending transaction older than this is fee-escalated.
    pub pending_timeout: Duration,
    /// A pending transaction older than this is blindly rebroadcast.
    pub old_pending_threshold: Duration,
    /// Minimum idle time before a Local record can be replaced by a new admission.
    pub replacement_cooldown: Duration,
    pub lock_ttl: Duration,
    pub max_pool_size: usize,
    pub max_op_age: Duration,
    pub pick_batch_size: usize,
    pub monitor_batch_size: usize,
    pub long_pending_batch_size: usize,
    /// Window in which pending transactions count as recent for monitor selection.
    pub recent_window: Duration,
    pub rpc_timeout: Duration,
    /// Allocate every signer on each tick instead of a rotating fraction.
    pub development: bool,
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(30),
            old_pending_threshold: Duration::from_secs(300),
            replacement_cooldown: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(60),
            max_pool_size: 10_000,
            max_op_age: Duration::from_secs(3_600),
            pick_batch_size: 500,
            monitor_batch_size: 100,
            long_pending_batch_size: 20,
            recent_window: Duration::from_secs(600),
            rpc_timeout: Duration::from_secs(10),
            development: false,
        }
    }
}
