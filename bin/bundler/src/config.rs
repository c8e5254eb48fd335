use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bundler_core::logger::LogFormat;
use bundler_core::{BundlerSettings, ChainConfig};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// JSON file holding the array of chain configurations
    #[arg(long, env = "BUNDLER_CHAINS_FILE")]
    pub chains_file: String,

    #[arg(long, env = "BUNDLER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// `text` or `json`
    #[arg(long, env = "BUNDLER_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[arg(long, env = "BUNDLER_METRICS_ADDR", default_value = "0.0.0.0:9002")]
    pub metrics_addr: SocketAddr,

    /// Kafka properties file for publishing bundler events
    #[arg(long, env = "BUNDLER_KAFKA_EVENTS_PROPERTIES_FILE")]
    pub events_kafka_properties: Option<String>,

    #[arg(long, env = "BUNDLER_KAFKA_EVENTS_TOPIC", default_value = "bundler-events")]
    pub events_topic: String,

    /// Kafka properties file for consuming user operation submissions
    #[arg(long, env = "BUNDLER_KAFKA_USER_OPS_PROPERTIES_FILE")]
    pub user_ops_kafka_properties: Option<String>,

    #[arg(long, env = "BUNDLER_KAFKA_USER_OPS_TOPIC", default_value = "bundler-user-operations")]
    pub user_ops_topic: String,

    /// Kafka properties file for consuming sibling processes' events as hints
    #[arg(long, env = "BUNDLER_KAFKA_HINTS_PROPERTIES_FILE")]
    pub hints_kafka_properties: Option<String>,

    /// Allocate every signer on each tick
    #[arg(long, env = "BUNDLER_DEVELOPMENT", default_value_t = false)]
    pub development: bool,

    #[arg(long, env = "BUNDLER_TICK_INTERVAL_MS", default_value_t = 1_000)]
    pub tick_interval_ms: u64,

    #[arg(long, env = "BUNDLER_PENDING_TIMEOUT_SECS", default_value_t = 30)]
    pub pending_timeout_secs: u64,

    #[arg(long, env = "BUNDLER_OLD_PENDING_THRESHOLD_SECS", default_value_t = 300)]
    pub old_pending_threshold_secs: u64,

    #[arg(long, env = "BUNDLER_REPLACEMENT_COOLDOWN_SECS", default_value_t = 10)]
    pub replacement_cooldown_secs: u64,

    #[arg(long, env = "BUNDLER_LOCK_TTL_SECS", default_value_t = 60)]
    pub lock_ttl_secs: u64,

    #[arg(long, env = "BUNDLER_MAX_POOL_SIZE", default_value_t = 10_000)]
    pub max_pool_size: usize,

    #[arg(long, env = "BUNDLER_MAX_OP_AGE_SECS", default_value_t = 3_600)]
    pub max_op_age_secs: u64,

    #[arg(long, env = "BUNDLER_RPC_TIMEOUT_MS", default_value_t = 10_000)]
    pub rpc_timeout_ms: u64,
}

impl Config {
    pub fn settings(&self) -> BundlerSettings {
        BundlerSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            pending_timeout: Duration::from_secs(self.pending_timeout_secs),
            old_pending_threshold: Duration::from_secs(self.old_pending_threshold_secs),
            replacement_cooldown: Duration::from_secs(self.replacement_cooldown_secs),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            max_pool_size: self.max_pool_size,
            max_op_age: Duration::from_secs(self.max_op_age_secs),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            development: self.development,
            ..BundlerSettings::default()
        }
    }
}

pub fn load_chains(path: &str) -> Result<Vec<ChainConfig>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    parse_chains(&raw).with_context(|| format!("invalid chains file {path}"))
}

fn parse_chains(raw: &str) -> Result<Vec<ChainConfig>> {
    let chains: Vec<ChainConfig> = serde_json::from_str(raw)?;
    if chains.is_empty() {
        bail!("no chains configured");
    }

    let mut seen = HashSet::new();
    for chain in &chains {
        if !seen.insert(chain.chain_id) {
            bail!("chain {} is configured twice", chain.chain_id);
        }
        if chain.entry_points.is_empty() {
            bail!("chain {} has no entry points", chain.chain_id);
        }
        if chain.signer_keys.is_empty() {
            bail!("chain {} has no signer keys", chain.chain_id);
        }
    }
    Ok(chains)
}
