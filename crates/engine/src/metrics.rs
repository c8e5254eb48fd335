use std::net::SocketAddr;

use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Metrics for one chain's bundling engine, labelled with `chain_id`.
/// Conventions:
/// - Durations are recorded in seconds (histograms).
/// - Counters are monotonic event counts.
/// - Gauges reflect the current value/state.
#[derive(Metrics, Clone)]
#[metrics(scope = "bundler")]
pub struct Metrics {
    #[metric(describe = "Duration of one bundling pass")]
    pub bundle_duration: Histogram,

    #[metric(describe = "Duration of one pending monitor pass")]
    pub monitor_duration: Histogram,

    #[metric(describe = "Bundle transactions committed and handed to the node")]
    pub bundles_submitted: Counter,

    #[metric(describe = "User operations packed into submitted bundles")]
    pub user_ops_bundled: Counter,

    #[metric(describe = "User operations discarded for exceeding the bundle gas cap")]
    pub user_ops_discarded: Counter,

    #[metric(describe = "Broadcasts rejected by the node")]
    pub broadcast_failures: Counter,

    #[metric(describe = "Fee-escalated replacements")]
    pub replacements: Counter,

    #[metric(describe = "Blind rebroadcasts of long-pending transactions")]
    pub rebroadcasts: Counter,

    #[metric(describe = "Transactions finalized with a receipt")]
    pub transactions_finalized: Counter,

    #[metric(describe = "Transactions force-finalized without a receipt")]
    pub transactions_dropped: Counter,

    #[metric(describe = "Transactions whose operations landed through a competing transaction")]
    pub mev_preempted: Counter,

    #[metric(describe = "Signers currently blocked")]
    pub blocked_signers: Gauge,
}

impl Metrics {
    pub fn for_chain(chain_id: u64) -> Self {
        Self::new_with_labels(&[("chain_id", chain_id.to_string())])
    }
}

pub fn init_prometheus_exporter(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
}
