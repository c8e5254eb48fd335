//! Bundler process: one tick loop per configured chain over a shared pool.
mod config;

use std::collections::HashMap;
use std::sync::Arc;

use bundler_audit::{
    EventPublisher, HintSource, KafkaEventPublisher, KafkaHintSource, LoggingEventPublisher,
    Notifier, connect_events_to_publisher, load_kafka_config_from_file,
};
use bundler_chain::AlloyChainClient;
use bundler_core::logger::init_logger;
use bundler_datastore::InMemoryRepository;
use bundler_engine::{BundlerService, ChainBundler, init_prometheus_exporter};
use bundler_user_op_pool::{
    KafkaUserOpSource, OperationPool, PoolSettings, connect_sources_to_pool,
};
use clap::Parser;
use config::{Config, load_chains};
use rdkafka::ClientConfig;
use rdkafka::producer::FutureProducer;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::parse();
    init_logger(&config.log_level, config.log_format);

    init_prometheus_exporter(config.metrics_addr)
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus exporter: {e}"))?;

    let settings = config.settings();
    let chains = load_chains(&config.chains_file)?;
    info!(
        message = "Starting bundler",
        chains = ?chains.iter().map(|c| c.chain_id).collect::<Vec<_>>(),
        metrics_address = %config.metrics_addr,
        development = settings.development,
    );

    let publisher: Arc<dyn EventPublisher> = match &config.events_kafka_properties {
        Some(props_file) => {
            let client_config = ClientConfig::from_iter(load_kafka_config_from_file(props_file)?);
            let producer: FutureProducer = client_config.create()?;
            info!(topic = %config.events_topic, "Publishing bundler events to Kafka");
            Arc::new(KafkaEventPublisher::new(producer, config.events_topic.clone()))
        }
        None => Arc::new(LoggingEventPublisher),
    };
    let (notifier, event_rx) = Notifier::channel();
    connect_events_to_publisher(event_rx, publisher);

    let repository = Arc::new(InMemoryRepository::new());
    let pool = Arc::new(OperationPool::new(
        repository,
        notifier.clone(),
        PoolSettings::from(&settings),
    ));

    let mut bundlers = Vec::with_capacity(chains.len());
    for chain in chains.iter().cloned() {
        let client = Arc::new(AlloyChainClient::new(
            chain.chain_id,
            &chain.rpc_url,
            chain.eip1559,
            settings.rpc_timeout,
        )?);
        bundlers.push(
            ChainBundler::new(chain, settings.clone(), client, Arc::clone(&pool), notifier.clone())
                .await?,
        );
    }
    let service = Arc::new(BundlerService::new(Arc::clone(&pool), bundlers));

    if let Some(props_file) = &config.user_ops_kafka_properties {
        let client_config = ClientConfig::from_iter(load_kafka_config_from_file(props_file)?);
        let (submission_tx, submission_rx) = mpsc::unbounded_channel();
        let source = KafkaUserOpSource::new(client_config, config.user_ops_topic.clone(), submission_tx)?;
        let chains: HashMap<u64, _> = chains.iter().map(|c| (c.chain_id, c.clone())).collect();
        connect_sources_to_pool(vec![source], submission_rx, Arc::clone(&pool), Arc::new(chains));
        info!(topic = %config.user_ops_topic, "Consuming user operations from Kafka");
    }

    if let Some(props_file) = &config.hints_kafka_properties {
        let client_config = ClientConfig::from_iter(load_kafka_config_from_file(props_file)?);
        let (hint_tx, hint_rx) = mpsc::unbounded_channel();
        let source = KafkaHintSource::new(client_config, config.events_topic.clone(), hint_tx)?;
        tokio::spawn(async move {
            if let Err(e) = source.run().await {
                error!(error = %e, "Hint source failed");
            }
        });
        service.connect_hints(hint_rx);
        info!(topic = %config.events_topic, "Consuming sibling hints from Kafka");
    }

    let handles = service.spawn();
    info!(tasks = handles.len(), "Bundler running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
