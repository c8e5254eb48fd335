use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::BundlerEvent;

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination of bundler lifecycle events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: BundlerEvent) -> Result<()>;

    /// Publishes every event, stopping at the first failure.
    async fn publish_all(&self, events: Vec<BundlerEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Publishes JSON-encoded events keyed by chain id, so a partition sees one chain in order.
#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl std::fmt::Debug for KafkaEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaEventPublisher")
            .field("topic", &self.topic)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaEventPublisher {
    pub const fn new(producer: FutureProducer, topic: String) -> Self {
        Self {
            producer,
            topic,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    pub const fn with_delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, event: BundlerEvent) -> Result<()> {
        let key = event.key();
        let payload = serde_json::to_vec(&event)?;
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| anyhow!("delivery to {} failed: {err}", self.topic))?;
        debug!(
            key = %key,
            topic = %self.topic,
            bytes = payload.len(),
            "Event delivered"
        );
        Ok(())
    }
}

/// Writes events to the log; alerts surface at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: BundlerEvent) -> Result<()> {
        match &event {
            BundlerEvent::Alert { chain_id, message } => {
                warn!(chain_id = ?chain_id, message = %message, "Bundler alert");
            }
            other => {
                info!(event = ?other, "Bundler event");
            }
        }
        Ok(())
    }
}

/// Keeps every event in memory; used by tests to observe what was emitted.
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventPublisher {
    recorded: Arc<Mutex<Vec<BundlerEvent>>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<BundlerEvent> {
        self.recorded.lock().await.to_vec()
    }

    pub async fn events_for_chain(&self, chain_id: u64) -> Vec<BundlerEvent> {
        let recorded = self.recorded.lock().await;
        recorded
            .iter()
            .filter(|event| event.chain_id() == Some(chain_id))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.recorded.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.recorded.lock().await.is_empty()
    }

    pub async fn reset(&self) {
        self.recorded.lock().await.clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: BundlerEvent) -> Result<()> {
        self.recorded.lock().await.push(event);
        Ok(())
    }
}
