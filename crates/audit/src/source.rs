use anyhow::Result;
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

use crate::types::{BundlerEvent, Hint};

#[async_trait]
pub trait HintSource {
    async fn run(&self) -> Result<()>;
}

/// Reads sibling processes' events and forwards the hints among them.
pub struct KafkaHintSource {
    consumer: StreamConsumer,
    publisher: mpsc::UnboundedSender<Hint>,
}

impl Debug for KafkaHintSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KafkaHintSource")
    }
}

impl KafkaHintSource {
    pub fn new(
        client_config: ClientConfig,
        topic: String,
        publisher: mpsc::UnboundedSender<Hint>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[topic.as_str()])?;
        Ok(Self { consumer, publisher })
    }
}

/// Extracts a hint from a raw event payload; anything else is ignored.
pub fn decode_hint(payload: &[u8]) -> Option<Hint> {
    match serde_json::from_slice::<BundlerEvent>(payload) {
        Ok(BundlerEvent::Hint(hint)) => Some(hint),
        Ok(_) => None,
        Err(e) => {
            error!(error = %e, "Failed to deserialize bundler event");
            None
        }
    }
}

#[async_trait]
impl HintSource for KafkaHintSource {
    async fn run(&self) -> Result<()> {
        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    let Some(payload) = message.payload() else {
                        error!("Message has no payload");
                        continue;
                    };

                    let Some(hint) = decode_hint(payload) else {
                        continue;
                    };

                    trace!(
                        chain_id = hint.chain_id(),
                        offset = message.offset(),
                        partition = message.partition(),
                        "Received hint from Kafka"
                    );

                    if self.publisher.send(hint).is_err() {
                        warn!("Hint receiver dropped, stopping hint source");
                        return Ok(());
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error receiving message from Kafka");
                }
            }
        }
    }
}
