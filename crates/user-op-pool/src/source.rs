use anyhow::Result;
use async_trait::async_trait;
use bundler_core::UserOperationRequest;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::{error, trace};

/// A user operation request addressed to one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOpSubmission {
    pub chain_id: u64,
    pub request: UserOperationRequest,
}

#[async_trait]
pub trait UserOpSource {
    async fn run(&self) -> Result<()>;
}

pub struct KafkaUserOpSource {
    consumer: StreamConsumer,
    publisher: mpsc::UnboundedSender<UserOpSubmission>,
}

impl Debug for KafkaUserOpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KafkaUserOpSource")
    }
}

impl KafkaUserOpSource {
    pub fn new(
        client_config: ClientConfig,
        topic: String,
        publisher: mpsc::UnboundedSender<UserOpSubmission>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[topic.as_str()])?;
        Ok(Self { consumer, publisher })
    }
}

#[async_trait]
impl UserOpSource for KafkaUserOpSource {
    async fn run(&self) -> Result<()> {
        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    let Some(payload) = message.payload() else {
                        error!("Message has no payload");
                        continue;
                    };

                    let submission: UserOpSubmission = match serde_json::from_slice(payload) {
                        Ok(submission) => submission,
                        Err(e) => {
                            error!(error = %e, "Failed to deserialize user operation submission");
                            continue;
                        }
                    };

                    trace!(
                        chain_id = submission.chain_id,
                        entry_point = %submission.request.entry_point,
                        offset = message.offset(),
                        partition = message.partition(),
                        "Received user operation from Kafka"
                    );

                    if self.publisher.send(submission).is_err() {
                        // the pool side is gone, nothing left to feed
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

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use bundler_core::test_utils::{TEST_ENTRY_POINT_V07, sender, user_op_v07};

    #[test]
    fn submission_wire_format() {
        let submission = UserOpSubmission {
            chain_id: 10,
            request: UserOperationRequest::new(
                user_op_v07(sender(3), U256::from(5), 21_000),
                TEST_ENTRY_POINT_V07,
            ),
        };
        let json = serde_json::to_value(&submission).unwrap();
        assert_eq!(json["chainId"], 10);
        assert_eq!(json["request"]["userOperation"]["type"], "EntryPointV07");

        let decoded: UserOpSubmission = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, submission);
    }
}
