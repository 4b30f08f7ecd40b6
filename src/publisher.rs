use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from the outbound publish side channel. These are logged and
/// swallowed by the orchestrator, never surfaced to the caller.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to create producer: {0}")]
    Creation(String),

    #[error("Failed to publish to {channel}: {message}")]
    Send { channel: String, message: String },
}

/// Outbound message-bus publisher seam. Channels are bus topic names
/// derived from the device's topic grammar.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    async fn publish(&self, channel: &str, key: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Kafka-backed channel publisher, keyed by device id.
pub struct KafkaChannelPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaChannelPublisher {
    pub fn new(bootstrap_servers: &str, timeout: Duration) -> Result<Self, PublishError> {
        info!(servers = %bootstrap_servers, "Creating message-bus producer");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(|e| PublishError::Creation(e.to_string()))?;

        Ok(Self { producer, timeout })
    }
}

#[async_trait]
impl ChannelPublisher for KafkaChannelPublisher {
    #[instrument(skip(self, payload))]
    async fn publish(&self, channel: &str, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::to(channel).key(key).payload(payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| PublishError::Send {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(())
    }
}
