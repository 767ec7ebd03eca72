use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use super::config::ProducerConfigBuilder;
use crate::broker::{QueueProducer, SendMetadata};
use crate::config::Config;
use crate::discovery::TopicPartitionInfo;
use crate::error::{QueueError, QueueResult};
use crate::msg::EncodedMsg;

pub struct KafkaQueueProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaQueueProducer {
    pub fn new(producer: FutureProducer, send_timeout: Duration) -> Self {
        Self {
            producer,
            send_timeout,
        }
    }

    /// Builds a producer and pings the brokers with a metadata request.
    pub fn from_config(config: &Config) -> QueueResult<Self> {
        let client_config = ProducerConfigBuilder::from_config(config).build();
        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(e) => {
                error!(error = ?e, "Failed to fetch metadata from Kafka brokers");
                return Err(e.into());
            }
        }

        Ok(Self::new(
            producer,
            Duration::from_millis(u64::from(config.kafka_message_timeout_ms)),
        ))
    }
}

#[async_trait]
impl QueueProducer for KafkaQueueProducer {
    async fn send(&self, tpi: &TopicPartitionInfo, msg: EncodedMsg) -> QueueResult<SendMetadata> {
        let key = msg.key.to_string();
        let mut headers = OwnedHeaders::new_with_capacity(msg.headers.len());
        for (name, value) in &msg.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::to(&tpi.full_topic_name)
            .key(&key)
            .payload(&msg.data)
            .headers(headers);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(SendMetadata {
                topic: tpi.full_topic_name.clone(),
                partition,
                offset,
            }),
            Err((e, _)) => {
                error!(topic = %tpi.full_topic_name, key = %key, error = ?e, "Failed to send message");
                Err(QueueError::send_failure(tpi.full_topic_name.clone(), e))
            }
        }
    }
}
