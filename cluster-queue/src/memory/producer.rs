use std::sync::Arc;

use async_trait::async_trait;

use super::storage::InMemoryStorage;
use crate::broker::{QueueProducer, SendMetadata};
use crate::discovery::TopicPartitionInfo;
use crate::error::QueueResult;
use crate::msg::EncodedMsg;

pub struct InMemoryQueueProducer {
    storage: Arc<InMemoryStorage>,
}

impl InMemoryQueueProducer {
    pub fn new(storage: Arc<InMemoryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl QueueProducer for InMemoryQueueProducer {
    async fn send(&self, tpi: &TopicPartitionInfo, msg: EncodedMsg) -> QueueResult<SendMetadata> {
        let offset = self.storage.put(&tpi.full_topic_name, msg);
        Ok(SendMetadata {
            topic: tpi.full_topic_name.clone(),
            partition: tpi.partition.unwrap_or(0),
            offset,
        })
    }
}
