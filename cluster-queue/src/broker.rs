//! Narrow contracts the core needs from a broker client.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::discovery::{QueueConfig, TopicPartitionInfo};
use crate::error::QueueResult;
use crate::msg::{EncodedMsg, QueueMsg};

/// Consumer side of a partitioned append log with group offset commit.
///
/// Implementations use interior mutability: the poll loop and the manager
/// that re-subscribes it share one instance.
#[async_trait]
pub trait QueueConsumer<T: Send + 'static>: Send + Sync {
    /// Replaces the whole subscription. An empty set unsubscribes.
    fn subscribe(&self, partitions: HashSet<TopicPartitionInfo>) -> QueueResult<()>;

    fn unsubscribe(&self);

    fn subscriptions(&self) -> HashSet<TopicPartitionInfo>;

    /// Waits at most `timeout` for messages. Returns an empty batch on timeout.
    async fn poll(&self, timeout: Duration) -> QueueResult<Vec<QueueMsg<T>>>;

    /// Commits everything returned by previous polls.
    fn commit(&self) -> QueueResult<()>;

    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueProducer: Send + Sync {
    async fn send(&self, tpi: &TopicPartitionInfo, msg: EncodedMsg) -> QueueResult<SendMetadata>;
}

/// Builds consumers for a queue, one per partition in consumer-per-partition mode.
pub trait ConsumerFactory<T: Send + 'static>: Send + Sync {
    fn create(
        &self,
        config: &QueueConfig,
        partition: Option<&TopicPartitionInfo>,
    ) -> QueueResult<Arc<dyn QueueConsumer<T>>>;
}
