//! Poll loops and the managers that own them.

mod lifecycle;
mod manager;
mod task;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broker::QueueConsumer;
use crate::discovery::{QueueConfig, TopicPartitionInfo};
use crate::msg::QueueMsg;

pub use lifecycle::{LifecycleTask, QueueLifecycleManager};
pub use manager::{ConsumerManagerSettings, QueueConsumerManager};
pub use task::ConsumerTask;

/// Handler registered with a consumer manager for every non-empty poll.
///
/// Implementations own the pack lifecycle: build the processing context,
/// await it, and commit through `consumer` before returning.
#[async_trait]
pub trait MsgPackProcessor<T: Send + 'static>: Send + Sync {
    async fn process(
        &self,
        msgs: Vec<QueueMsg<T>>,
        consumer: &dyn QueueConsumer<T>,
        config: &QueueConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Operations a lifecycle manager applies to the queue it serializes.
#[async_trait]
pub trait ManagedQueue: Send + Sync {
    async fn create(&self, config: Arc<QueueConfig>);

    async fn update_config(&self, config: Arc<QueueConfig>);

    async fn update_partitions(&self, partitions: HashSet<TopicPartitionInfo>);

    /// Stops consumption for good; a later `create` starts over.
    async fn delete(&self);

    async fn stop(&self);
}
