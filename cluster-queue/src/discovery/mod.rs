//! Cluster topology: identifiers, queue keys, topic naming, and the
//! partition and queue directories consumers are driven by.

mod hash;
mod ids;
mod partition;
mod queue;
mod topic;
mod tpi;

pub use hash::{jump_consistent_hash, stable_hash};
pub use ids::{EntityId, EntityType, ServiceId, ServiceType, TenantId};
pub use partition::{
    HashPartitionService, PartitionChangeEvent, PartitionService, QueueRoutingInfo, ServiceInfo,
};
pub use queue::{
    InMemoryQueueDirectory, ProcessingStrategyConfig, ProcessingStrategyType, QueueConfig,
    QueueDirectory, SubmitStrategyConfig, SubmitStrategyType,
};
#[cfg(test)]
pub use queue::MockQueueDirectory;
pub use topic::TopicService;
pub use tpi::{QueueKey, TopicPartitionInfo, MAIN_QUEUE_NAME};
