use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::ids::{ServiceType, TenantId};
use super::tpi::QueueKey;

/// How a pack's failed and timed-out messages are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStrategyType {
    #[default]
    SkipAllFailures,
    SkipAllFailuresAndTimedOut,
    RetryAll,
    RetryFailed,
    RetryTimedOut,
    RetryFailedAndTimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingStrategyConfig {
    pub strategy_type: ProcessingStrategyType,
    /// Zero means retry forever.
    pub retries: u32,
    /// Commit without retrying when failed+timed-out is below this share of the pack.
    pub failure_percentage: f64,
    pub pause_between_retries: Duration,
    pub max_pause_between_retries: Duration,
}

impl Default for ProcessingStrategyConfig {
    fn default() -> Self {
        Self {
            strategy_type: ProcessingStrategyType::SkipAllFailures,
            retries: 3,
            failure_percentage: 0.0,
            pause_between_retries: Duration::from_secs(3),
            max_pause_between_retries: Duration::from_secs(3),
        }
    }
}

/// Order in which a pack's messages are handed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitStrategyType {
    /// Everything at once.
    #[default]
    Burst,
    /// `batch_size` messages at a time, the next batch once the previous resolved.
    Batch,
    SequentialByOriginator,
    SequentialByTenant,
    /// One message at a time across the whole pack.
    Sequential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitStrategyConfig {
    pub strategy_type: SubmitStrategyType,
    pub batch_size: usize,
}

impl Default for SubmitStrategyConfig {
    fn default() -> Self {
        Self {
            strategy_type: SubmitStrategyType::Burst,
            batch_size: 1000,
        }
    }
}

/// Immutable snapshot of a queue's configuration.
///
/// Changes produce a new value; holders compare snapshots by equality to
/// detect a real change.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub service_type: ServiceType,
    pub tenant_id: TenantId,
    pub name: String,
    pub topic: String,
    pub partitions: i32,
    /// Tenant-isolated queues get their own topics and consumers.
    pub isolated: bool,
    pub consumer_per_partition: bool,
    pub duplicate_msg_to_all_partitions: bool,
    pub poll_interval: Duration,
    pub pack_processing_timeout: Duration,
    pub processing_strategy: ProcessingStrategyConfig,
    pub submit_strategy: SubmitStrategyConfig,
}

impl QueueConfig {
    pub fn new(service_type: ServiceType, name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            service_type,
            tenant_id: TenantId::SYS,
            name: name.into(),
            topic: topic.into(),
            partitions: 10,
            isolated: false,
            consumer_per_partition: false,
            duplicate_msg_to_all_partitions: false,
            poll_interval: Duration::from_millis(25),
            pack_processing_timeout: Duration::from_secs(2),
            processing_strategy: ProcessingStrategyConfig::default(),
            submit_strategy: SubmitStrategyConfig::default(),
        }
    }

    pub fn key(&self) -> QueueKey {
        let key = QueueKey::new(self.service_type).with_queue_name(self.name.clone());
        if self.isolated {
            key.with_tenant(self.tenant_id)
        } else {
            key
        }
    }
}

/// External store of queue configurations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueDirectory: Send + Sync {
    async fn find_all_queues(&self) -> anyhow::Result<Vec<Arc<QueueConfig>>>;

    async fn find_queue_by_tenant_and_name(
        &self,
        tenant_id: TenantId,
        name: &str,
    ) -> anyhow::Result<Option<Arc<QueueConfig>>>;
}

/// Directory backed by a concurrent map, for single-process deployments.
#[derive(Default)]
pub struct InMemoryQueueDirectory {
    queues: DashMap<(TenantId, String), Arc<QueueConfig>>,
}

impl InMemoryQueueDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a config, replacing any previous snapshot for the same tenant and name.
    pub fn upsert(&self, config: QueueConfig) -> Arc<QueueConfig> {
        let config = Arc::new(config);
        self.queues.insert(
            (config.tenant_id, config.name.clone()),
            Arc::clone(&config),
        );
        config
    }

    pub fn remove(&self, tenant_id: TenantId, name: &str) -> Option<Arc<QueueConfig>> {
        self.queues
            .remove(&(tenant_id, name.to_string()))
            .map(|(_, config)| config)
    }
}

#[async_trait]
impl QueueDirectory for InMemoryQueueDirectory {
    async fn find_all_queues(&self) -> anyhow::Result<Vec<Arc<QueueConfig>>> {
        Ok(self.queues.iter().map(|e| Arc::clone(e.value())).collect())
    }

    async fn find_queue_by_tenant_and_name(
        &self,
        tenant_id: TenantId,
        name: &str,
    ) -> anyhow::Result<Option<Arc<QueueConfig>>> {
        Ok(self
            .queues
            .get(&(tenant_id, name.to_string()))
            .map(|e| Arc::clone(e.value())))
    }
}
