use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::ManagedQueue;
use crate::discovery::{QueueConfig, QueueKey, TopicPartitionInfo};
use crate::metrics::SharedMetrics;
use crate::metrics_const::{
    LIFECYCLE_CONTENTION_COUNTER, LIFECYCLE_TASKS_APPLIED_COUNTER,
    LIFECYCLE_TASKS_COALESCED_COUNTER,
};

pub enum LifecycleTask {
    Create(Arc<QueueConfig>),
    UpdateConfig(Arc<QueueConfig>),
    UpdatePartitions(HashSet<TopicPartitionInfo>),
    Delete,
    Stop,
}

impl LifecycleTask {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleTask::Create(_) => "create",
            LifecycleTask::UpdateConfig(_) => "update_config",
            LifecycleTask::UpdatePartitions(_) => "update_partitions",
            LifecycleTask::Delete => "delete",
            LifecycleTask::Stop => "stop",
        }
    }
}

impl fmt::Debug for LifecycleTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleTask::UpdatePartitions(partitions) => {
                write!(f, "update_partitions({} partitions)", partitions.len())
            }
            other => f.write_str(other.kind()),
        }
    }
}

struct LifecycleInner {
    label: String,
    target: Arc<dyn ManagedQueue>,
    tasks: Mutex<VecDeque<LifecycleTask>>,
    draining: AtomicBool,
    deleted: AtomicBool,
    backoff: Duration,
    metrics: SharedMetrics,
}

/// Serializes lifecycle operations for one queue.
///
/// Tasks land in a mailbox; whoever wins the drain flag applies them in
/// order. Creates run immediately, repeated config and partition updates
/// collapse to the latest of each, and stop/delete discard the updates
/// queued before them. A loser of the flag retries after a backoff.
#[derive(Clone)]
pub struct QueueLifecycleManager {
    inner: Arc<LifecycleInner>,
}

impl QueueLifecycleManager {
    pub fn new(
        key: &QueueKey,
        target: Arc<dyn ManagedQueue>,
        backoff: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                label: key.to_string(),
                target,
                tasks: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                deleted: AtomicBool::new(false),
                backoff,
                metrics,
            }),
        }
    }

    /// Enqueues a task and schedules a drain on the runtime.
    pub fn submit(&self, task: LifecycleTask) {
        info!(queue = %self.inner.label, task = ?task, "Adding lifecycle task");
        self.inner.push(task);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.try_drain().await });
    }

    /// Drains the mailbox on the caller's task.
    pub async fn drain_now(&self) {
        Arc::clone(&self.inner).try_drain().await;
    }

    pub fn is_idle(&self) -> bool {
        !self.inner.draining.load(Ordering::Acquire) && self.inner.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }
}

impl LifecycleInner {
    fn push(&self, task: LifecycleTask) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push_back(task),
            Err(poisoned) => poisoned.into_inner().push_back(task),
        }
    }

    fn pop(&self) -> Option<LifecycleTask> {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    fn is_empty(&self) -> bool {
        match self.tasks.lock() {
            Ok(tasks) => tasks.is_empty(),
            Err(poisoned) => poisoned.into_inner().is_empty(),
        }
    }

    async fn try_drain(self: Arc<Self>) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!(queue = %self.label, "Lifecycle manager busy, retrying later");
                self.metrics.increment(
                    LIFECYCLE_CONTENTION_COUNTER,
                    &[("queue", self.label.clone())],
                    1,
                );
                tokio::time::sleep(self.backoff).await;
                continue;
            }

            self.drain().await;
            self.draining.store(false, Ordering::Release);

            // A task pushed while we held the flag may have lost the race
            // and still be sleeping; pick it up now.
            if self.is_empty() {
                return;
            }
        }
    }

    async fn drain(&self) {
        let mut new_config: Option<Arc<QueueConfig>> = None;
        let mut new_partitions: Option<HashSet<TopicPartitionInfo>> = None;
        let mut coalesced = 0u64;

        while let Some(task) = self.pop() {
            let kind = task.kind();
            match task {
                LifecycleTask::Create(config) => {
                    self.deleted.store(false, Ordering::Release);
                    self.target.create(config).await;
                }
                LifecycleTask::UpdateConfig(config) => {
                    if new_config.replace(config).is_some() {
                        coalesced += 1;
                    }
                }
                LifecycleTask::UpdatePartitions(partitions) => {
                    if new_partitions.replace(partitions).is_some() {
                        coalesced += 1;
                    }
                }
                LifecycleTask::Stop => {
                    new_config = None;
                    new_partitions = None;
                    self.target.stop().await;
                }
                LifecycleTask::Delete => {
                    new_config = None;
                    new_partitions = None;
                    self.deleted.store(true, Ordering::Release);
                    self.target.delete().await;
                }
            }
            self.metrics.increment(
                LIFECYCLE_TASKS_APPLIED_COUNTER,
                &[("queue", self.label.clone()), ("task", kind.to_string())],
                1,
            );
        }

        if coalesced > 0 {
            self.metrics.increment(
                LIFECYCLE_TASKS_COALESCED_COUNTER,
                &[("queue", self.label.clone())],
                coalesced,
            );
        }

        if self.deleted.load(Ordering::Acquire) {
            if new_config.is_some() || new_partitions.is_some() {
                debug!(queue = %self.label, "Ignoring updates for a deleted queue");
            }
            return;
        }
        if let Some(config) = new_config {
            self.target.update_config(config).await;
        }
        if let Some(partitions) = new_partitions {
            self.target.update_partitions(partitions).await;
        }
    }
}
