//! Shared test helpers: recording doubles for the broker seams and a
//! polling assertion helper.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::broker::{ConsumerFactory, QueueConsumer, QueueProducer, SendMetadata};
use crate::consumer::{ManagedQueue, MsgPackProcessor};
use crate::discovery::{QueueConfig, TopicPartitionInfo};
use crate::error::{QueueError, QueueResult};
use crate::msg::{EncodedMsg, QueueMsg};

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once per process. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // Another harness may already own the global subscriber.
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .is_err()
        {
            eprintln!("tracing subscriber already installed");
        }
    });
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consumer fed from an in-process list of batches.
pub struct RecordingConsumer<T> {
    batches: Mutex<VecDeque<Vec<T>>>,
    subscriptions: Mutex<HashSet<TopicPartitionInfo>>,
    polls: AtomicUsize,
    commits: AtomicUsize,
    stopped: AtomicBool,
}

impl<T> Default for RecordingConsumer<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(HashSet::new()),
            polls: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }
}

impl<T> RecordingConsumer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, batch: Vec<T>) {
        lock(&self.batches).push_back(batch);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> QueueConsumer<T> for RecordingConsumer<T> {
    fn subscribe(&self, partitions: HashSet<TopicPartitionInfo>) -> QueueResult<()> {
        *lock(&self.subscriptions) = partitions;
        Ok(())
    }

    fn unsubscribe(&self) {
        lock(&self.subscriptions).clear();
    }

    fn subscriptions(&self) -> HashSet<TopicPartitionInfo> {
        lock(&self.subscriptions).clone()
    }

    async fn poll(&self, timeout: Duration) -> QueueResult<Vec<QueueMsg<T>>> {
        if self.is_stopped() {
            return Err(QueueError::ConsumerStopped);
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        let batch = lock(&self.batches).pop_front();
        match batch {
            Some(values) => Ok(values
                .into_iter()
                .map(|value| QueueMsg::new(Uuid::new_v4(), value))
                .collect()),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    fn commit(&self) -> QueueResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.unsubscribe();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Hands out fresh `RecordingConsumer`s and remembers them.
pub struct RecordingConsumerFactory<T> {
    consumers: Mutex<Vec<Arc<RecordingConsumer<T>>>>,
}

impl<T> Default for RecordingConsumerFactory<T> {
    fn default() -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> RecordingConsumerFactory<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumers(&self) -> Vec<Arc<RecordingConsumer<T>>> {
        lock(&self.consumers).clone()
    }

    pub fn created(&self) -> usize {
        lock(&self.consumers).len()
    }
}

impl<T: Send + 'static> RecordingConsumerFactory<T> {
    pub fn stopped(&self) -> usize {
        lock(&self.consumers)
            .iter()
            .filter(|c| c.is_stopped())
            .count()
    }
}

impl<T: Send + 'static> ConsumerFactory<T> for RecordingConsumerFactory<T> {
    fn create(
        &self,
        _config: &QueueConfig,
        _partition: Option<&TopicPartitionInfo>,
    ) -> QueueResult<Arc<dyn QueueConsumer<T>>> {
        let consumer = Arc::new(RecordingConsumer::new());
        lock(&self.consumers).push(Arc::clone(&consumer));
        Ok(consumer)
    }
}

/// Records every processed value and commits; can fail the first packs.
pub struct RecordingPackProcessor<T> {
    processed: Mutex<Vec<T>>,
    failures_left: AtomicUsize,
}

impl<T> RecordingPackProcessor<T> {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(packs: usize) -> Self {
        Self {
            processed: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(packs),
        }
    }
}

impl<T> Default for RecordingPackProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> RecordingPackProcessor<T> {
    pub fn processed(&self) -> Vec<T> {
        lock(&self.processed).clone()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> MsgPackProcessor<T> for RecordingPackProcessor<T> {
    async fn process(
        &self,
        msgs: Vec<QueueMsg<T>>,
        consumer: &dyn QueueConsumer<T>,
        _config: &QueueConfig,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("pack rejected");
        }
        lock(&self.processed).extend(msgs.into_iter().map(|m| m.value));
        consumer.commit()?;
        Ok(())
    }
}

/// One call observed by `RecordingManagedQueue`.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOp {
    Create(Arc<QueueConfig>),
    UpdateConfig(Arc<QueueConfig>),
    UpdatePartitions(HashSet<TopicPartitionInfo>),
    Delete,
    Stop,
}

#[derive(Default)]
pub struct RecordingManagedQueue {
    ops: Mutex<Vec<QueueOp>>,
}

impl RecordingManagedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<QueueOp> {
        lock(&self.ops).clone()
    }
}

#[async_trait]
impl ManagedQueue for RecordingManagedQueue {
    async fn create(&self, config: Arc<QueueConfig>) {
        lock(&self.ops).push(QueueOp::Create(config));
    }

    async fn update_config(&self, config: Arc<QueueConfig>) {
        lock(&self.ops).push(QueueOp::UpdateConfig(config));
    }

    async fn update_partitions(&self, partitions: HashSet<TopicPartitionInfo>) {
        lock(&self.ops).push(QueueOp::UpdatePartitions(partitions));
    }

    async fn delete(&self) {
        lock(&self.ops).push(QueueOp::Delete);
    }

    async fn stop(&self) {
        lock(&self.ops).push(QueueOp::Stop);
    }
}

/// Producer that records sends and fails the configured topics.
#[derive(Default)]
pub struct RecordingProducer {
    sent: Mutex<Vec<(TopicPartitionInfo, EncodedMsg)>>,
    failing_topics: Mutex<HashSet<String>>,
    failures_left: AtomicUsize,
}

impl RecordingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to `topic` fails.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        lock(&self.failing_topics).insert(topic.into());
    }

    /// The next `sends` sends fail regardless of topic.
    pub fn fail_next(&self, sends: usize) {
        self.failures_left.store(sends, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(TopicPartitionInfo, EncodedMsg)> {
        lock(&self.sent).clone()
    }

    pub fn sent_topics(&self) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .map(|(tpi, _)| tpi.full_topic_name.clone())
            .collect()
    }
}

#[async_trait]
impl QueueProducer for RecordingProducer {
    async fn send(&self, tpi: &TopicPartitionInfo, msg: EncodedMsg) -> QueueResult<SendMetadata> {
        let topic = tpi.full_topic_name.clone();
        let forced_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced_failure || lock(&self.failing_topics).contains(&topic) {
            return Err(QueueError::send_failure(topic, "broker unavailable"));
        }
        let mut sent = lock(&self.sent);
        sent.push((tpi.clone(), msg));
        Ok(SendMetadata {
            topic,
            partition: tpi.partition.unwrap_or(0),
            offset: i64::try_from(sent.len()).unwrap_or(i64::MAX) - 1,
        })
    }
}
