use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::ConsumerConfigBuilder;
use crate::broker::{ConsumerFactory, QueueConsumer};
use crate::config::Config;
use crate::discovery::{QueueConfig, TopicPartitionInfo, TopicService};
use crate::error::{QueueError, QueueResult};
use crate::metrics::SharedMetrics;
use crate::metrics_const::CONSUMER_POISON_PILLS_COUNTER;
use crate::msg::{EncodedMsg, QueueMsg};

/// Broker consumer over an rdkafka `StreamConsumer`.
///
/// Each partition of a logical queue is its own Kafka topic, so subscriptions
/// are by full topic name and the group coordinator balances nothing.
pub struct KafkaQueueConsumer<T> {
    consumer: StreamConsumer,
    group_id: String,
    partitions: RwLock<HashSet<TopicPartitionInfo>>,
    // next offset to commit per (topic, partition)
    offsets: Mutex<HashMap<(String, i32), i64>>,
    max_poll_records: usize,
    stopped: AtomicBool,
    metrics: SharedMetrics,
    _payload: PhantomData<fn() -> T>,
}

impl<T> KafkaQueueConsumer<T> {
    pub fn new(
        consumer: StreamConsumer,
        group_id: String,
        max_poll_records: usize,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            consumer,
            group_id,
            partitions: RwLock::new(HashSet::new()),
            offsets: Mutex::new(HashMap::new()),
            max_poll_records: max_poll_records.max(1),
            stopped: AtomicBool::new(false),
            metrics,
            _payload: PhantomData,
        }
    }

    fn track_offset(&self, message: &BorrowedMessage<'_>) {
        self.offsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (message.topic().to_string(), message.partition()),
                message.offset() + 1,
            );
    }
}

fn encoded_from(message: &BorrowedMessage<'_>) -> EncodedMsg {
    let key = message
        .key()
        .and_then(|k| std::str::from_utf8(k).ok())
        .and_then(|k| Uuid::parse_str(k).ok())
        .unwrap_or_else(Uuid::new_v4);

    let mut headers = HashMap::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    EncodedMsg {
        key,
        data: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

#[async_trait]
impl<T> QueueConsumer<T> for KafkaQueueConsumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn subscribe(&self, partitions: HashSet<TopicPartitionInfo>) -> QueueResult<()> {
        if self.is_stopped() {
            return Err(QueueError::ConsumerStopped);
        }
        if partitions.is_empty() {
            self.unsubscribe();
            return Ok(());
        }

        let mut topics: Vec<&str> = partitions
            .iter()
            .map(|tpi| tpi.full_topic_name.as_str())
            .collect();
        topics.sort_unstable();
        topics.dedup();
        self.consumer.subscribe(&topics)?;
        info!(group_id = %self.group_id, topics = ?topics, "Subscribed kafka consumer");

        *self.partitions.write().unwrap_or_else(|e| e.into_inner()) = partitions;
        Ok(())
    }

    fn unsubscribe(&self) {
        self.consumer.unsubscribe();
        self.partitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn subscriptions(&self) -> HashSet<TopicPartitionInfo> {
        self.partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn poll(&self, timeout: Duration) -> QueueResult<Vec<QueueMsg<T>>> {
        if self.is_stopped() {
            return Err(QueueError::ConsumerStopped);
        }
        if self.subscriptions().is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();
        while batch.len() < self.max_poll_records {
            // Once something arrived, only take what is already buffered.
            let wait_until = if batch.is_empty() { deadline } else { Instant::now() };
            let message = match tokio::time::timeout_at(wait_until, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => message,
                Ok(Err(e)) if batch.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!(group_id = %self.group_id, error = ?e, "Kafka error mid-batch, returning partial batch");
                    break;
                }
            };

            self.track_offset(&message);
            let encoded = encoded_from(&message);
            match encoded.decode::<T>() {
                Ok(msg) => batch.push(msg),
                Err(e) => {
                    warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        error = ?e,
                        "Skipping undecodable message"
                    );
                    self.metrics.increment(
                        CONSUMER_POISON_PILLS_COUNTER,
                        &[("topic", message.topic().to_string())],
                        1,
                    );
                }
            }
        }
        Ok(batch)
    }

    fn commit(&self) -> QueueResult<()> {
        let offsets = std::mem::take(&mut *self.offsets.lock().unwrap_or_else(|e| e.into_inner()));
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for ((topic, partition), next_offset) in &offsets {
            list.add_partition_offset(topic, *partition, Offset::Offset(*next_offset))?;
        }

        if let Err(e) = self.consumer.commit(&list, CommitMode::Sync) {
            // put them back so the next commit retries them
            let mut tracked = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
            for (key, offset) in offsets {
                tracked.entry(key).or_insert(offset);
            }
            return Err(e.into());
        }
        debug!(group_id = %self.group_id, partitions = offsets.len(), "Committed offsets");
        Ok(())
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.consumer.unsubscribe();
            info!(group_id = %self.group_id, "Stopped kafka consumer");
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Creates one Kafka consumer per queue (or per partition), with group ids
/// `prefix + [tenant-] + queue + [-partition]`.
pub struct KafkaConsumerFactory<T> {
    config: Config,
    topics: TopicService,
    group_prefix: String,
    metrics: SharedMetrics,
    _payload: PhantomData<fn() -> T>,
}

impl<T> KafkaConsumerFactory<T> {
    pub fn new(config: Config, group_prefix: impl Into<String>, metrics: SharedMetrics) -> Self {
        Self {
            topics: config.topic_service(),
            config,
            group_prefix: group_prefix.into(),
            metrics,
            _payload: PhantomData,
        }
    }

    pub fn group_id(&self, queue: &QueueConfig, partition: Option<&TopicPartitionInfo>) -> String {
        let tenant = queue.isolated.then_some(queue.tenant_id);
        self.topics.build_consumer_group_id(
            &self.group_prefix,
            tenant,
            &queue.name,
            partition.and_then(|p| p.partition),
        )
    }
}

impl<T> ConsumerFactory<T> for KafkaConsumerFactory<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn create(
        &self,
        queue: &QueueConfig,
        partition: Option<&TopicPartitionInfo>,
    ) -> QueueResult<Arc<dyn QueueConsumer<T>>> {
        let group_id = self.group_id(queue, partition);
        let consumer: StreamConsumer =
            ConsumerConfigBuilder::from_config(&self.config, &group_id)
                .build()
                .create()?;
        debug!(group_id = %group_id, queue = %queue.key(), "Created kafka consumer");
        Ok(Arc::new(KafkaQueueConsumer::new(
            consumer,
            group_id,
            self.config.kafka_max_poll_records,
            Arc::clone(&self.metrics),
        )))
    }
}
