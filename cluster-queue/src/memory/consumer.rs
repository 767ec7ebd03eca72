use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::warn;

use super::storage::InMemoryStorage;
use crate::broker::{ConsumerFactory, QueueConsumer};
use crate::discovery::{QueueConfig, TopicPartitionInfo};
use crate::error::{QueueError, QueueResult};
use crate::msg::QueueMsg;

pub struct InMemoryQueueConsumer<T> {
    storage: Arc<InMemoryStorage>,
    partitions: RwLock<HashSet<TopicPartitionInfo>>,
    max_poll_records: usize,
    stopped: AtomicBool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> InMemoryQueueConsumer<T> {
    pub fn new(storage: Arc<InMemoryStorage>, max_poll_records: usize) -> Self {
        Self {
            storage,
            partitions: RwLock::new(HashSet::new()),
            max_poll_records: max_poll_records.max(1),
            stopped: AtomicBool::new(false),
            _payload: PhantomData,
        }
    }

    fn topics(&self) -> Vec<String> {
        self.partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|tpi| tpi.full_topic_name.clone())
            .collect()
    }
}

impl<T: DeserializeOwned> InMemoryQueueConsumer<T> {
    fn drain(&self) -> Vec<QueueMsg<T>> {
        let mut batch = Vec::new();
        for topic in self.topics() {
            let remaining = self.max_poll_records.saturating_sub(batch.len());
            if remaining == 0 {
                break;
            }
            for encoded in self.storage.take(&topic, remaining) {
                match encoded.decode::<T>() {
                    Ok(msg) => batch.push(msg),
                    Err(e) => warn!(topic = %topic, key = %encoded.key, error = ?e, "Skipping undecodable message"),
                }
            }
        }
        batch
    }
}

#[async_trait]
impl<T> QueueConsumer<T> for InMemoryQueueConsumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn subscribe(&self, partitions: HashSet<TopicPartitionInfo>) -> QueueResult<()> {
        if self.is_stopped() {
            return Err(QueueError::ConsumerStopped);
        }
        *self.partitions.write().unwrap_or_else(|e| e.into_inner()) = partitions;
        Ok(())
    }

    fn unsubscribe(&self) {
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
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.storage.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.drain();
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn commit(&self) -> QueueResult<()> {
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

pub struct InMemoryConsumerFactory<T> {
    storage: Arc<InMemoryStorage>,
    max_poll_records: usize,
    _payload: PhantomData<fn() -> T>,
}

impl<T> InMemoryConsumerFactory<T> {
    pub fn new(storage: Arc<InMemoryStorage>, max_poll_records: usize) -> Self {
        Self {
            storage,
            max_poll_records,
            _payload: PhantomData,
        }
    }
}

impl<T> ConsumerFactory<T> for InMemoryConsumerFactory<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn create(
        &self,
        _config: &QueueConfig,
        _partition: Option<&TopicPartitionInfo>,
    ) -> QueueResult<Arc<dyn QueueConsumer<T>>> {
        Ok(Arc::new(InMemoryQueueConsumer::new(
            Arc::clone(&self.storage),
            self.max_poll_records,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueProducer;
    use crate::memory::InMemoryQueueProducer;

    fn tpi(p: i32) -> TopicPartitionInfo {
        TopicPartitionInfo::new("tb_core", None, Some(p), true)
    }

    #[tokio::test]
    async fn test_poll_returns_only_subscribed_partitions() {
        let storage = Arc::new(InMemoryStorage::new());
        let producer = InMemoryQueueProducer::new(Arc::clone(&storage));
        for p in 0..3 {
            let msg = QueueMsg::new(uuid::Uuid::new_v4(), p).encode().unwrap();
            producer.send(&tpi(p), msg).await.unwrap();
        }

        let consumer: InMemoryQueueConsumer<i32> = InMemoryQueueConsumer::new(storage, 10);
        consumer.subscribe([tpi(0), tpi(2)].into_iter().collect()).unwrap();
        let mut values: Vec<i32> = consumer
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.value)
            .collect();
        values.sort();
        assert_eq!(values, vec![0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let consumer: InMemoryQueueConsumer<i32> =
            InMemoryQueueConsumer::new(Arc::new(InMemoryStorage::new()), 10);
        consumer.subscribe([tpi(0)].into_iter().collect()).unwrap();
        let start = Instant::now();
        let batch = consumer.poll(Duration::from_millis(25)).await.unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_put() {
        let storage = Arc::new(InMemoryStorage::new());
        let consumer: Arc<InMemoryQueueConsumer<i32>> =
            Arc::new(InMemoryQueueConsumer::new(Arc::clone(&storage), 10));
        consumer.subscribe([tpi(1)].into_iter().collect()).unwrap();

        let polling = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.poll(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        storage.put("tb_core.1", QueueMsg::new(uuid::Uuid::new_v4(), 7).encode().unwrap());

        let batch = polling.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, 7);
    }

    #[tokio::test]
    async fn test_undecodable_messages_are_skipped() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.put(
            "tb_core.0",
            crate::msg::EncodedMsg {
                key: uuid::Uuid::new_v4(),
                data: b"{".to_vec(),
                headers: Default::default(),
            },
        );
        storage.put("tb_core.0", QueueMsg::new(uuid::Uuid::new_v4(), 1).encode().unwrap());

        let consumer: InMemoryQueueConsumer<i32> = InMemoryQueueConsumer::new(storage, 10);
        consumer.subscribe([tpi(0)].into_iter().collect()).unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_consumer_rejects_poll() {
        let consumer: InMemoryQueueConsumer<i32> =
            InMemoryQueueConsumer::new(Arc::new(InMemoryStorage::new()), 10);
        consumer.stop();
        assert!(consumer.is_stopped());
        assert!(matches!(
            consumer.poll(Duration::from_millis(1)).await,
            Err(QueueError::ConsumerStopped)
        ));
    }
}
