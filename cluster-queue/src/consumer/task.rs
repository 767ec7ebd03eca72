use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MsgPackProcessor;
use crate::broker::QueueConsumer;
use crate::discovery::{QueueConfig, QueueKey, TopicPartitionInfo};
use crate::error::QueueResult;
use crate::metrics::SharedMetrics;
use crate::metrics_const::CONSUMER_LOOP_ERRORS_COUNTER;

/// One broker consumer and the poll loop driving it.
pub struct ConsumerTask<T: Send + 'static> {
    key: QueueKey,
    partition: Option<TopicPartitionInfo>,
    consumer: Arc<dyn QueueConsumer<T>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + Sync + 'static> ConsumerTask<T> {
    pub fn new(
        key: QueueKey,
        partition: Option<TopicPartitionInfo>,
        consumer: Arc<dyn QueueConsumer<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            partition,
            consumer,
            cancel,
            handle: None,
        }
    }

    pub fn partition(&self) -> Option<&TopicPartitionInfo> {
        self.partition.as_ref()
    }

    pub fn consumer(&self) -> &Arc<dyn QueueConsumer<T>> {
        &self.consumer
    }

    pub fn subscribe(&self, partitions: HashSet<TopicPartitionInfo>) -> QueueResult<()> {
        debug!(queue = %self.key, partitions = ?partitions, "Subscribing consumer");
        self.consumer.subscribe(partitions)
    }

    pub fn subscriptions(&self) -> HashSet<TopicPartitionInfo> {
        self.consumer.subscriptions()
    }

    pub fn is_launched(&self) -> bool {
        self.handle.is_some()
    }

    pub fn launch(
        &mut self,
        processor: Arc<dyn MsgPackProcessor<T>>,
        config: Arc<QueueConfig>,
        ready: watch::Receiver<bool>,
        metrics: SharedMetrics,
    ) {
        if self.handle.is_some() {
            return;
        }
        self.handle = Some(tokio::spawn(consumer_loop(
            self.key.clone(),
            Arc::clone(&self.consumer),
            processor,
            config,
            ready,
            self.cancel.clone(),
            metrics,
        )));
    }

    /// Signals the loop without waiting for it.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    /// Signals the loop, waits for it to exit and stops the consumer.
    pub async fn stop_and_await(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(queue = %self.key, error = ?e, "Consumer loop panicked");
                }
            }
        }
        self.consumer.stop();
    }
}

async fn wait_ready(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}

async fn consumer_loop<T: Send + Sync + 'static>(
    key: QueueKey,
    consumer: Arc<dyn QueueConsumer<T>>,
    processor: Arc<dyn MsgPackProcessor<T>>,
    config: Arc<QueueConfig>,
    mut ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    metrics: SharedMetrics,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        is_ready = wait_ready(&mut ready) => {
            if !is_ready {
                warn!(queue = %key, "Readiness signal dropped before the service became ready");
                return;
            }
        }
    }

    info!(queue = %key, "Consumer loop started");
    while !cancel.is_cancelled() && !consumer.is_stopped() {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = consumer.poll(config.poll_interval) => polled,
        };

        let outcome = match polled {
            Ok(msgs) if msgs.is_empty() => Ok(()),
            Ok(msgs) => {
                processor
                    .process(msgs, consumer.as_ref(), &config, &cancel)
                    .await
            }
            Err(e) => Err(anyhow::Error::new(e).context("poll failed")),
        };

        if let Err(e) = outcome {
            if cancel.is_cancelled() {
                break;
            }
            warn!(queue = %key, error = ?e, "Failed to process messages from queue");
            metrics.increment(CONSUMER_LOOP_ERRORS_COUNTER, &[("queue", key.to_string())], 1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }
    info!(queue = %key, "Consumer loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ServiceType;
    use crate::metrics::InMemoryMetricsSink;
    use crate::test_utils::{eventually, RecordingConsumer, RecordingPackProcessor};
    use std::time::Duration;

    fn tpi(p: i32) -> TopicPartitionInfo {
        TopicPartitionInfo::new("tb_core", None, Some(p), true)
    }

    #[tokio::test]
    async fn test_loop_waits_for_readiness() {
        let consumer = Arc::new(RecordingConsumer::<u32>::new());
        consumer.push_batch(vec![1, 2]);
        let processor = Arc::new(RecordingPackProcessor::<u32>::new());
        let (ready_tx, ready_rx) = watch::channel(false);

        let mut task: ConsumerTask<u32> = ConsumerTask::new(
            QueueKey::new(ServiceType::Core),
            None,
            consumer.clone(),
            CancellationToken::new(),
        );
        task.subscribe([tpi(0)].into_iter().collect()).unwrap();
        task.launch(
            processor.clone(),
            Arc::new(QueueConfig::new(ServiceType::Core, "Main", "tb_core")),
            ready_rx,
            Arc::new(InMemoryMetricsSink::new()),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(consumer.poll_count(), 0);

        ready_tx.send_replace(true);
        assert!(eventually(Duration::from_secs(1), || processor.processed() == vec![1, 2]).await);
        assert!(consumer.commit_count() >= 1);

        task.stop_and_await().await;
        assert!(consumer.is_stopped());
    }

    #[tokio::test]
    async fn test_processor_error_does_not_stop_loop() {
        let consumer = Arc::new(RecordingConsumer::<u32>::new());
        consumer.push_batch(vec![1]);
        consumer.push_batch(vec![2]);
        let processor = Arc::new(RecordingPackProcessor::<u32>::failing_first(1));
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let (_ready_tx, ready_rx) = watch::channel(true);

        let mut task: ConsumerTask<u32> = ConsumerTask::new(
            QueueKey::new(ServiceType::Core),
            None,
            consumer.clone(),
            CancellationToken::new(),
        );
        task.launch(
            processor.clone(),
            Arc::new(QueueConfig::new(ServiceType::Core, "Main", "tb_core")),
            ready_rx,
            metrics.clone(),
        );

        assert!(eventually(Duration::from_secs(1), || processor.processed() == vec![2]).await);
        assert_eq!(metrics.counter(CONSUMER_LOOP_ERRORS_COUNTER), 1);
        task.stop_and_await().await;
    }
}
