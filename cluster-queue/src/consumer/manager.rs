use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::task::ConsumerTask;
use super::{ManagedQueue, MsgPackProcessor};
use crate::broker::ConsumerFactory;
use crate::discovery::{QueueConfig, QueueKey, TopicPartitionInfo};
use crate::metrics::SharedMetrics;
use crate::metrics_const::{
    CONSUMERS_ACTIVE_GAUGE, CONSUMER_PARTITIONS_GAUGE, REPARTITION_PASSES_COUNTER,
};

#[derive(Clone)]
pub struct ConsumerManagerSettings {
    /// Debounce for per-partition repartitioning. Zero applies changes inline.
    pub repartition_delay: Duration,
    /// Consumer loops wait for this to turn true before the first poll.
    pub ready: watch::Receiver<bool>,
    pub metrics: SharedMetrics,
}

struct ManagerState<T: Send + 'static> {
    config: Option<Arc<QueueConfig>>,
    main: Option<ConsumerTask<T>>,
    per_partition: HashMap<TopicPartitionInfo, ConsumerTask<T>>,
}

impl<T: Send + Sync + 'static> ManagerState<T> {
    fn drain_tasks(&mut self) -> Vec<ConsumerTask<T>> {
        self.main
            .take()
            .into_iter()
            .chain(self.per_partition.drain().map(|(_, task)| task))
            .collect()
    }
}

struct ManagerInner<T: Send + 'static> {
    key: QueueKey,
    label: String,
    factory: Arc<dyn ConsumerFactory<T>>,
    processor: Arc<dyn MsgPackProcessor<T>>,
    settings: ConsumerManagerSettings,
    state: Mutex<ManagerState<T>>,
    // Latest requested partition set. Readable without the state lock so a
    // pending repartition pass always applies the newest assignment.
    desired: RwLock<Arc<HashSet<TopicPartitionInfo>>>,
    shutdown: StdMutex<CancellationToken>,
    repartition_scheduled: AtomicBool,
    stopped: AtomicBool,
}

/// Owns the consumers of one queue: either a single consumer subscribed to
/// every owned partition, or one consumer per partition.
pub struct QueueConsumerManager<T: Send + 'static> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: Send + 'static> Clone for QueueConsumerManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> QueueConsumerManager<T> {
    pub fn new(
        key: QueueKey,
        factory: Arc<dyn ConsumerFactory<T>>,
        processor: Arc<dyn MsgPackProcessor<T>>,
        settings: ConsumerManagerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                label: key.to_string(),
                key,
                factory,
                processor,
                settings,
                state: Mutex::new(ManagerState {
                    config: None,
                    main: None,
                    per_partition: HashMap::new(),
                }),
                desired: RwLock::new(Arc::new(HashSet::new())),
                shutdown: StdMutex::new(CancellationToken::new()),
                repartition_scheduled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> &QueueKey {
        &self.inner.key
    }

    pub async fn config(&self) -> Option<Arc<QueueConfig>> {
        self.inner.state.lock().await.config.clone()
    }

    /// Starts consumption with `config` and applies the latest partition set.
    /// Consumers left over from an earlier `init` are stopped first.
    pub async fn init(&self, config: Arc<QueueConfig>) {
        let mut state = self.inner.state.lock().await;
        let previous = state.drain_tasks();
        if !previous.is_empty() {
            info!(queue = %self.inner.label, consumers = previous.len(), "Queue re-created, stopping previous consumers");
            for task in &previous {
                task.signal_stop();
            }
            join_all(previous.into_iter().map(ConsumerTask::stop_and_await)).await;
        }
        // Pending repartition passes belong to the previous incarnation.
        self.inner.current_shutdown().cancel();
        self.inner.reset_shutdown();
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner.start_locked(&mut state, config);
        self.inner.apply_locked(&mut state).await;
    }

    /// Restarts every consumer when the config actually changed.
    pub async fn update_config(&self, config: Arc<QueueConfig>) {
        let mut state = self.inner.state.lock().await;
        if state.config.as_deref() == Some(config.as_ref()) {
            debug!(queue = %self.inner.label, "Queue config unchanged, skipping restart");
            return;
        }
        if self.inner.stopped.load(Ordering::SeqCst) {
            state.config = Some(config);
            return;
        }

        info!(queue = %self.inner.label, "Queue config changed, restarting consumers");
        let tasks = state.drain_tasks();
        for task in &tasks {
            task.signal_stop();
        }
        join_all(tasks.into_iter().map(ConsumerTask::stop_and_await)).await;

        self.inner.start_locked(&mut state, config);
        self.inner.apply_locked(&mut state).await;
    }

    /// Records the new partition set and applies it, debounced in
    /// per-partition mode.
    pub async fn update_partitions(&self, partitions: HashSet<TopicPartitionInfo>) {
        self.inner.set_desired(partitions);
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let per_partition = {
            let state = self.inner.state.lock().await;
            match state.config.as_ref() {
                Some(config) => config.consumer_per_partition,
                None => return,
            }
        };

        if per_partition && !self.inner.settings.repartition_delay.is_zero() {
            self.schedule_repartition();
        } else {
            let mut state = self.inner.state.lock().await;
            self.inner.apply_locked(&mut state).await;
        }
    }

    fn schedule_repartition(&self) {
        if self.inner.repartition_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let shutdown = inner.current_shutdown();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    inner.repartition_scheduled.store(false, Ordering::SeqCst);
                }
                _ = tokio::time::sleep(inner.settings.repartition_delay) => {
                    inner.repartition_scheduled.store(false, Ordering::SeqCst);
                    let mut state = inner.state.lock().await;
                    inner.apply_locked(&mut state).await;
                }
            }
        });
    }

    /// Signals every consumer loop to exit without waiting.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.current_shutdown().cancel();
    }

    /// Waits for every consumer loop to exit and releases the consumers.
    pub async fn await_stop(&self) {
        let tasks = {
            let mut state = self.inner.state.lock().await;
            state.drain_tasks()
        };
        join_all(tasks.into_iter().map(ConsumerTask::stop_and_await)).await;
        self.inner.publish_gauges(0, 0);
        debug!(queue = %self.inner.label, "Queue consumers stopped");
    }

    /// Stops consumption and forgets the config.
    pub async fn delete(&self) {
        self.stop();
        self.await_stop().await;
        self.inner.state.lock().await.config = None;
        self.inner.set_desired(HashSet::new());
        info!(queue = %self.inner.label, "Queue consumers deleted");
    }

    /// Union of the partitions the live consumers are subscribed to.
    pub async fn subscribed_partitions(&self) -> HashSet<TopicPartitionInfo> {
        let state = self.inner.state.lock().await;
        state
            .main
            .iter()
            .chain(state.per_partition.values())
            .flat_map(|task| task.subscriptions())
            .collect()
    }

    pub async fn consumer_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        usize::from(state.main.is_some()) + state.per_partition.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl<T: Send + Sync + 'static> ManagerInner<T> {
    fn desired(&self) -> Arc<HashSet<TopicPartitionInfo>> {
        match self.desired.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    fn set_desired(&self, partitions: HashSet<TopicPartitionInfo>) {
        let partitions = Arc::new(partitions);
        match self.desired.write() {
            Ok(mut guard) => *guard = partitions,
            Err(poisoned) => *poisoned.into_inner() = partitions,
        }
    }

    fn current_shutdown(&self) -> CancellationToken {
        match self.shutdown.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn reset_shutdown(&self) {
        let fresh = CancellationToken::new();
        match self.shutdown.lock() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    fn new_task(
        &self,
        config: &QueueConfig,
        partition: Option<&TopicPartitionInfo>,
    ) -> Option<ConsumerTask<T>> {
        match self.factory.create(config, partition) {
            Ok(consumer) => Some(ConsumerTask::new(
                self.key.clone(),
                partition.cloned(),
                consumer,
                self.current_shutdown().child_token(),
            )),
            Err(e) => {
                error!(queue = %self.label, partition = ?partition, error = ?e, "Failed to create consumer");
                None
            }
        }
    }

    fn launch(&self, task: &mut ConsumerTask<T>, config: &Arc<QueueConfig>) {
        task.launch(
            Arc::clone(&self.processor),
            Arc::clone(config),
            self.settings.ready.clone(),
            Arc::clone(&self.settings.metrics),
        );
    }

    fn start_locked(&self, state: &mut ManagerState<T>, config: Arc<QueueConfig>) {
        if !config.consumer_per_partition {
            state.main = self.new_task(&config, None);
        }
        state.config = Some(config);
    }

    /// Brings the live consumers in line with the desired partition set.
    async fn apply_locked(&self, state: &mut ManagerState<T>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(config) = state.config.clone() else {
            return;
        };
        let desired = self.desired();

        if config.consumer_per_partition {
            let current: HashSet<TopicPartitionInfo> =
                state.per_partition.keys().cloned().collect();
            let removed: Vec<TopicPartitionInfo> =
                current.difference(&desired).cloned().collect();
            let added: Vec<TopicPartitionInfo> = desired.difference(&current).cloned().collect();
            if removed.is_empty() && added.is_empty() {
                return;
            }
            self.settings.metrics.increment(
                REPARTITION_PASSES_COUNTER,
                &[("queue", self.label.clone())],
                1,
            );
            info!(
                queue = %self.label,
                added = added.len(),
                removed = removed.len(),
                "Repartitioning per-partition consumers"
            );

            let stopping: Vec<ConsumerTask<T>> = removed
                .iter()
                .filter_map(|tpi| state.per_partition.remove(tpi))
                .collect();
            for task in &stopping {
                task.signal_stop();
            }
            join_all(stopping.into_iter().map(ConsumerTask::stop_and_await)).await;

            for tpi in added {
                let Some(mut task) = self.new_task(&config, Some(&tpi)) else {
                    continue;
                };
                if let Err(e) = task.subscribe(HashSet::from([tpi.clone()])) {
                    error!(queue = %self.label, partition = ?tpi, error = ?e, "Failed to subscribe consumer");
                    continue;
                }
                self.launch(&mut task, &config);
                state.per_partition.insert(tpi, task);
            }
        } else if let Some(main) = state.main.as_mut() {
            if main.subscriptions() != *desired {
                if let Err(e) = main.subscribe(desired.as_ref().clone()) {
                    error!(queue = %self.label, error = ?e, "Failed to subscribe consumer");
                    return;
                }
            }
            if !main.is_launched() && !desired.is_empty() {
                self.launch(main, &config);
            }
        }

        let consumers = usize::from(state.main.is_some()) + state.per_partition.len();
        self.publish_gauges(consumers, desired.len());
    }

    fn publish_gauges(&self, consumers: usize, partitions: usize) {
        let labels = [("queue", self.label.clone())];
        self.settings
            .metrics
            .gauge(CONSUMERS_ACTIVE_GAUGE, &labels, consumers as f64);
        self.settings
            .metrics
            .gauge(CONSUMER_PARTITIONS_GAUGE, &labels, partitions as f64);
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> ManagedQueue for QueueConsumerManager<T> {
    async fn create(&self, config: Arc<QueueConfig>) {
        self.init(config).await;
    }

    async fn update_config(&self, config: Arc<QueueConfig>) {
        QueueConsumerManager::update_config(self, config).await;
    }

    async fn update_partitions(&self, partitions: HashSet<TopicPartitionInfo>) {
        QueueConsumerManager::update_partitions(self, partitions).await;
    }

    async fn delete(&self) {
        QueueConsumerManager::delete(self).await;
    }

    async fn stop(&self) {
        QueueConsumerManager::stop(self);
        self.await_stop().await;
    }
}
