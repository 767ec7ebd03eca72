use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, Context};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handlers::{RoleHandler, RoleMsgHandler};
use crate::broker::ConsumerFactory;
use crate::config::Config;
use crate::consumer::{
    ConsumerManagerSettings, LifecycleTask, QueueConsumerManager, QueueLifecycleManager,
};
use crate::discovery::{
    PartitionChangeEvent, PartitionService, QueueConfig, QueueDirectory, QueueKey,
    QueueRoutingInfo, TenantId,
};
use crate::error::{QueueError, QueueResult};
use crate::metrics::{ConsumerStats, SharedMetrics};
use crate::metrics_const::{
    PARTITION_CHANGE_EVENTS_COUNTER, TENANT_QUEUES_CREATED_COUNTER,
    TENANT_QUEUES_REMOVED_COUNTER, UNHANDLED_MESSAGES_COUNTER,
};
use crate::msg::{Notification, QueueMsg};
use crate::pack::{DispatchPool, MsgCallback, MsgHandler, PackProcessor};

pub const NOTIFICATIONS_QUEUE_NAME: &str = "Notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Collaborators a consumer service is wired with.
pub struct ServiceDeps<H: RoleHandler> {
    pub config: Arc<Config>,
    pub handler: Arc<H>,
    pub partitions: Arc<dyn PartitionService>,
    pub queues: Arc<dyn QueueDirectory>,
    pub consumers: Arc<dyn ConsumerFactory<H::Msg>>,
    pub notifications: Arc<dyn ConsumerFactory<Notification<H::Notification>>>,
    pub metrics: SharedMetrics,
}

/// Consumer manager, lifecycle mailbox and stats of one queue.
pub struct QueueHandle<T: Send + 'static> {
    pub manager: QueueConsumerManager<T>,
    pub lifecycle: QueueLifecycleManager,
    pub stats: Arc<ConsumerStats>,
}

impl<T: Send + 'static> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            lifecycle: self.lifecycle.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

struct ServiceInner<H: RoleHandler> {
    config: Arc<Config>,
    handler: Arc<H>,
    partitions: Arc<dyn PartitionService>,
    queues: Arc<dyn QueueDirectory>,
    consumer_factory: Arc<dyn ConsumerFactory<H::Msg>>,
    notification_factory: Arc<dyn ConsumerFactory<Notification<H::Notification>>>,
    metrics: SharedMetrics,
    pool: DispatchPool,
    state: Mutex<ServiceState>,
    ready: watch::Sender<bool>,
    handles: DashMap<QueueKey, QueueHandle<H::Msg>>,
    notifications: AsyncMutex<Option<QueueConsumerManager<Notification<H::Notification>>>>,
    notification_stats: Arc<ConsumerStats>,
    background: AsyncMutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

/// Per-role consumer facade.
///
/// Owns one queue handle per `QueueKey` this node consumes plus a consumer
/// on the node's private notifications topic, and keeps both in line with
/// partition-change events and queue-directory notifications.
pub struct PartitionBasedConsumerService<H: RoleHandler> {
    inner: Arc<ServiceInner<H>>,
}

impl<H: RoleHandler> Clone for PartitionBasedConsumerService<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: RoleHandler> PartitionBasedConsumerService<H> {
    pub fn new(deps: ServiceDeps<H>) -> Self {
        let (ready, _) = watch::channel(false);
        let role = deps.handler.service_type();
        let notifications_key = QueueKey::new(role).with_queue_name(NOTIFICATIONS_QUEUE_NAME);
        Self {
            inner: Arc::new(ServiceInner {
                pool: DispatchPool::new(deps.config.dispatch_pool_size),
                config: deps.config,
                handler: deps.handler,
                partitions: deps.partitions,
                queues: deps.queues,
                consumer_factory: deps.consumers,
                notification_factory: deps.notifications,
                metrics: deps.metrics,
                state: Mutex::new(ServiceState::Stopped),
                ready,
                handles: DashMap::new(),
                notifications: AsyncMutex::new(None),
                notification_stats: Arc::new(ConsumerStats::new(notifications_key)),
                background: AsyncMutex::new(Vec::new()),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn queue_keys(&self) -> HashSet<QueueKey> {
        self.inner.handles.iter().map(|e| e.key().clone()).collect()
    }

    pub fn queue_handle(&self, key: &QueueKey) -> Option<QueueHandle<H::Msg>> {
        self.inner.handles.get(key).map(|h| h.clone())
    }

    /// STOPPED -> STARTING -> RUNNING.
    pub async fn start(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        inner.transition(ServiceState::Stopped, ServiceState::Starting)?;
        let role = inner.handler.service_type();
        info!(role = role.label(), "Starting consumer service");

        if let Err(e) = inner.start_components().await {
            error!(role = role.label(), error = ?e, "Failed to start consumer service");
            if let Err(stop_err) = inner.stop_components().await {
                warn!(role = role.label(), error = ?stop_err, "Failed to release consumers after start failure");
            }
            inner.set_state(ServiceState::Stopped);
            return Err(e);
        }

        inner.set_state(ServiceState::Running);
        inner.ready.send_replace(true);
        info!(role = role.label(), "Consumer service is running");
        Ok(())
    }

    /// RUNNING -> STOPPING -> STOPPED. Waits for every consumer loop to
    /// exit, bounded by the configured shutdown timeout.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.lock_state();
            match *state {
                ServiceState::Stopped | ServiceState::Stopping => return Ok(()),
                ServiceState::Starting => bail!("service is still starting"),
                ServiceState::Running => *state = ServiceState::Stopping,
            }
        }
        let role = inner.handler.service_type();
        info!(role = role.label(), "Stopping consumer service");
        let result = inner.stop_components().await;
        inner.set_state(ServiceState::Stopped);
        if result.is_ok() {
            info!(role = role.label(), "Consumer service stopped");
        }
        result
    }

    /// Applies a partition-change event; normally driven by the internal
    /// subscription, exposed for callers that deliver events themselves.
    pub async fn on_partition_change(&self, event: PartitionChangeEvent) {
        self.inner.on_partition_change(event).await;
    }

    pub async fn on_queue_update(&self, tenant_id: TenantId, queue_name: &str) -> anyhow::Result<()> {
        self.inner.on_queue_update(tenant_id, queue_name).await
    }

    pub async fn on_queue_delete(&self, tenant_id: TenantId, queue_name: &str) {
        self.inner.on_queue_delete(tenant_id, queue_name);
    }

    /// Logs and publishes the interval stats of every queue, then resets them.
    pub fn flush_stats(&self) {
        self.inner.flush_stats();
    }
}

impl<H: RoleHandler> ServiceInner<H> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ServiceState {
        *self.lock_state()
    }

    fn set_state(&self, next: ServiceState) {
        *self.lock_state() = next;
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> anyhow::Result<()> {
        let mut state = self.lock_state();
        if *state != from {
            bail!("cannot move consumer service from {:?} to {:?}", *state, to);
        }
        *state = to;
        Ok(())
    }

    /// Signals every consumer loop and background task, then waits for them,
    /// bounded by the shutdown timeout.
    async fn stop_components(&self) -> anyhow::Result<()> {
        self.ready.send_replace(false);
        self.current_shutdown().cancel();

        let handles: Vec<QueueHandle<H::Msg>> =
            self.handles.iter().map(|e| e.value().clone()).collect();
        self.handles.clear();
        let notifications = self.notifications.lock().await.take();
        // Settle queued lifecycle tasks first so a late CREATE cannot restart
        // a manager after it was stopped.
        join_all(handles.iter().map(|h| h.lifecycle.drain_now())).await;
        for handle in &handles {
            handle.manager.stop();
        }
        if let Some(manager) = &notifications {
            manager.stop();
        }

        let background: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        let drain = async {
            join_all(handles.iter().map(|h| h.manager.await_stop())).await;
            if let Some(manager) = &notifications {
                manager.await_stop().await;
            }
            join_all(background).await;
        };
        let timeout = self.config.shutdown_timeout();
        if tokio::time::timeout(timeout, drain).await.is_err() {
            bail!("consumers of {} did not stop within {timeout:?}", self.label());
        }
        Ok(())
    }

    fn current_shutdown(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn label(&self) -> &'static str {
        self.handler.service_type().label()
    }

    fn settings(&self) -> ConsumerManagerSettings {
        ConsumerManagerSettings {
            repartition_delay: self.config.repartition_delay(),
            ready: self.ready.subscribe(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    async fn start_components(self: &Arc<Self>) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = shutdown.clone();

        self.handler
            .on_start_up()
            .await
            .with_context(|| format!("start-up hook of {} failed", self.label()))?;

        self.start_notifications().await;

        // Subscribe before reading the current assignment so no event falls
        // between the two.
        let events = self.partitions.subscribe();

        let configs = self.load_queues().await?;
        self.partitions
            .update_queues(configs.iter().map(|c| QueueRoutingInfo::from(c.as_ref())).collect());
        for config in configs {
            let key = config.key();
            let handle = self.create_queue(config);
            if let Some(partitions) = self.partitions.my_partitions(&key) {
                handle
                    .lifecycle
                    .submit(LifecycleTask::UpdatePartitions(partitions));
            }
        }

        let mut background = self.background.lock().await;
        background.push(tokio::spawn(listen_partition_changes(
            Arc::clone(self),
            events,
            shutdown.clone(),
        )));
        if self.config.stats_enabled {
            background.push(tokio::spawn(flush_stats_periodically(
                Arc::clone(self),
                shutdown,
            )));
        }
        Ok(())
    }

    async fn start_notifications(self: &Arc<Self>) {
        let role = self.handler.service_type();
        let tpi = self
            .partitions
            .notifications_topic(role, &self.partitions.service_id());
        let (_, pack_timeout) = self.config.role_timings(role);

        let mut config = QueueConfig::new(role, NOTIFICATIONS_QUEUE_NAME, tpi.topic.clone());
        config.partitions = 1;
        config.poll_interval = self.config.notifications_poll_interval();
        config.pack_processing_timeout = pack_timeout;
        let key = QueueKey::new(role).with_queue_name(NOTIFICATIONS_QUEUE_NAME);

        let processor = PackProcessor::new(
            key.clone(),
            Arc::new(NotificationMsgHandler {
                service: Arc::downgrade(self),
            }),
            self.pool.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&self.notification_stats),
        );
        let manager = QueueConsumerManager::new(
            key,
            Arc::clone(&self.notification_factory),
            Arc::new(processor),
            self.settings(),
        );
        manager.update_partitions(HashSet::from([tpi])).await;
        manager.init(Arc::new(config)).await;
        *self.notifications.lock().await = Some(manager);
    }

    async fn load_queues(&self) -> anyhow::Result<Vec<Arc<QueueConfig>>> {
        let role = self.handler.service_type();
        if !self.handler.uses_queue_directory() {
            return Ok(vec![Arc::new(self.config.main_queue(role))]);
        }
        let queues = self
            .queues
            .find_all_queues()
            .await
            .context("Failed to load queue configurations")?;
        Ok(queues
            .into_iter()
            .filter(|q| q.service_type == role)
            .collect())
    }

    async fn fetch_config(&self, key: &QueueKey) -> anyhow::Result<Option<Arc<QueueConfig>>> {
        let role = self.handler.service_type();
        if !self.handler.uses_queue_directory() {
            let main = self.config.main_queue(role);
            return Ok((main.key() == *key).then(|| Arc::new(main)));
        }
        let tenant_id = key.tenant_id.unwrap_or(TenantId::SYS);
        self.queues
            .find_queue_by_tenant_and_name(tenant_id, &key.queue_name)
            .await
            .with_context(|| format!("Failed to fetch queue configuration for {key}"))
    }

    fn new_handle(&self, key: &QueueKey) -> QueueHandle<H::Msg> {
        let stats = Arc::new(ConsumerStats::new(key.clone()));
        let processor = PackProcessor::new(
            key.clone(),
            Arc::new(RoleMsgHandler::new(Arc::clone(&self.handler))),
            self.pool.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&stats),
        );
        let manager = QueueConsumerManager::new(
            key.clone(),
            Arc::clone(&self.consumer_factory),
            Arc::new(processor),
            self.settings(),
        );
        let lifecycle = QueueLifecycleManager::new(
            key,
            Arc::new(manager.clone()),
            self.config.lifecycle_retry_backoff(),
            Arc::clone(&self.metrics),
        );
        QueueHandle {
            manager,
            lifecycle,
            stats,
        }
    }

    /// Returns the existing handle for the config's key, or registers a new
    /// one and submits its CREATE task.
    fn create_queue(&self, config: Arc<QueueConfig>) -> QueueHandle<H::Msg> {
        let key = config.key();
        if let Some(existing) = self.handles.get(&key) {
            return existing.clone();
        }
        let handle = self.new_handle(&key);
        match self.handles.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                info!(queue = %key, "Creating queue consumer");
                handle.lifecycle.submit(LifecycleTask::Create(config));
                if key.is_tenant_scoped() {
                    self.metrics.increment(
                        TENANT_QUEUES_CREATED_COUNTER,
                        &[("role", self.label().to_string())],
                        1,
                    );
                }
                slot.insert(handle.clone());
                handle
            }
        }
    }

    fn remove_queue(&self, key: &QueueKey) {
        if let Some((_, handle)) = self.handles.remove(key) {
            info!(queue = %key, "Removing queue consumer");
            handle.lifecycle.submit(LifecycleTask::Delete);
            if key.is_tenant_scoped() {
                self.metrics.increment(
                    TENANT_QUEUES_REMOVED_COUNTER,
                    &[("role", self.label().to_string())],
                    1,
                );
            }
        }
    }

    async fn on_partition_change(&self, event: PartitionChangeEvent) {
        if event.service_type != self.handler.service_type() {
            return;
        }
        self.metrics.increment(
            PARTITION_CHANGE_EVENTS_COUNTER,
            &[("role", self.label().to_string())],
            1,
        );

        for (key, partitions) in event.partitions {
            let existing = self.handles.get(&key).map(|h| h.clone());
            if let Some(handle) = existing {
                handle
                    .lifecycle
                    .submit(LifecycleTask::UpdatePartitions(partitions));
                continue;
            }
            if partitions.is_empty() {
                debug!(queue = %key, "No partitions assigned to unknown queue, nothing to create");
                continue;
            }
            match self.fetch_config(&key).await {
                Ok(Some(config)) => {
                    let handle = self.create_queue(config);
                    handle
                        .lifecycle
                        .submit(LifecycleTask::UpdatePartitions(partitions));
                }
                Ok(None) => {
                    let err = QueueError::ConfigurationMissing(key.clone());
                    error!(queue = %key, partitions = ?partitions, error = %err, "Partitions assigned to an unknown queue");
                }
                Err(e) => {
                    error!(queue = %key, error = ?e, "Failed to create queue consumer");
                }
            }
        }

        let stale: Vec<QueueKey> = self
            .handles
            .iter()
            .filter(|e| {
                e.key()
                    .tenant_id
                    .is_some_and(|t| !self.partitions.is_managed_by_current_service(t))
            })
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            info!(queue = %key, "Tenant is no longer served by this node");
            self.remove_queue(&key);
        }
    }

    async fn on_queue_update(&self, tenant_id: TenantId, queue_name: &str) -> anyhow::Result<()> {
        let Some(config) = self
            .queues
            .find_queue_by_tenant_and_name(tenant_id, queue_name)
            .await
            .with_context(|| format!("Failed to fetch queue {queue_name} of tenant {tenant_id}"))?
        else {
            warn!(%tenant_id, queue_name, "Updated queue not found in the directory");
            return Ok(());
        };
        if config.service_type != self.handler.service_type() {
            return Ok(());
        }

        let key = config.key();
        info!(queue = %key, "Received queue update");
        self.partitions
            .update_queues(vec![QueueRoutingInfo::from(config.as_ref())]);

        let existing = self.handles.get(&key).map(|h| h.clone());
        match existing {
            Some(handle) => {
                handle
                    .lifecycle
                    .submit(LifecycleTask::UpdateConfig(config));
            }
            None => {
                let handle = self.create_queue(config);
                if let Some(partitions) = self.partitions.my_partitions(&key) {
                    handle
                        .lifecycle
                        .submit(LifecycleTask::UpdatePartitions(partitions));
                }
            }
        }
        Ok(())
    }

    fn on_queue_delete(&self, tenant_id: TenantId, queue_name: &str) {
        let key = QueueKey::new(self.handler.service_type())
            .with_queue_name(queue_name)
            .with_tenant(tenant_id);
        info!(queue = %key, "Received queue delete");
        self.partitions.remove_queues(vec![key.clone()]);
        self.remove_queue(&key);
    }

    fn flush_stats(&self) {
        for handle in self.handles.iter() {
            handle.stats.flush(self.metrics.as_ref());
        }
        self.notification_stats.flush(self.metrics.as_ref());
    }
}

async fn listen_partition_changes<H: RoleHandler>(
    service: Arc<ServiceInner<H>>,
    mut events: tokio::sync::broadcast::Receiver<PartitionChangeEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => received,
        };
        match received {
            Ok(event) => service.on_partition_change(event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(role = service.label(), skipped, "Partition change events lagged, resyncing");
                let partitions = service
                    .handles
                    .iter()
                    .map(|e| {
                        let key = e.key().clone();
                        let owned = service.partitions.my_partitions(&key).unwrap_or_default();
                        (key, owned)
                    })
                    .collect();
                service
                    .on_partition_change(PartitionChangeEvent {
                        service_type: service.handler.service_type(),
                        partitions,
                    })
                    .await;
            }
            Err(RecvError::Closed) => {
                debug!(role = service.label(), "Partition change channel closed");
                break;
            }
        }
    }
}

async fn flush_stats_periodically<H: RoleHandler>(
    service: Arc<ServiceInner<H>>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(service.config.stats_print_interval());
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => service.flush_stats(),
        }
    }
}

/// Handles messages from the node's notifications topic.
struct NotificationMsgHandler<H: RoleHandler> {
    service: Weak<ServiceInner<H>>,
}

#[async_trait]
impl<H: RoleHandler> MsgHandler<Notification<H::Notification>> for NotificationMsgHandler<H> {
    async fn handle(
        &self,
        msg: Arc<QueueMsg<Notification<H::Notification>>>,
        callback: Arc<dyn MsgCallback>,
        _cancel: CancellationToken,
    ) -> QueueResult<()> {
        let Some(service) = self.service.upgrade() else {
            return Err(QueueError::ConsumerStopped);
        };
        match &msg.value {
            Notification::QueueUpdate {
                tenant_id,
                queue_name,
            } => {
                service
                    .on_queue_update(*tenant_id, queue_name)
                    .await
                    .map_err(|e| QueueError::handler(format!("{e:#}")))?;
                callback.on_success();
                Ok(())
            }
            Notification::QueueDelete {
                tenant_id,
                queue_name,
            } => {
                service.on_queue_delete(*tenant_id, queue_name);
                callback.on_success();
                Ok(())
            }
            Notification::ComponentLifecycle {
                tenant_id,
                entity_id,
                event,
            } => {
                service
                    .handler
                    .on_component_lifecycle(*tenant_id, *entity_id, *event, callback)
                    .await
            }
            Notification::Role(inner) => {
                service
                    .handler
                    .handle_notification(inner.clone(), callback)
                    .await
            }
            Notification::Unknown => {
                service.metrics.increment(
                    UNHANDLED_MESSAGES_COUNTER,
                    &[
                        ("role", service.label().to_string()),
                        ("kind", "notification".to_string()),
                    ],
                    1,
                );
                Err(QueueError::UnhandledMessageKind("unknown notification".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueConsumer;
    use crate::discovery::{
        HashPartitionService, InMemoryQueueDirectory, MockQueueDirectory, ServiceInfo,
        ServiceType, TopicService,
    };
    use crate::metrics::InMemoryMetricsSink;
    use crate::discovery::EntityId;
    use crate::msg::{TbMsg, ToRuleEngineMsg};
    use crate::pack::PackProcessingContext;
    use crate::service::{ActorMsg, MockActorSystem, RuleEngineHandler};
    use crate::test_utils::{eventually, RecordingConsumerFactory};
    use envconfig::Envconfig;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config() -> Arc<Config> {
        let mut config = Config::init_from_hashmap(&HashMap::from([
            ("SERVICE_ID".to_string(), "node-a".to_string()),
            ("REPARTITION_DELAY_MS".to_string(), "0".to_string()),
            ("LIFECYCLE_RETRY_BACKOFF_MS".to_string(), "5".to_string()),
            ("SHUTDOWN_TIMEOUT_SECS".to_string(), "5".to_string()),
        ]))
        .unwrap();
        config.stats_enabled = false;
        Arc::new(config)
    }

    struct Fixture {
        service: PartitionBasedConsumerService<RuleEngineHandler>,
        partitions: Arc<HashPartitionService>,
        directory: Arc<InMemoryQueueDirectory>,
        consumers: Arc<RecordingConsumerFactory<ToRuleEngineMsg>>,
    }

    fn fixture(queues: Arc<dyn QueueDirectory>, directory: Arc<InMemoryQueueDirectory>) -> Fixture {
        fixture_with_actors(queues, directory, MockActorSystem::new())
    }

    fn fixture_with_actors(
        queues: Arc<dyn QueueDirectory>,
        directory: Arc<InMemoryQueueDirectory>,
        actors: MockActorSystem,
    ) -> Fixture {
        let config = test_config();
        let partitions = Arc::new(HashPartitionService::new(
            ServiceInfo::new("node-a", &[ServiceType::RuleEngine]),
            TopicService::new(""),
        ));
        let consumers = Arc::new(RecordingConsumerFactory::new());
        let service = PartitionBasedConsumerService::new(ServiceDeps {
            config,
            handler: Arc::new(RuleEngineHandler::new(
                Arc::new(actors),
                Arc::new(InMemoryMetricsSink::new()),
            )),
            partitions: partitions.clone(),
            queues,
            consumers: consumers.clone(),
            notifications: Arc::new(RecordingConsumerFactory::new()),
            metrics: Arc::new(InMemoryMetricsSink::new()),
        });
        Fixture {
            service,
            partitions,
            directory,
            consumers,
        }
    }

    fn default_fixture() -> Fixture {
        let directory = Arc::new(InMemoryQueueDirectory::new());
        fixture(directory.clone(), directory)
    }

    #[tokio::test]
    async fn test_start_and_stop_walk_the_state_machine() {
        let f = default_fixture();
        f.directory.upsert(QueueConfig::new(
            ServiceType::RuleEngine,
            "Main",
            "tb_rule_engine.main",
        ));
        assert_eq!(f.service.state(), ServiceState::Stopped);

        f.service.start().await.unwrap();
        assert_eq!(f.service.state(), ServiceState::Running);
        assert!(f.service.is_ready());
        assert!(f.service.start().await.is_err());

        f.service.stop().await.unwrap();
        assert_eq!(f.service.state(), ServiceState::Stopped);
        assert!(!f.service.is_ready());
        assert!(f.service.queue_keys().is_empty());
    }

    #[tokio::test]
    async fn test_partition_change_drives_main_queue() {
        let f = default_fixture();
        f.directory.upsert(QueueConfig::new(
            ServiceType::RuleEngine,
            "Main",
            "tb_rule_engine.main",
        ));
        f.service.start().await.unwrap();
        f.partitions.recalculate_partitions(vec![]);

        let key = QueueKey::new(ServiceType::RuleEngine);
        let handle = f.service.queue_handle(&key).unwrap();
        assert!(
            eventually(Duration::from_secs(2), || {
                f.consumers
                    .consumers()
                    .first()
                    .is_some_and(|c| c.subscriptions().len() == 10)
            })
            .await
        );
        assert!(!handle.lifecycle.is_deleted());

        f.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_assignment_for_unknown_queue_creates_nothing() {
        let mut queues = MockQueueDirectory::new();
        queues.expect_find_all_queues().returning(|| Ok(vec![]));
        queues.expect_find_queue_by_tenant_and_name().never();
        let f = fixture(Arc::new(queues), Arc::new(InMemoryQueueDirectory::new()));
        f.service.start().await.unwrap();

        let key = QueueKey::new(ServiceType::RuleEngine).with_queue_name("HighPriority");
        f.service
            .on_partition_change(PartitionChangeEvent {
                service_type: ServiceType::RuleEngine,
                partitions: HashMap::from([(key, HashSet::new())]),
            })
            .await;

        assert!(f.service.queue_keys().is_empty());
        assert_eq!(f.consumers.created(), 0);
        f.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_notifications_create_and_delete_tenant_queue() {
        let f = default_fixture();
        f.service.start().await.unwrap();
        f.partitions.recalculate_partitions(vec![]);

        let tenant = TenantId::random();
        let mut isolated = QueueConfig::new(ServiceType::RuleEngine, "Main", "tb_rule_engine.tenant");
        isolated.tenant_id = tenant;
        isolated.isolated = true;
        isolated.partitions = 2;
        f.directory.upsert(isolated.clone());

        f.service.on_queue_update(tenant, "Main").await.unwrap();
        let key = isolated.key();
        assert!(f.service.queue_keys().contains(&key));

        f.directory.remove(tenant, "Main");
        f.service.on_queue_delete(tenant, "Main").await;
        assert!(!f.service.queue_keys().contains(&key));

        f.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_role_notification_reaches_the_handler() {
        let mut actors = MockActorSystem::new();
        actors
            .expect_tell()
            .withf(|msg, _| matches!(msg, ActorMsg::RuleEngine { msg, .. } if msg.msg_type == "RPC_CALL"))
            .times(1)
            .returning(|_, callback| callback.on_success());
        let directory = Arc::new(InMemoryQueueDirectory::new());
        let f = fixture_with_actors(directory.clone(), directory, actors);
        let handler = NotificationMsgHandler {
            service: Arc::downgrade(&f.service.inner),
        };

        let tb_msg = TbMsg::new(
            TenantId::SYS,
            "RPC_CALL",
            EntityId::device(uuid::Uuid::from_u128(3)),
        );
        let msg = QueueMsg::new(
            uuid::Uuid::new_v4(),
            Notification::Role(ToRuleEngineMsg::new(tb_msg)),
        );
        let ctx = Arc::new(PackProcessingContext::new(
            "notifications",
            [(uuid::Uuid::new_v4(), Arc::new(msg.clone()))],
            CancellationToken::new(),
        ));
        let id = *ctx.pending_ids().iter().next().unwrap();

        handler
            .handle(Arc::new(msg), ctx.callback(id), CancellationToken::new())
            .await
            .unwrap();
        assert!(ctx.is_complete());
        assert_eq!(ctx.succeeded_ids().len(), 1);
    }
}
