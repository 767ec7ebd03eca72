use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use super::callback::{MultipleMsgCallback, QueueCallback};
use super::profile::ProfileCache;
use super::retry::RetryPolicy;
use crate::broker::{QueueProducer, SendMetadata};
use crate::config::Config;
use crate::discovery::{
    EntityId, EntityType, PartitionService, QueueDirectory, ServiceId, ServiceType, TenantId,
    TopicPartitionInfo, TopicService, MAIN_QUEUE_NAME,
};
use crate::error::{QueueError, QueueResult};
use crate::metrics::SharedMetrics;
use crate::metrics_const::{
    ROUTER_BROADCASTS_COUNTER, ROUTER_EDGE_RETRIES_COUNTER, ROUTER_PROFILE_MISSES_COUNTER,
    ROUTER_SENDS_COUNTER,
};
use crate::msg::{EncodedMsg, QueueMsg, QueuePayload, TbMsg, ToEdgeMsg, ToRuleEngineMsg};

/// Producers per destination role, plus the one used for notification topics.
#[derive(Clone, Default)]
pub struct ProducerProvider {
    roles: HashMap<ServiceType, Arc<dyn QueueProducer>>,
    notifications: Option<Arc<dyn QueueProducer>>,
}

impl ProducerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// One producer for every role and for notifications.
    pub fn shared(producer: Arc<dyn QueueProducer>) -> Self {
        let roles = ServiceType::ALL
            .into_iter()
            .map(|role| (role, Arc::clone(&producer)))
            .collect();
        Self {
            roles,
            notifications: Some(producer),
        }
    }

    pub fn with_role(mut self, role: ServiceType, producer: Arc<dyn QueueProducer>) -> Self {
        self.roles.insert(role, producer);
        self
    }

    pub fn with_notifications(mut self, producer: Arc<dyn QueueProducer>) -> Self {
        self.notifications = Some(producer);
        self
    }

    pub fn role(&self, role: ServiceType) -> QueueResult<&Arc<dyn QueueProducer>> {
        self.roles
            .get(&role)
            .ok_or_else(|| QueueError::ProducerNotConfigured(role.label().to_string()))
    }

    pub fn notifications(&self) -> QueueResult<&Arc<dyn QueueProducer>> {
        self.notifications
            .as_ref()
            .ok_or_else(|| QueueError::ProducerNotConfigured("notifications".to_string()))
    }
}

fn complete(callback: Option<&Arc<dyn QueueCallback>>, result: &QueueResult<SendMetadata>) {
    let Some(callback) = callback else {
        return;
    };
    match result {
        Ok(metadata) => callback.on_success(Some(metadata.clone())),
        Err(e) => callback.on_failure(e.clone()),
    }
}

/// Resolves logical destinations to topic-partitions and sends through the
/// role's producer.
pub struct ClusterRouter {
    partitions: Arc<dyn PartitionService>,
    topics: TopicService,
    producers: ProducerProvider,
    queues: Arc<dyn QueueDirectory>,
    profiles: Arc<dyn ProfileCache>,
    edge_retry: RetryPolicy,
    metrics: SharedMetrics,
}

impl ClusterRouter {
    pub fn new(
        partitions: Arc<dyn PartitionService>,
        topics: TopicService,
        producers: ProducerProvider,
        queues: Arc<dyn QueueDirectory>,
        profiles: Arc<dyn ProfileCache>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            partitions,
            topics,
            producers,
            queues,
            profiles,
            edge_retry: RetryPolicy::default(),
            metrics,
        }
    }

    /// Router whose topic prefix and edge retry policy come from `config`.
    pub fn from_config(
        config: &Config,
        partitions: Arc<dyn PartitionService>,
        producers: ProducerProvider,
        queues: Arc<dyn QueueDirectory>,
        profiles: Arc<dyn ProfileCache>,
        metrics: SharedMetrics,
    ) -> Self {
        Self::new(
            partitions,
            config.topic_service(),
            producers,
            queues,
            profiles,
            metrics,
        )
        .with_edge_retry(Self::edge_retry_policy(config))
    }

    pub fn with_edge_retry(mut self, policy: RetryPolicy) -> Self {
        self.edge_retry = policy;
        self
    }

    /// Edge-notification retry policy from the service configuration.
    pub fn edge_retry_policy(config: &Config) -> RetryPolicy {
        RetryPolicy::build(2, config.edge_notification_retry_backoff())
            .maximum_interval(config.edge_notification_retry_backoff().saturating_mul(10))
            .max_retries(config.edge_notification_max_retries)
            .provide()
    }

    async fn send_encoded(
        &self,
        producer: &dyn QueueProducer,
        role: ServiceType,
        tpi: &TopicPartitionInfo,
        msg: EncodedMsg,
    ) -> QueueResult<SendMetadata> {
        let result = producer.send(tpi, msg).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.metrics.increment(
            ROUTER_SENDS_COUNTER,
            &[
                ("role", role.label().to_string()),
                ("outcome", outcome.to_string()),
            ],
            1,
        );
        if let Err(e) = &result {
            warn!(topic = %tpi, error = %e, "Failed to send message");
        }
        result
    }

    /// Sends `msg` to the partition of `role`'s queue that owns `entity_id`.
    /// All messages of one entity land on the same partition.
    pub async fn send_to_role<T: QueuePayload>(
        &self,
        role: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: &EntityId,
        msg: &QueueMsg<T>,
        callback: Option<Arc<dyn QueueCallback>>,
    ) -> QueueResult<SendMetadata> {
        let result = self
            .send_to_role_inner(role, queue_name, tenant_id, entity_id, msg)
            .await;
        complete(callback.as_ref(), &result);
        result
    }

    async fn send_to_role_inner<T: QueuePayload>(
        &self,
        role: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: &EntityId,
        msg: &QueueMsg<T>,
    ) -> QueueResult<SendMetadata> {
        let tpi = self
            .partitions
            .resolve(role, queue_name, tenant_id, entity_id)?;
        let producer = self.producers.role(role)?;
        let encoded = msg.encode()?;
        debug!(topic = %tpi, entity = %entity_id, "Routing message");
        self.send_encoded(producer.as_ref(), role, &tpi, encoded)
            .await
    }

    /// Sends one copy of `msg` to the notifications topic of a single node.
    pub async fn send_to_service<T: QueuePayload>(
        &self,
        role: ServiceType,
        service_id: &str,
        msg: &QueueMsg<T>,
        callback: Option<Arc<dyn QueueCallback>>,
    ) -> QueueResult<SendMetadata> {
        let result = self.send_to_service_inner(role, service_id, msg).await;
        complete(callback.as_ref(), &result);
        result
    }

    async fn send_to_service_inner<T: QueuePayload>(
        &self,
        role: ServiceType,
        service_id: &str,
        msg: &QueueMsg<T>,
    ) -> QueueResult<SendMetadata> {
        let producer = self.producers.notifications()?;
        let tpi = self.partitions.notifications_topic(role, service_id);
        let encoded = msg.encode()?;
        self.send_encoded(producer.as_ref(), role, &tpi, encoded)
            .await
    }

    /// Sends one copy of `msg` to every live node of `role`. The callback
    /// fires once: success after every send succeeded, or the first failure.
    /// A failed peer does not stop delivery to the others.
    pub async fn broadcast<T: QueuePayload>(
        &self,
        role: ServiceType,
        msg: &QueueMsg<T>,
        callback: Option<Arc<dyn QueueCallback>>,
    ) -> QueueResult<Vec<(ServiceId, QueueResult<SendMetadata>)>> {
        let prepared = self
            .producers
            .notifications()
            .and_then(|producer| Ok((producer, msg.encode()?)));
        let (producer, encoded) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Some(callback) = &callback {
                    callback.on_failure(e.clone());
                }
                return Err(e);
            }
        };

        let mut peers: Vec<ServiceId> = self.partitions.all_service_ids(role).into_iter().collect();
        peers.sort();
        self.metrics.increment(
            ROUTER_BROADCASTS_COUNTER,
            &[("role", role.label().to_string())],
            1,
        );
        debug!(role = role.label(), peers = peers.len(), "Broadcasting message");

        let aggregate = callback.map(|inner| -> Arc<dyn QueueCallback> {
            Arc::new(MultipleMsgCallback::new(peers.len(), inner))
        });

        let sends = peers.into_iter().map(|service_id| {
            let producer = Arc::clone(producer);
            let encoded = encoded.clone();
            let aggregate = aggregate.clone();
            async move {
                let tpi = self.partitions.notifications_topic(role, &service_id);
                let result = self
                    .send_encoded(producer.as_ref(), role, &tpi, encoded)
                    .await;
                complete(aggregate.as_ref(), &result);
                (service_id, result)
            }
        });
        Ok(join_all(sends).await)
    }

    /// Pushes a rule-engine message, applying the originator's profile
    /// routing first. Profile lookups are best effort: a miss or an error
    /// routes the message unchanged.
    pub async fn push_msg_to_rule_engine(
        &self,
        tenant_id: TenantId,
        entity_id: &EntityId,
        tb_msg: TbMsg,
        callback: Option<Arc<dyn QueueCallback>>,
    ) -> QueueResult<()> {
        let tb_msg = self.apply_profile(tenant_id, entity_id, tb_msg);
        let queue_name = tb_msg
            .queue_name
            .clone()
            .unwrap_or_else(|| MAIN_QUEUE_NAME.to_string());
        let msg = QueueMsg::new(tb_msg.id, ToRuleEngineMsg::new(tb_msg));

        if !self.duplicate_to_all_partitions(tenant_id, &queue_name).await {
            return self
                .send_to_role(
                    ServiceType::RuleEngine,
                    &queue_name,
                    tenant_id,
                    entity_id,
                    &msg,
                    callback,
                )
                .await
                .map(|_| ());
        }

        let prepared = self
            .partitions
            .resolve_all(ServiceType::RuleEngine, &queue_name, tenant_id)
            .and_then(|tpis| Ok((tpis, self.producers.role(ServiceType::RuleEngine)?, msg.encode()?)));
        let (tpis, producer, encoded) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Some(callback) = &callback {
                    callback.on_failure(e.clone());
                }
                return Err(e);
            }
        };
        debug!(queue = %queue_name, partitions = tpis.len(), "Duplicating message to all partitions");

        let aggregate = callback.map(|inner| -> Arc<dyn QueueCallback> {
            Arc::new(MultipleMsgCallback::new(tpis.len(), inner))
        });
        let results = join_all(tpis.iter().map(|tpi| {
            let encoded = encoded.clone();
            let aggregate = aggregate.clone();
            async move {
                let result = self
                    .send_encoded(producer.as_ref(), ServiceType::RuleEngine, tpi, encoded)
                    .await;
                complete(aggregate.as_ref(), &result);
                result
            }
        }))
        .await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    fn apply_profile(&self, tenant_id: TenantId, entity_id: &EntityId, mut tb_msg: TbMsg) -> TbMsg {
        if tb_msg.rule_chain_id.is_some()
            || !matches!(entity_id.entity_type, EntityType::Device | EntityType::Asset)
        {
            return tb_msg;
        }
        match self.profiles.rule_engine_profile(tenant_id, entity_id) {
            Ok(Some(profile)) => {
                if let Some(rule_chain_id) = profile.rule_chain_id {
                    tb_msg.rule_chain_id = Some(rule_chain_id);
                }
                if let Some(queue_name) = profile.queue_name {
                    tb_msg.queue_name = Some(queue_name);
                }
            }
            Ok(None) => {
                self.metrics.increment(
                    ROUTER_PROFILE_MISSES_COUNTER,
                    &[("reason", "miss".to_string())],
                    1,
                );
            }
            Err(e) => {
                warn!(entity = %entity_id, error = ?e, "Failed to read profile, routing message unchanged");
                self.metrics.increment(
                    ROUTER_PROFILE_MISSES_COUNTER,
                    &[("reason", "error".to_string())],
                    1,
                );
            }
        }
        tb_msg
    }

    async fn duplicate_to_all_partitions(&self, tenant_id: TenantId, queue_name: &str) -> bool {
        let mut tenants = vec![tenant_id];
        if !tenant_id.is_sys() {
            tenants.push(TenantId::SYS);
        }
        for tenant in tenants {
            match self
                .queues
                .find_queue_by_tenant_and_name(tenant, queue_name)
                .await
            {
                Ok(Some(queue)) => return queue.duplicate_msg_to_all_partitions,
                Ok(None) => continue,
                Err(e) => {
                    warn!(queue = queue_name, error = ?e, "Failed to look up queue configuration");
                    return false;
                }
            }
        }
        false
    }

    /// Sends to an edge's notification topic, retrying failed sends with the
    /// edge retry policy before reporting failure.
    pub async fn send_to_edge_notification(
        &self,
        tenant_id: TenantId,
        edge_id: Uuid,
        msg: &QueueMsg<ToEdgeMsg>,
        callback: Option<Arc<dyn QueueCallback>>,
    ) -> QueueResult<SendMetadata> {
        let result = self
            .send_to_edge_notification_inner(tenant_id, edge_id, msg)
            .await;
        complete(callback.as_ref(), &result);
        result
    }

    async fn send_to_edge_notification_inner(
        &self,
        tenant_id: TenantId,
        edge_id: Uuid,
        msg: &QueueMsg<ToEdgeMsg>,
    ) -> QueueResult<SendMetadata> {
        let producer = self.producers.notifications()?;
        let tpi = self
            .topics
            .edge_notifications_topic(tenant_id, &edge_id.to_string());
        let encoded = msg.encode()?;

        let mut attempt = 0;
        loop {
            match self
                .send_encoded(producer.as_ref(), ServiceType::Edge, &tpi, encoded.clone())
                .await
            {
                Ok(metadata) => return Ok(metadata),
                Err(e) => {
                    attempt += 1;
                    if !self.edge_retry.should_retry(attempt) {
                        warn!(topic = %tpi, attempts = attempt, error = %e, "Giving up on edge notification");
                        return Err(e);
                    }
                    self.metrics.increment(
                        ROUTER_EDGE_RETRIES_COUNTER,
                        &[("edge", edge_id.to_string())],
                        1,
                    );
                    tokio::time::sleep(self.edge_retry.retry_interval(attempt)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{
        HashPartitionService, InMemoryQueueDirectory, QueueConfig, QueueRoutingInfo, ServiceInfo,
    };
    use crate::metrics::InMemoryMetricsSink;
    use crate::router::profile::{InMemoryProfileCache, MockProfileCache, RuleEngineProfile};
    use crate::test_utils::RecordingProducer;
    use envconfig::Envconfig;
    use rstest::{fixture, rstest};
    use std::time::Duration;

    struct Harness {
        router: ClusterRouter,
        producer: Arc<RecordingProducer>,
        directory: Arc<InMemoryQueueDirectory>,
        profiles: Arc<InMemoryProfileCache>,
        metrics: Arc<InMemoryMetricsSink>,
    }

    #[fixture]
    fn harness() -> Harness {
        let partitions = Arc::new(HashPartitionService::new(
            ServiceInfo::new("node-a", &[ServiceType::RuleEngine, ServiceType::Core]),
            TopicService::default(),
        ));
        let directory = Arc::new(InMemoryQueueDirectory::new());
        let main = directory.upsert(QueueConfig::new(
            ServiceType::RuleEngine,
            "Main",
            "tb_rule_engine.main",
        ));
        let mut hp = QueueConfig::new(ServiceType::RuleEngine, "HighPriority", "tb_rule_engine.hp");
        hp.partitions = 3;
        hp.duplicate_msg_to_all_partitions = true;
        let hp = directory.upsert(hp);
        partitions.update_queues(vec![
            QueueRoutingInfo::from(main.as_ref()),
            QueueRoutingInfo::from(hp.as_ref()),
        ]);
        partitions.recalculate_partitions(vec![
            ServiceInfo::new("node-b", &[ServiceType::RuleEngine]),
            ServiceInfo::new("node-c", &[ServiceType::RuleEngine]),
        ]);

        let producer = Arc::new(RecordingProducer::new());
        let profiles = Arc::new(InMemoryProfileCache::new());
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let router = ClusterRouter::new(
            partitions,
            TopicService::default(),
            ProducerProvider::shared(producer.clone()),
            directory.clone(),
            profiles.clone(),
            metrics.clone(),
        )
        .with_edge_retry(
            RetryPolicy::build(1, Duration::from_millis(10))
                .max_retries(2)
                .provide(),
        );
        Harness {
            router,
            producer,
            directory,
            profiles,
            metrics,
        }
    }

    fn device() -> EntityId {
        EntityId::device(Uuid::from_u128(42))
    }

    fn tb_msg(tenant_id: TenantId) -> TbMsg {
        TbMsg::new(tenant_id, "POST_TELEMETRY_REQUEST", device())
    }

    #[rstest]
    #[tokio::test]
    async fn test_same_entity_lands_on_same_partition(harness: Harness) {
        let msg = QueueMsg::new(Uuid::new_v4(), ToRuleEngineMsg::new(tb_msg(TenantId::SYS)));
        let first = harness
            .router
            .send_to_role(ServiceType::RuleEngine, "Main", TenantId::SYS, &device(), &msg, None)
            .await
            .unwrap();
        let second = harness
            .router
            .send_to_role(ServiceType::RuleEngine, "Main", TenantId::SYS, &device(), &msg, None)
            .await
            .unwrap();
        assert_eq!(first.topic, second.topic);
        assert!(first.topic.starts_with("tb_rule_engine.main."));
    }

    #[rstest]
    #[tokio::test]
    async fn test_broadcast_reaches_every_peer(harness: Harness) {
        let mut callback = crate::router::MockQueueCallback::new();
        callback.expect_on_success().times(1).return_const(());
        callback.expect_on_failure().never();

        let msg = QueueMsg::new(Uuid::new_v4(), ToRuleEngineMsg::new(tb_msg(TenantId::SYS)));
        let results = harness
            .router
            .broadcast(ServiceType::RuleEngine, &msg, Some(Arc::new(callback)))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(
            harness.producer.sent_topics(),
            vec![
                "tb_rule_engine.notifications.node-a",
                "tb_rule_engine.notifications.node-b",
                "tb_rule_engine.notifications.node-c",
            ]
        );
        assert_eq!(harness.metrics.counter(ROUTER_BROADCASTS_COUNTER), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_profile_redirects_queue(harness: Harness) {
        let tenant = TenantId::SYS;
        harness.profiles.insert(
            tenant,
            device(),
            RuleEngineProfile {
                queue_name: Some("HighPriority".to_string()),
                rule_chain_id: Some(Uuid::from_u128(5)),
            },
        );

        harness
            .router
            .push_msg_to_rule_engine(tenant, &device(), tb_msg(tenant), None)
            .await
            .unwrap();

        // HighPriority duplicates to all of its partitions.
        let sent = harness.producer.sent();
        assert_eq!(sent.len(), 3);
        let decoded = sent[0].1.decode::<ToRuleEngineMsg>().unwrap();
        let routed = decoded.value.tb_msg.unwrap();
        assert_eq!(routed.queue_name.as_deref(), Some("HighPriority"));
        assert_eq!(routed.rule_chain_id, Some(Uuid::from_u128(5)));
    }

    #[rstest]
    #[tokio::test]
    async fn test_profile_error_routes_unchanged(harness: Harness) {
        let h = harness;
        let mut profiles = MockProfileCache::new();
        profiles
            .expect_rule_engine_profile()
            .returning(|_, _| Err(anyhow::anyhow!("corrupted profile")));
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let router = ClusterRouter::new(
            h.router.partitions.clone(),
            TopicService::default(),
            ProducerProvider::shared(h.producer.clone()),
            h.directory.clone(),
            Arc::new(profiles),
            metrics.clone(),
        );

        router
            .push_msg_to_rule_engine(TenantId::SYS, &device(), tb_msg(TenantId::SYS), None)
            .await
            .unwrap();

        let sent = h.producer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.full_topic_name.starts_with("tb_rule_engine.main."));
        assert_eq!(metrics.counter_with(ROUTER_PROFILE_MISSES_COUNTER, "reason", "error"), 1);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_edge_notification_retries_then_succeeds(harness: Harness) {
        harness.producer.fail_next(2);
        let msg = QueueMsg::new(
            Uuid::new_v4(),
            ToEdgeMsg::EdgeNotification {
                tenant_id: TenantId::SYS,
                edge_id: Uuid::from_u128(8),
                payload: serde_json::json!({"action": "sync"}),
            },
        );

        let metadata = harness
            .router
            .send_to_edge_notification(TenantId::SYS, Uuid::from_u128(8), &msg, None)
            .await
            .unwrap();

        assert!(metadata.topic.starts_with("tb_edge_event.notifications."));
        assert_eq!(harness.metrics.counter(ROUTER_EDGE_RETRIES_COUNTER), 2);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_edge_notification_gives_up_after_budget(harness: Harness) {
        harness.producer.fail_next(5);
        let mut callback = crate::router::MockQueueCallback::new();
        callback
            .expect_on_failure()
            .withf(|e| matches!(e, QueueError::TransientSendFailure { .. }))
            .times(1)
            .return_const(());
        let msg = QueueMsg::new(
            Uuid::new_v4(),
            ToEdgeMsg::EdgeEvent {
                tenant_id: TenantId::SYS,
                edge_id: Uuid::from_u128(8),
                payload: serde_json::Value::Null,
            },
        );

        let result = harness
            .router
            .send_to_edge_notification(
                TenantId::SYS,
                Uuid::from_u128(8),
                &msg,
                Some(Arc::new(callback)),
            )
            .await;

        assert!(result.is_err());
        assert!(harness.producer.sent().is_empty());
    }

    #[test]
    fn test_router_from_config_takes_edge_retry_policy() {
        let config = Config::init_from_hashmap(&HashMap::from([
            ("EDGE_NOTIFICATION_MAX_RETRIES".to_string(), "5".to_string()),
            ("EDGE_NOTIFICATION_RETRY_BACKOFF_MS".to_string(), "20".to_string()),
        ]))
        .unwrap();
        let router = ClusterRouter::from_config(
            &config,
            Arc::new(HashPartitionService::new(
                ServiceInfo::new("node-a", &[ServiceType::Core]),
                TopicService::default(),
            )),
            ProducerProvider::new(),
            Arc::new(InMemoryQueueDirectory::new()),
            Arc::new(InMemoryProfileCache::new()),
            Arc::new(InMemoryMetricsSink::new()),
        );

        let policy = &router.edge_retry;
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.retry_interval(1), Duration::from_millis(20));
        assert_eq!(policy.retry_interval(5), Duration::from_millis(200));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn test_edge_retry_policy_follows_config() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        let policy = ClusterRouter::edge_retry_policy(&config);
        assert_eq!(policy.max_retries, config.edge_notification_max_retries);
        assert_eq!(policy.retry_interval(1), config.edge_notification_retry_backoff());
        assert!(!policy.should_retry(config.edge_notification_max_retries + 1));
    }

    #[rstest]
    #[tokio::test]
    async fn test_missing_queue_configuration(harness: Harness) {
        let msg = QueueMsg::new(Uuid::new_v4(), ToRuleEngineMsg::new(tb_msg(TenantId::SYS)));
        let err = harness
            .router
            .send_to_role(ServiceType::Edge, "Main", TenantId::SYS, &device(), &msg, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ConfigurationMissing(_)));
    }
}
