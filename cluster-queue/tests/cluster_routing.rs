use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cluster_queue::broker::SendMetadata;
use cluster_queue::discovery::{
    EntityId, HashPartitionService, InMemoryQueueDirectory, PartitionService, QueueConfig,
    QueueRoutingInfo, ServiceInfo, ServiceType, TenantId, TopicService,
};
use cluster_queue::error::QueueError;
use cluster_queue::metrics::InMemoryMetricsSink;
use cluster_queue::metrics_const::ROUTER_SENDS_COUNTER;
use cluster_queue::msg::{Notification, QueueMsg, TbMsg, ToCoreMsg};
use cluster_queue::router::{ClusterRouter, InMemoryProfileCache, ProducerProvider, QueueCallback};
use cluster_queue::test_utils::{init_test_tracing, RecordingProducer};
use uuid::Uuid;

#[derive(Default)]
struct CountingCallback {
    successes: AtomicUsize,
    failures: Mutex<Vec<QueueError>>,
}

impl CountingCallback {
    fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

impl QueueCallback for CountingCallback {
    fn on_success(&self, _metadata: Option<SendMetadata>) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, error: QueueError) {
        self.failures.lock().unwrap().push(error);
    }
}

fn router(producer: Arc<RecordingProducer>, metrics: Arc<InMemoryMetricsSink>) -> ClusterRouter {
    init_test_tracing();
    let partitions = Arc::new(HashPartitionService::new(
        ServiceInfo::new("core-1", &[ServiceType::Core]),
        TopicService::default(),
    ));
    let directory = Arc::new(InMemoryQueueDirectory::new());
    let main = directory.upsert(QueueConfig::new(ServiceType::Core, "Main", "tb_core"));
    partitions.update_queues(vec![QueueRoutingInfo::from(main.as_ref())]);
    partitions.recalculate_partitions(vec![
        ServiceInfo::new("core-2", &[ServiceType::Core]),
        ServiceInfo::new("core-3", &[ServiceType::Core]),
        ServiceInfo::new("re-1", &[ServiceType::RuleEngine]),
    ]);

    ClusterRouter::new(
        partitions,
        TopicService::default(),
        ProducerProvider::new()
            .with_role(ServiceType::Core, producer.clone())
            .with_notifications(producer),
        directory,
        Arc::new(InMemoryProfileCache::new()),
        metrics,
    )
}

fn notification() -> QueueMsg<Notification<ToCoreMsg>> {
    QueueMsg::new(
        Uuid::new_v4(),
        Notification::QueueUpdate {
            tenant_id: TenantId::SYS,
            queue_name: "Main".to_string(),
        },
    )
}

#[tokio::test]
async fn test_broadcast_succeeds_once_all_peers_acknowledge() {
    let producer = Arc::new(RecordingProducer::new());
    let metrics = Arc::new(InMemoryMetricsSink::new());
    let router = router(producer.clone(), metrics.clone());
    let callback = Arc::new(CountingCallback::default());

    let results = router
        .broadcast(ServiceType::Core, &notification(), Some(callback.clone()))
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(callback.successes(), 1);
    assert!(callback.failures().is_empty());
    assert_eq!(metrics.counter_with(ROUTER_SENDS_COUNTER, "outcome", "success"), 3);
}

#[tokio::test]
async fn test_broadcast_with_one_failed_peer_fails_once() {
    let producer = Arc::new(RecordingProducer::new());
    producer.fail_topic("tb_core.notifications.core-2");
    let router = router(producer.clone(), Arc::new(InMemoryMetricsSink::new()));
    let callback = Arc::new(CountingCallback::default());

    let results = router
        .broadcast(ServiceType::Core, &notification(), Some(callback.clone()))
        .await
        .unwrap();

    assert_eq!(callback.successes(), 0);
    assert_eq!(
        callback.failures(),
        vec!["failed to send message to tb_core.notifications.core-2: broker unavailable"]
    );
    // The healthy peers still received their copy.
    assert_eq!(
        producer.sent_topics(),
        vec!["tb_core.notifications.core-1", "tb_core.notifications.core-3"]
    );
    let failed: Vec<&str> = results
        .iter()
        .filter(|(_, r)| r.is_err())
        .map(|(id, _)| id.as_str())
        .collect();
    assert_eq!(failed, vec!["core-2"]);
}

#[tokio::test]
async fn test_point_to_point_notification_targets_one_node() {
    let producer = Arc::new(RecordingProducer::new());
    let router = router(producer.clone(), Arc::new(InMemoryMetricsSink::new()));
    let callback = Arc::new(CountingCallback::default());

    let metadata = router
        .send_to_service(ServiceType::Core, "core-3", &notification(), Some(callback.clone()))
        .await
        .unwrap();

    assert_eq!(metadata.topic, "tb_core.notifications.core-3");
    assert_eq!(callback.successes(), 1);
}

#[tokio::test]
async fn test_rule_engine_push_without_queue_fails_the_callback() {
    let producer = Arc::new(RecordingProducer::new());
    let router = router(producer.clone(), Arc::new(InMemoryMetricsSink::new()));
    let callback = Arc::new(CountingCallback::default());
    let device = EntityId::device(Uuid::from_u128(1));

    let err = router
        .push_msg_to_rule_engine(
            TenantId::SYS,
            &device,
            TbMsg::new(TenantId::SYS, "ATTRIBUTES_UPDATED", device),
            Some(callback.clone()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::ConfigurationMissing(_)));
    assert_eq!(callback.failures().len(), 1);
    assert!(producer.sent().is_empty());
}
