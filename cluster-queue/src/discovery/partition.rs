use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::hash::{jump_consistent_hash, stable_hash};
use super::ids::{EntityId, ServiceId, ServiceType, TenantId};
use super::queue::QueueConfig;
use super::topic::TopicService;
use super::tpi::{QueueKey, TopicPartitionInfo, MAIN_QUEUE_NAME};
use crate::error::{QueueError, QueueResult};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A cluster member as seen by the partition directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service_id: ServiceId,
    pub service_types: HashSet<ServiceType>,
    /// Tenants this node is dedicated to. Empty means a generic node.
    pub assigned_tenants: HashSet<TenantId>,
}

impl ServiceInfo {
    pub fn new(service_id: impl Into<ServiceId>, service_types: &[ServiceType]) -> Self {
        Self {
            service_id: service_id.into(),
            service_types: service_types.iter().copied().collect(),
            assigned_tenants: HashSet::new(),
        }
    }

    pub fn with_assigned_tenant(mut self, tenant_id: TenantId) -> Self {
        self.assigned_tenants.insert(tenant_id);
        self
    }

    fn is_generic(&self) -> bool {
        self.assigned_tenants.is_empty()
    }
}

/// The full set of topic-partitions this node now owns for one role,
/// keyed by queue. Keys that lost every partition map to an empty set.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionChangeEvent {
    pub service_type: ServiceType,
    pub partitions: HashMap<QueueKey, HashSet<TopicPartitionInfo>>,
}

impl PartitionChangeEvent {
    pub fn partitions_for(&self, key: &QueueKey) -> HashSet<TopicPartitionInfo> {
        self.partitions.get(key).cloned().unwrap_or_default()
    }
}

/// What the directory needs to know about a queue to route to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRoutingInfo {
    pub key: QueueKey,
    pub topic: String,
    pub partitions: i32,
}

impl From<&QueueConfig> for QueueRoutingInfo {
    fn from(config: &QueueConfig) -> Self {
        Self {
            key: config.key(),
            topic: config.topic.clone(),
            partitions: config.partitions,
        }
    }
}

/// Cluster membership and partition ownership directory.
pub trait PartitionService: Send + Sync {
    fn service_id(&self) -> ServiceId;

    /// Deterministic (role, tenant, entity) to topic-partition resolution.
    /// Unknown queue names fall back to the role's main queue.
    fn resolve(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: &EntityId,
    ) -> QueueResult<TopicPartitionInfo>;

    /// Every partition of the queue a message would be resolved to.
    fn resolve_all(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
    ) -> QueueResult<Vec<TopicPartitionInfo>>;

    fn all_service_ids(&self, service_type: ServiceType) -> HashSet<ServiceId>;

    fn is_managed_by_current_service(&self, tenant_id: TenantId) -> bool;

    fn my_partitions(&self, key: &QueueKey) -> Option<HashSet<TopicPartitionInfo>>;

    fn notifications_topic(&self, service_type: ServiceType, service_id: &str)
        -> TopicPartitionInfo;

    fn update_queues(&self, queues: Vec<QueueRoutingInfo>);

    fn remove_queues(&self, keys: Vec<QueueKey>);

    /// Recomputes ownership against the given peers and emits a
    /// [`PartitionChangeEvent`] for every role whose assignment changed.
    fn recalculate_partitions(&self, others: Vec<ServiceInfo>);

    fn subscribe(&self) -> broadcast::Receiver<PartitionChangeEvent>;
}

#[derive(Default)]
struct DirectoryState {
    queues: HashMap<QueueKey, QueueRoutingInfo>,
    others: Vec<ServiceInfo>,
    my_partitions: HashMap<QueueKey, HashSet<TopicPartitionInfo>>,
    initialized: bool,
}

/// Partition directory that assigns partitions to nodes with jump
/// consistent hashing over the sorted list of responsible nodes.
pub struct HashPartitionService {
    current: ServiceInfo,
    topics: TopicService,
    state: RwLock<DirectoryState>,
    events: broadcast::Sender<PartitionChangeEvent>,
}

impl HashPartitionService {
    pub fn new(current: ServiceInfo, topics: TopicService) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            current,
            topics,
            state: RwLock::new(DirectoryState::default()),
            events,
        }
    }

    pub fn topics(&self) -> &TopicService {
        &self.topics
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve_key(
        state: &DirectoryState,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
    ) -> QueueResult<QueueKey> {
        let mut names = vec![queue_name];
        if queue_name != MAIN_QUEUE_NAME {
            names.push(MAIN_QUEUE_NAME);
        }
        for name in names {
            let unscoped = QueueKey::new(service_type).with_queue_name(name);
            let isolated = unscoped.clone().with_tenant(tenant_id);
            if state.queues.contains_key(&isolated) {
                return Ok(isolated);
            }
            if state.queues.contains_key(&unscoped) {
                return Ok(unscoped);
            }
        }
        Err(QueueError::ConfigurationMissing(
            QueueKey::new(service_type)
                .with_queue_name(queue_name)
                .with_tenant(tenant_id),
        ))
    }

    fn tpi(&self, state: &DirectoryState, info: &QueueRoutingInfo, partition: i32) -> TopicPartitionInfo {
        let mine = state
            .my_partitions
            .get(&info.key)
            .is_some_and(|set| set.iter().any(|t| t.partition == Some(partition)));
        TopicPartitionInfo::new(
            self.topics.build_topic_name(&info.topic),
            info.key.tenant_id,
            Some(partition),
            mine,
        )
    }

    /// Nodes eligible to own partitions of `key`, sorted by id so every node
    /// computes the same ordering.
    fn responsible_services<'a>(
        all: &'a [&'a ServiceInfo],
        key: &QueueKey,
    ) -> Vec<&'a ServiceInfo> {
        let of_type: Vec<&ServiceInfo> = all
            .iter()
            .copied()
            .filter(|s| s.service_types.contains(&key.service_type))
            .collect();

        let preferred: Vec<&ServiceInfo> = match key.tenant_id {
            Some(tenant) => of_type
                .iter()
                .copied()
                .filter(|s| s.assigned_tenants.contains(&tenant))
                .collect(),
            None => of_type.iter().copied().filter(|s| s.is_generic()).collect(),
        };

        let mut responsible = if preferred.is_empty() { of_type } else { preferred };
        responsible.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        responsible
    }

    fn assign(&self, state: &DirectoryState) -> HashMap<QueueKey, HashSet<TopicPartitionInfo>> {
        let mut all: Vec<&ServiceInfo> = state.others.iter().collect();
        all.push(&self.current);

        let mut assigned: HashMap<QueueKey, HashSet<TopicPartitionInfo>> = HashMap::new();
        for (key, info) in &state.queues {
            if !self.current.service_types.contains(&key.service_type) {
                continue;
            }
            let responsible = Self::responsible_services(&all, key);
            if responsible.is_empty() {
                continue;
            }
            let owned = assigned.entry(key.clone()).or_default();
            for partition in 0..info.partitions.max(1) {
                let slot = jump_consistent_hash(
                    stable_hash(&format!("{key}:{partition}")),
                    responsible.len(),
                );
                if responsible[slot].service_id == self.current.service_id {
                    owned.insert(TopicPartitionInfo::new(
                        self.topics.build_topic_name(&info.topic),
                        key.tenant_id,
                        Some(partition),
                        true,
                    ));
                }
            }
        }
        assigned
    }

    fn rebuild(&self, state: &mut DirectoryState) -> Vec<PartitionChangeEvent> {
        let assigned = self.assign(state);
        let previous = std::mem::replace(&mut state.my_partitions, assigned);
        let first = !state.initialized;
        state.initialized = true;

        let mut events = Vec::new();
        for service_type in ServiceType::ALL {
            if !self.current.service_types.contains(&service_type) {
                continue;
            }
            let keys: HashSet<&QueueKey> = previous
                .keys()
                .chain(state.my_partitions.keys())
                .filter(|k| k.service_type == service_type)
                .collect();
            let changed = first
                || keys
                    .iter()
                    .any(|k| previous.get(*k) != state.my_partitions.get(*k));
            if !changed {
                continue;
            }
            let partitions = keys
                .into_iter()
                .map(|k| {
                    (
                        k.clone(),
                        state.my_partitions.get(k).cloned().unwrap_or_default(),
                    )
                })
                .collect();
            events.push(PartitionChangeEvent {
                service_type,
                partitions,
            });
        }
        events
    }

    fn publish(&self, events: Vec<PartitionChangeEvent>) {
        for event in events {
            info!(
                service_type = %event.service_type,
                queues = event.partitions.len(),
                "Partition assignment changed"
            );
            if self.events.send(event).is_err() {
                debug!("No subscribers for partition change event");
            }
        }
    }
}

impl PartitionService for HashPartitionService {
    fn service_id(&self) -> ServiceId {
        self.current.service_id.clone()
    }

    fn resolve(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: &EntityId,
    ) -> QueueResult<TopicPartitionInfo> {
        let state = self.read();
        let key = Self::resolve_key(&state, service_type, queue_name, tenant_id)?;
        let info = state
            .queues
            .get(&key)
            .ok_or_else(|| QueueError::ConfigurationMissing(key.clone()))?;
        let partitions = u64::try_from(info.partitions.max(1)).unwrap_or(1);
        let partition = i32::try_from(entity_id.partition_hash() % partitions).unwrap_or(0);
        Ok(self.tpi(&state, info, partition))
    }

    fn resolve_all(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
    ) -> QueueResult<Vec<TopicPartitionInfo>> {
        let state = self.read();
        let key = Self::resolve_key(&state, service_type, queue_name, tenant_id)?;
        let info = state
            .queues
            .get(&key)
            .ok_or_else(|| QueueError::ConfigurationMissing(key.clone()))?;
        Ok((0..info.partitions.max(1))
            .map(|p| self.tpi(&state, info, p))
            .collect())
    }

    fn all_service_ids(&self, service_type: ServiceType) -> HashSet<ServiceId> {
        let state = self.read();
        state
            .others
            .iter()
            .chain(std::iter::once(&self.current))
            .filter(|s| s.service_types.contains(&service_type))
            .map(|s| s.service_id.clone())
            .collect()
    }

    fn is_managed_by_current_service(&self, tenant_id: TenantId) -> bool {
        let state = self.read();
        let isolated = state
            .queues
            .keys()
            .any(|k| k.tenant_id == Some(tenant_id));
        if !isolated {
            return self.current.is_generic() || self.current.assigned_tenants.contains(&tenant_id);
        }
        let dedicated: Vec<&ServiceInfo> = state
            .others
            .iter()
            .chain(std::iter::once(&self.current))
            .filter(|s| s.assigned_tenants.contains(&tenant_id))
            .collect();
        dedicated.is_empty()
            || dedicated
                .iter()
                .any(|s| s.service_id == self.current.service_id)
    }

    fn my_partitions(&self, key: &QueueKey) -> Option<HashSet<TopicPartitionInfo>> {
        self.read().my_partitions.get(key).cloned()
    }

    fn notifications_topic(
        &self,
        service_type: ServiceType,
        service_id: &str,
    ) -> TopicPartitionInfo {
        self.topics.notifications_topic(service_type, service_id)
    }

    fn update_queues(&self, queues: Vec<QueueRoutingInfo>) {
        let events = {
            let mut state = self.write();
            for queue in queues {
                debug!(queue = %queue.key, partitions = queue.partitions, "Updating queue routing");
                state.queues.insert(queue.key.clone(), queue);
            }
            if state.initialized {
                self.rebuild(&mut state)
            } else {
                Vec::new()
            }
        };
        self.publish(events);
    }

    fn remove_queues(&self, keys: Vec<QueueKey>) {
        let events = {
            let mut state = self.write();
            for key in keys {
                debug!(queue = %key, "Removing queue routing");
                state.queues.remove(&key);
            }
            if state.initialized {
                self.rebuild(&mut state)
            } else {
                Vec::new()
            }
        };
        self.publish(events);
    }

    fn recalculate_partitions(&self, others: Vec<ServiceInfo>) {
        let events = {
            let mut state = self.write();
            state.others = others
                .into_iter()
                .filter(|s| s.service_id != self.current.service_id)
                .collect();
            self.rebuild(&mut state)
        };
        self.publish(events);
    }

    fn subscribe(&self) -> broadcast::Receiver<PartitionChangeEvent> {
        self.events.subscribe()
    }
}
