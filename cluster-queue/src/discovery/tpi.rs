use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{ServiceType, TenantId};

pub const MAIN_QUEUE_NAME: &str = "Main";

/// Logical identifier of a queue: role + name + optional tenant scope.
///
/// Role-scoped queues carry no tenant; isolated rule-engine queues carry the
/// owning tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub service_type: ServiceType,
    pub queue_name: String,
    pub tenant_id: Option<TenantId>,
}

impl QueueKey {
    /// Main queue of a role.
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            queue_name: MAIN_QUEUE_NAME.to_string(),
            tenant_id: None,
        }
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Scope the key to a tenant. The system tenant maps to an unscoped key.
    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = if tenant_id.is_sys() {
            None
        } else {
            Some(tenant_id)
        };
        self
    }

    pub fn is_tenant_scoped(&self) -> bool {
        self.tenant_id.is_some()
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant_id {
            Some(tenant) => write!(f, "{}:{}:{}", self.service_type, self.queue_name, tenant),
            None => write!(f, "{}:{}", self.service_type, self.queue_name),
        }
    }
}

/// A physical subscription unit: topic + optional partition + optional tenant.
///
/// `full_topic_name` is what gets handed to the broker; partitioned topics are
/// laid out as one broker topic per partition, named `<topic>.<partition>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartitionInfo {
    pub topic: String,
    pub tenant_id: Option<TenantId>,
    pub partition: Option<i32>,
    pub my_partition: bool,
    pub full_topic_name: String,
}

impl TopicPartitionInfo {
    pub fn new(
        topic: impl Into<String>,
        tenant_id: Option<TenantId>,
        partition: Option<i32>,
        my_partition: bool,
    ) -> Self {
        let topic = topic.into();
        let full_topic_name = match partition {
            Some(p) => format!("{topic}.{p}"),
            None => topic.clone(),
        };
        Self {
            topic,
            tenant_id,
            partition,
            my_partition,
            full_topic_name,
        }
    }

    /// Unpartitioned topic, such as a per-service notifications topic.
    pub fn singleton(topic: impl Into<String>) -> Self {
        Self::new(topic, None, None, true)
    }

    pub fn with_my_partition(mut self, my_partition: bool) -> Self {
        self.my_partition = my_partition;
        self
    }
}

impl fmt::Display for TopicPartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_topic_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_topic_name_includes_partition() {
        let tpi = TopicPartitionInfo::new("tb_rule_engine.main", None, Some(3), true);
        assert_eq!(tpi.full_topic_name, "tb_rule_engine.main.3");

        let single = TopicPartitionInfo::singleton("tb_core.notifications.node-1");
        assert_eq!(single.full_topic_name, "tb_core.notifications.node-1");
        assert_eq!(single.partition, None);
    }

    #[test]
    fn test_sys_tenant_key_is_unscoped() {
        let key = QueueKey::new(ServiceType::RuleEngine).with_tenant(TenantId::SYS);
        assert!(!key.is_tenant_scoped());
        assert_eq!(key, QueueKey::new(ServiceType::RuleEngine));
    }

    #[test]
    fn test_queue_key_display() {
        let tenant = TenantId::random();
        let key = QueueKey::new(ServiceType::RuleEngine)
            .with_queue_name("HighPriority")
            .with_tenant(tenant);
        assert_eq!(key.to_string(), format!("rule_engine:HighPriority:{tenant}"));
        assert_eq!(QueueKey::new(ServiceType::Core).to_string(), "core:Main");
    }
}
