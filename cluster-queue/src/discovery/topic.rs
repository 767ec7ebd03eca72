use super::ids::{ServiceType, TenantId};
use super::tpi::TopicPartitionInfo;

/// Builds physical topic names and consumer group ids.
#[derive(Debug, Clone, Default)]
pub struct TopicService {
    prefix: String,
}

impl TopicService {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Applies the deployment prefix, if any, to a topic name.
    pub fn build_topic_name(&self, topic: &str) -> String {
        if self.prefix.is_empty() {
            topic.to_string()
        } else {
            format!("{}.{}", self.prefix, topic)
        }
    }

    /// Private topic a single node of `service_type` listens on for
    /// point-to-point and broadcast control messages.
    pub fn notifications_topic(
        &self,
        service_type: ServiceType,
        service_id: &str,
    ) -> TopicPartitionInfo {
        TopicPartitionInfo::singleton(self.build_topic_name(&format!(
            "{}.notifications.{}",
            service_type.topic_base(),
            service_id
        )))
    }

    pub fn edge_notifications_topic(&self, tenant_id: TenantId, edge_id: &str) -> TopicPartitionInfo {
        TopicPartitionInfo::singleton(self.build_topic_name(&format!(
            "tb_edge_event.notifications.{tenant_id}.{edge_id}"
        )))
    }

    /// `prefix + [tenant-] + queue + [-partition]`
    pub fn build_consumer_group_id(
        &self,
        service_prefix: &str,
        tenant_id: Option<TenantId>,
        queue_name: &str,
        partition: Option<i32>,
    ) -> String {
        let mut group_id = self.build_topic_name(service_prefix);
        if let Some(tenant) = tenant_id.filter(|t| !t.is_sys()) {
            group_id.push_str(&format!("{tenant}-"));
        }
        group_id.push_str(queue_name);
        if let Some(partition) = partition {
            group_id.push_str(&format!("-{partition}"));
        }
        group_id
    }
}
