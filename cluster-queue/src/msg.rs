//! Queue message wrappers and the per-role envelopes carried on the wire.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discovery::{EntityId, EntityType, TenantId};
use crate::error::QueueResult;

/// A decoded message as handed to consumers: broker key, payload, headers.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMsg<T> {
    pub key: Uuid,
    pub value: T,
    pub headers: HashMap<String, String>,
}

impl<T> QueueMsg<T> {
    pub fn new(key: Uuid, value: T) -> Self {
        Self {
            key,
            value,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl<T: Serialize> QueueMsg<T> {
    pub fn encode(&self) -> QueueResult<EncodedMsg> {
        Ok(EncodedMsg {
            key: self.key,
            data: serde_json::to_vec(&self.value)?,
            headers: self.headers.clone(),
        })
    }
}

/// Wire form of a message, what producers send and brokers store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMsg {
    pub key: Uuid,
    pub data: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl EncodedMsg {
    pub fn decode<T: DeserializeOwned>(&self) -> QueueResult<QueueMsg<T>> {
        Ok(QueueMsg {
            key: self.key,
            value: serde_json::from_slice(&self.data)?,
            headers: self.headers.clone(),
        })
    }
}

/// Payload types that can travel through a queue.
pub trait QueuePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn tenant_id(&self) -> TenantId {
        TenantId::SYS
    }

    /// Entity the message is about, when it has one. Sequential submit
    /// strategies order messages per originator.
    fn originator(&self) -> Option<EntityId> {
        None
    }

    /// Variant name, used in logs and for unhandled-kind errors.
    fn kind(&self) -> &'static str;
}

/// Message flowing through rule chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TbMsg {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub msg_type: String,
    pub originator: EntityId,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub rule_chain_id: Option<Uuid>,
    #[serde(default)]
    pub rule_node_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TbMsg {
    pub fn new(tenant_id: TenantId, msg_type: impl Into<String>, originator: EntityId) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            msg_type: msg_type.into(),
            originator,
            queue_name: None,
            rule_chain_id: None,
            rule_node_id: None,
            metadata: HashMap::new(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToRuleEngineMsg {
    pub tenant_id: TenantId,
    pub tb_msg: Option<TbMsg>,
    #[serde(default)]
    pub relation_types: Vec<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl ToRuleEngineMsg {
    pub fn new(tb_msg: TbMsg) -> Self {
        Self {
            tenant_id: tb_msg.tenant_id,
            tb_msg: Some(tb_msg),
            relation_types: Vec::new(),
            failure_message: None,
        }
    }
}

impl QueuePayload for ToRuleEngineMsg {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn originator(&self) -> Option<EntityId> {
        self.tb_msg.as_ref().map(|m| m.originator)
    }

    fn kind(&self) -> &'static str {
        if self.tb_msg.is_some() {
            "tb_msg"
        } else {
            "empty"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToCoreMsg {
    ToDeviceActor {
        tenant_id: TenantId,
        device_id: Uuid,
        payload: serde_json::Value,
    },
    DeviceState {
        tenant_id: TenantId,
        device_id: Uuid,
        connected: bool,
    },
    DeviceActivity {
        tenant_id: TenantId,
        device_id: Uuid,
        last_activity_ts: i64,
    },
    EdgeNotification {
        tenant_id: TenantId,
        edge_id: Uuid,
        payload: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

impl QueuePayload for ToCoreMsg {
    fn tenant_id(&self) -> TenantId {
        match self {
            ToCoreMsg::ToDeviceActor { tenant_id, .. }
            | ToCoreMsg::DeviceState { tenant_id, .. }
            | ToCoreMsg::DeviceActivity { tenant_id, .. }
            | ToCoreMsg::EdgeNotification { tenant_id, .. } => *tenant_id,
            ToCoreMsg::Unknown => TenantId::SYS,
        }
    }

    fn originator(&self) -> Option<EntityId> {
        match self {
            ToCoreMsg::ToDeviceActor { device_id, .. }
            | ToCoreMsg::DeviceState { device_id, .. }
            | ToCoreMsg::DeviceActivity { device_id, .. } => Some(EntityId::device(*device_id)),
            ToCoreMsg::EdgeNotification { edge_id, .. } => {
                Some(EntityId::new(EntityType::Edge, *edge_id))
            }
            ToCoreMsg::Unknown => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ToCoreMsg::ToDeviceActor { .. } => "to_device_actor",
            ToCoreMsg::DeviceState { .. } => "device_state",
            ToCoreMsg::DeviceActivity { .. } => "device_activity",
            ToCoreMsg::EdgeNotification { .. } => "edge_notification",
            ToCoreMsg::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToCalculatedFieldMsg {
    Telemetry {
        tenant_id: TenantId,
        entity_id: EntityId,
        data: serde_json::Value,
    },
    LinkedTelemetry {
        tenant_id: TenantId,
        entity_id: EntityId,
        source_id: EntityId,
        data: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

impl QueuePayload for ToCalculatedFieldMsg {
    fn tenant_id(&self) -> TenantId {
        match self {
            ToCalculatedFieldMsg::Telemetry { tenant_id, .. }
            | ToCalculatedFieldMsg::LinkedTelemetry { tenant_id, .. } => *tenant_id,
            ToCalculatedFieldMsg::Unknown => TenantId::SYS,
        }
    }

    fn originator(&self) -> Option<EntityId> {
        match self {
            ToCalculatedFieldMsg::Telemetry { entity_id, .. }
            | ToCalculatedFieldMsg::LinkedTelemetry { entity_id, .. } => Some(*entity_id),
            ToCalculatedFieldMsg::Unknown => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ToCalculatedFieldMsg::Telemetry { .. } => "telemetry",
            ToCalculatedFieldMsg::LinkedTelemetry { .. } => "linked_telemetry",
            ToCalculatedFieldMsg::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToEdgeMsg {
    EdgeEvent {
        tenant_id: TenantId,
        edge_id: Uuid,
        payload: serde_json::Value,
    },
    EdgeNotification {
        tenant_id: TenantId,
        edge_id: Uuid,
        payload: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

impl QueuePayload for ToEdgeMsg {
    fn tenant_id(&self) -> TenantId {
        match self {
            ToEdgeMsg::EdgeEvent { tenant_id, .. } | ToEdgeMsg::EdgeNotification { tenant_id, .. } => {
                *tenant_id
            }
            ToEdgeMsg::Unknown => TenantId::SYS,
        }
    }

    fn originator(&self) -> Option<EntityId> {
        match self {
            ToEdgeMsg::EdgeEvent { edge_id, .. } | ToEdgeMsg::EdgeNotification { edge_id, .. } => {
                Some(EntityId::new(EntityType::Edge, *edge_id))
            }
            ToEdgeMsg::Unknown => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ToEdgeMsg::EdgeEvent { .. } => "edge_event",
            ToEdgeMsg::EdgeNotification { .. } => "edge_notification",
            ToEdgeMsg::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentLifecycleEvent {
    Created,
    Updated,
    Activated,
    Suspended,
    Deleted,
}

/// Control message delivered on a node's private notifications topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Notification<R> {
    QueueUpdate {
        tenant_id: TenantId,
        queue_name: String,
    },
    QueueDelete {
        tenant_id: TenantId,
        queue_name: String,
    },
    ComponentLifecycle {
        tenant_id: TenantId,
        entity_id: EntityId,
        event: ComponentLifecycleEvent,
    },
    /// Point-to-point message addressed to the role itself.
    Role(R),
    #[serde(other)]
    Unknown,
}

impl<R: QueuePayload> QueuePayload for Notification<R> {
    fn tenant_id(&self) -> TenantId {
        match self {
            Notification::QueueUpdate { tenant_id, .. }
            | Notification::QueueDelete { tenant_id, .. }
            | Notification::ComponentLifecycle { tenant_id, .. } => *tenant_id,
            Notification::Role(inner) => inner.tenant_id(),
            Notification::Unknown => TenantId::SYS,
        }
    }

    fn originator(&self) -> Option<EntityId> {
        match self {
            Notification::ComponentLifecycle { entity_id, .. } => Some(*entity_id),
            Notification::Role(inner) => inner.originator(),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Notification::QueueUpdate { .. } => "queue_update",
            Notification::QueueDelete { .. } => "queue_delete",
            Notification::ComponentLifecycle { .. } => "component_lifecycle",
            Notification::Role(inner) => inner.kind(),
            Notification::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_variant_decodes_to_unknown() {
        let msg: ToCoreMsg = serde_json::from_value(json!({"type": "ota_package"})).unwrap();
        assert_eq!(msg, ToCoreMsg::Unknown);
        assert_eq!(msg.kind(), "unknown");

        let notification: Notification<ToCoreMsg> =
            serde_json::from_value(json!({"type": "resource_cache_invalidate"})).unwrap();
        assert_eq!(notification, Notification::Unknown);
    }

    #[test]
    fn test_notification_wraps_role_message() {
        let tenant = TenantId::random();
        let device = Uuid::new_v4();
        let notification = Notification::Role(ToCoreMsg::DeviceState {
            tenant_id: tenant,
            device_id: device,
            connected: true,
        });
        let encoded = QueueMsg::new(Uuid::new_v4(), notification.clone())
            .encode()
            .unwrap();
        let decoded: QueueMsg<Notification<ToCoreMsg>> = encoded.decode().unwrap();
        assert_eq!(decoded.value, notification);
        assert_eq!(decoded.value.tenant_id(), tenant);
        assert_eq!(decoded.value.kind(), "device_state");
    }

    #[test]
    fn test_garbage_payload_is_serialization_error() {
        let encoded = EncodedMsg {
            key: Uuid::new_v4(),
            data: b"not json".to_vec(),
            headers: HashMap::new(),
        };
        let err = encoded.decode::<ToEdgeMsg>().unwrap_err();
        assert_eq!(err.kind(), "serialization");
    }

    #[test]
    fn test_rule_engine_msg_tenant() {
        let tenant = TenantId::random();
        let msg = ToRuleEngineMsg::new(TbMsg::new(
            tenant,
            "POST_TELEMETRY_REQUEST",
            EntityId::device(Uuid::new_v4()),
        ));
        assert_eq!(msg.tenant_id(), tenant);
        assert_eq!(msg.kind(), "tb_msg");
    }
}
