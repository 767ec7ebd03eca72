use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::discovery::{EntityId, ServiceType, TenantId};
use crate::error::{QueueError, QueueResult};
use crate::metrics::SharedMetrics;
use crate::metrics_const::UNHANDLED_MESSAGES_COUNTER;
use crate::msg::{
    ComponentLifecycleEvent, QueueMsg, QueuePayload, TbMsg, ToCalculatedFieldMsg, ToCoreMsg,
    ToEdgeMsg, ToRuleEngineMsg,
};
use crate::pack::{MsgCallback, MsgHandler};

/// Decoded work handed to the actor runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ActorMsg {
    RuleEngine {
        queue_name: String,
        msg: TbMsg,
    },
    DeviceActor {
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
    CalculatedField {
        tenant_id: TenantId,
        entity_id: EntityId,
        source_id: Option<EntityId>,
        data: serde_json::Value,
    },
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
    ComponentLifecycle {
        tenant_id: TenantId,
        entity_id: EntityId,
        event: ComponentLifecycleEvent,
    },
}

/// Sink for decoded messages. The receiving actor completes `callback`.
#[cfg_attr(test, mockall::automock)]
pub trait ActorSystem: Send + Sync {
    fn tell(&self, msg: ActorMsg, callback: Arc<dyn MsgCallback>);
}

/// Role-specific behavior plugged into a `PartitionBasedConsumerService`.
#[async_trait]
pub trait RoleHandler: Send + Sync + 'static {
    /// Envelope carried on the role's partitioned queues.
    type Msg: QueuePayload;
    /// Envelope carried inside `Notification::Role` on the role's notifications topic.
    type Notification: QueuePayload + Clone;

    fn service_type(&self) -> ServiceType;

    /// Roles with administrable, possibly tenant-isolated queues load them
    /// from the queue directory. Others run the single main queue from `Config`.
    fn uses_queue_directory(&self) -> bool {
        false
    }

    async fn on_start_up(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_msg(
        &self,
        msg: Arc<QueueMsg<Self::Msg>>,
        callback: Arc<dyn MsgCallback>,
        cancel: CancellationToken,
    ) -> QueueResult<()>;

    async fn handle_notification(
        &self,
        msg: Self::Notification,
        callback: Arc<dyn MsgCallback>,
    ) -> QueueResult<()>;

    async fn on_component_lifecycle(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        event: ComponentLifecycleEvent,
        callback: Arc<dyn MsgCallback>,
    ) -> QueueResult<()> {
        debug!(%tenant_id, %entity_id, ?event, "Ignoring component lifecycle event");
        callback.on_success();
        Ok(())
    }
}

/// Adapts a `RoleHandler` to the pack processor's handler contract.
pub struct RoleMsgHandler<H> {
    handler: Arc<H>,
}

impl<H> RoleMsgHandler<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: RoleHandler> MsgHandler<H::Msg> for RoleMsgHandler<H> {
    async fn handle(
        &self,
        msg: Arc<QueueMsg<H::Msg>>,
        callback: Arc<dyn MsgCallback>,
        cancel: CancellationToken,
    ) -> QueueResult<()> {
        if cancel.is_cancelled() || !callback.is_msg_valid() {
            debug!(key = %msg.key, "Skipping message from an invalidated pack");
            return Ok(());
        }
        self.handler.handle_msg(msg, callback, cancel).await
    }
}

fn unhandled(metrics: &SharedMetrics, service_type: ServiceType, kind: &str) -> QueueError {
    warn!(role = service_type.label(), kind, "Unhandled message kind");
    metrics.increment(
        UNHANDLED_MESSAGES_COUNTER,
        &[
            ("role", service_type.label().to_string()),
            ("kind", kind.to_string()),
        ],
        1,
    );
    QueueError::UnhandledMessageKind(kind.to_string())
}

fn tell_or_unhandled(
    actors: &dyn ActorSystem,
    metrics: &SharedMetrics,
    service_type: ServiceType,
    kind: &str,
    msg: Option<ActorMsg>,
    callback: Arc<dyn MsgCallback>,
) -> QueueResult<()> {
    match msg {
        Some(msg) => {
            actors.tell(msg, callback);
            Ok(())
        }
        None => Err(unhandled(metrics, service_type, kind)),
    }
}

pub struct RuleEngineHandler {
    actors: Arc<dyn ActorSystem>,
    metrics: SharedMetrics,
}

impl RuleEngineHandler {
    pub fn new(actors: Arc<dyn ActorSystem>, metrics: SharedMetrics) -> Self {
        Self { actors, metrics }
    }

    fn to_actor(msg: &ToRuleEngineMsg) -> Option<ActorMsg> {
        let tb_msg = msg.tb_msg.clone()?;
        Some(ActorMsg::RuleEngine {
            queue_name: tb_msg
                .queue_name
                .clone()
                .unwrap_or_else(|| crate::discovery::MAIN_QUEUE_NAME.to_string()),
            msg: tb_msg,
        })
    }
}

#[async_trait]
impl RoleHandler for RuleEngineHandler {
    type Msg = ToRuleEngineMsg;
    type Notification = ToRuleEngineMsg;

    fn service_type(&self) -> ServiceType {
        ServiceType::RuleEngine
    }

    fn uses_queue_directory(&self) -> bool {
        true
    }

    async fn handle_msg(
        &self,
        msg: Arc<QueueMsg<ToRuleEngineMsg>>,
        callback: Arc<dyn MsgCallback>,
        _cancel: CancellationToken,
    ) -> QueueResult<()> {
        if let Some(node) = msg.value.tb_msg.as_ref().and_then(|m| m.rule_node_id) {
            callback.on_processing_start(&node.to_string());
        }
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::RuleEngine,
            msg.value.kind(),
            Self::to_actor(&msg.value),
            callback,
        )
    }

    async fn handle_notification(
        &self,
        msg: ToRuleEngineMsg,
        callback: Arc<dyn MsgCallback>,
    ) -> QueueResult<()> {
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::RuleEngine,
            msg.kind(),
            Self::to_actor(&msg),
            callback,
        )
    }

    async fn on_component_lifecycle(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        event: ComponentLifecycleEvent,
        callback: Arc<dyn MsgCallback>,
    ) -> QueueResult<()> {
        self.actors.tell(
            ActorMsg::ComponentLifecycle {
                tenant_id,
                entity_id,
                event,
            },
            callback,
        );
        Ok(())
    }
}

pub struct CoreHandler {
    actors: Arc<dyn ActorSystem>,
    metrics: SharedMetrics,
}

impl CoreHandler {
    pub fn new(actors: Arc<dyn ActorSystem>, metrics: SharedMetrics) -> Self {
        Self { actors, metrics }
    }

    fn to_actor(msg: &ToCoreMsg) -> Option<ActorMsg> {
        match msg {
            ToCoreMsg::ToDeviceActor {
                tenant_id,
                device_id,
                payload,
            } => Some(ActorMsg::DeviceActor {
                tenant_id: *tenant_id,
                device_id: *device_id,
                payload: payload.clone(),
            }),
            ToCoreMsg::DeviceState {
                tenant_id,
                device_id,
                connected,
            } => Some(ActorMsg::DeviceState {
                tenant_id: *tenant_id,
                device_id: *device_id,
                connected: *connected,
            }),
            ToCoreMsg::DeviceActivity {
                tenant_id,
                device_id,
                last_activity_ts,
            } => Some(ActorMsg::DeviceActivity {
                tenant_id: *tenant_id,
                device_id: *device_id,
                last_activity_ts: *last_activity_ts,
            }),
            ToCoreMsg::EdgeNotification {
                tenant_id,
                edge_id,
                payload,
            } => Some(ActorMsg::EdgeNotification {
                tenant_id: *tenant_id,
                edge_id: *edge_id,
                payload: payload.clone(),
            }),
            ToCoreMsg::Unknown => None,
        }
    }
}

#[async_trait]
impl RoleHandler for CoreHandler {
    type Msg = ToCoreMsg;
    type Notification = ToCoreMsg;

    fn service_type(&self) -> ServiceType {
        ServiceType::Core
    }

    async fn handle_msg(
        &self,
        msg: Arc<QueueMsg<ToCoreMsg>>,
        callback: Arc<dyn MsgCallback>,
        _cancel: CancellationToken,
    ) -> QueueResult<()> {
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::Core,
            msg.value.kind(),
            Self::to_actor(&msg.value),
            callback,
        )
    }

    async fn handle_notification(
        &self,
        msg: ToCoreMsg,
        callback: Arc<dyn MsgCallback>,
    ) -> QueueResult<()> {
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::Core,
            msg.kind(),
            Self::to_actor(&msg),
            callback,
        )
    }
}

pub struct CalculatedFieldsHandler {
    actors: Arc<dyn ActorSystem>,
    metrics: SharedMetrics,
}

impl CalculatedFieldsHandler {
    pub fn new(actors: Arc<dyn ActorSystem>, metrics: SharedMetrics) -> Self {
        Self { actors, metrics }
    }

    fn to_actor(msg: &ToCalculatedFieldMsg) -> Option<ActorMsg> {
        match msg {
            ToCalculatedFieldMsg::Telemetry {
                tenant_id,
                entity_id,
                data,
            } => Some(ActorMsg::CalculatedField {
                tenant_id: *tenant_id,
                entity_id: *entity_id,
                source_id: None,
                data: data.clone(),
            }),
            ToCalculatedFieldMsg::LinkedTelemetry {
                tenant_id,
                entity_id,
                source_id,
                data,
            } => Some(ActorMsg::CalculatedField {
                tenant_id: *tenant_id,
                entity_id: *entity_id,
                source_id: Some(*source_id),
                data: data.clone(),
            }),
            ToCalculatedFieldMsg::Unknown => None,
        }
    }
}

#[async_trait]
impl RoleHandler for CalculatedFieldsHandler {
    type Msg = ToCalculatedFieldMsg;
    type Notification = ToCalculatedFieldMsg;

    fn service_type(&self) -> ServiceType {
        ServiceType::CalculatedFields
    }

    async fn handle_msg(
        &self,
        msg: Arc<QueueMsg<ToCalculatedFieldMsg>>,
        callback: Arc<dyn MsgCallback>,
        _cancel: CancellationToken,
    ) -> QueueResult<()> {
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::CalculatedFields,
            msg.value.kind(),
            Self::to_actor(&msg.value),
            callback,
        )
    }

    async fn handle_notification(
        &self,
        msg: ToCalculatedFieldMsg,
        callback: Arc<dyn MsgCallback>,
    ) -> QueueResult<()> {
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::CalculatedFields,
            msg.kind(),
            Self::to_actor(&msg),
            callback,
        )
    }
}

pub struct EdgeHandler {
    actors: Arc<dyn ActorSystem>,
    metrics: SharedMetrics,
}

impl EdgeHandler {
    pub fn new(actors: Arc<dyn ActorSystem>, metrics: SharedMetrics) -> Self {
        Self { actors, metrics }
    }

    fn to_actor(msg: &ToEdgeMsg) -> Option<ActorMsg> {
        match msg {
            ToEdgeMsg::EdgeEvent {
                tenant_id,
                edge_id,
                payload,
            } => Some(ActorMsg::EdgeEvent {
                tenant_id: *tenant_id,
                edge_id: *edge_id,
                payload: payload.clone(),
            }),
            ToEdgeMsg::EdgeNotification {
                tenant_id,
                edge_id,
                payload,
            } => Some(ActorMsg::EdgeNotification {
                tenant_id: *tenant_id,
                edge_id: *edge_id,
                payload: payload.clone(),
            }),
            ToEdgeMsg::Unknown => None,
        }
    }
}

#[async_trait]
impl RoleHandler for EdgeHandler {
    type Msg = ToEdgeMsg;
    type Notification = ToEdgeMsg;

    fn service_type(&self) -> ServiceType {
        ServiceType::Edge
    }

    async fn handle_msg(
        &self,
        msg: Arc<QueueMsg<ToEdgeMsg>>,
        callback: Arc<dyn MsgCallback>,
        _cancel: CancellationToken,
    ) -> QueueResult<()> {
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::Edge,
            msg.value.kind(),
            Self::to_actor(&msg.value),
            callback,
        )
    }

    async fn handle_notification(
        &self,
        msg: ToEdgeMsg,
        callback: Arc<dyn MsgCallback>,
    ) -> QueueResult<()> {
        tell_or_unhandled(
            self.actors.as_ref(),
            &self.metrics,
            ServiceType::Edge,
            msg.kind(),
            Self::to_actor(&msg),
            callback,
        )
    }
}
