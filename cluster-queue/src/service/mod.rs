//! Per-role consumer services and the dispatchers behind them.

mod consumer_service;
mod handlers;

pub use consumer_service::{
    PartitionBasedConsumerService, QueueHandle, ServiceDeps, ServiceState,
    NOTIFICATIONS_QUEUE_NAME,
};
pub use handlers::{
    ActorMsg, ActorSystem, CalculatedFieldsHandler, CoreHandler, EdgeHandler, RoleHandler,
    RoleMsgHandler, RuleEngineHandler,
};
#[cfg(test)]
pub use handlers::MockActorSystem;
