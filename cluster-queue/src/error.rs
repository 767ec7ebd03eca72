use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::discovery::QueueKey;

/// Errors surfaced by the consumption and routing paths.
///
/// Lock contention in the lifecycle manager is deliberately absent: it is not a
/// failure, only a reschedule.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Producer send failed. Callers decide whether to retry.
    #[error("failed to send message to {topic}: {reason}")]
    TransientSendFailure { topic: String, reason: String },

    /// The business handler explicitly reported failure for a message.
    #[error("handler failed to process message: {message}")]
    HandlerFailure {
        message: String,
        rule_node: Option<String>,
    },

    /// Message neither succeeded nor failed before the pack deadline.
    #[error("message processing timed out")]
    Timeout,

    /// A partition was assigned for a queue whose configuration is unknown.
    #[error("queue configuration not found for {0}")]
    ConfigurationMissing(QueueKey),

    /// The envelope carried a message variant no dispatcher understands.
    #[error("unhandled message kind: {0}")]
    UnhandledMessageKind(String),

    #[error("consumer is stopped")]
    ConsumerStopped,

    #[error("no producer configured for {0}")]
    ProducerNotConfigured(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            message: message.into(),
            rule_node: None,
        }
    }

    pub fn send_failure(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::TransientSendFailure {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    /// Short label used for metrics and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::TransientSendFailure { .. } => "transient_send_failure",
            QueueError::HandlerFailure { .. } => "handler_failure",
            QueueError::Timeout => "timeout",
            QueueError::ConfigurationMissing(_) => "configuration_missing",
            QueueError::UnhandledMessageKind(_) => "unhandled_message_kind",
            QueueError::ConsumerStopped => "consumer_stopped",
            QueueError::ProducerNotConfigured(_) => "producer_not_configured",
            QueueError::Kafka(_) => "kafka",
            QueueError::Serialization(_) => "serialization",
        }
    }
}

// Errors are shared between a pack context and the per-tenant exception map,
// so a cheap copy is needed. KafkaError and serde errors are flattened to text.
impl Clone for QueueError {
    fn clone(&self) -> Self {
        match self {
            QueueError::TransientSendFailure { topic, reason } => QueueError::TransientSendFailure {
                topic: topic.clone(),
                reason: reason.clone(),
            },
            QueueError::HandlerFailure { message, rule_node } => QueueError::HandlerFailure {
                message: message.clone(),
                rule_node: rule_node.clone(),
            },
            QueueError::Timeout => QueueError::Timeout,
            QueueError::ConfigurationMissing(key) => QueueError::ConfigurationMissing(key.clone()),
            QueueError::UnhandledMessageKind(kind) => QueueError::UnhandledMessageKind(kind.clone()),
            QueueError::ConsumerStopped => QueueError::ConsumerStopped,
            QueueError::ProducerNotConfigured(role) => {
                QueueError::ProducerNotConfigured(role.clone())
            }
            QueueError::Kafka(e) => QueueError::Kafka(e.clone()),
            QueueError::Serialization(e) => QueueError::handler(format!("serialization: {e}")),
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
