use std::sync::Arc;

use uuid::Uuid;

use super::context::PackProcessingContext;
use crate::error::QueueError;
use crate::msg::QueuePayload;

/// Completion callback handed to business handlers, one per message.
///
/// Exactly one of `on_success` / `on_failure` is expected per message; any
/// further call is ignored.
pub trait MsgCallback: Send + Sync {
    fn on_success(&self);

    fn on_failure(&self, error: QueueError);

    /// False once the owning pack was cancelled, or timed out under a
    /// strategy that abandons timed-out messages. Handlers check this before
    /// doing expensive work.
    fn is_msg_valid(&self) -> bool {
        true
    }

    /// Records the rule node the message is entering, for timeout diagnostics.
    fn on_processing_start(&self, _rule_node: &str) {}
}

pub struct PackCallback<T> {
    id: Uuid,
    ctx: Arc<PackProcessingContext<T>>,
}

impl<T> PackCallback<T> {
    pub fn new(id: Uuid, ctx: Arc<PackProcessingContext<T>>) -> Self {
        Self { id, ctx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T: QueuePayload> MsgCallback for PackCallback<T> {
    fn on_success(&self) {
        self.ctx.on_success(self.id);
    }

    fn on_failure(&self, error: QueueError) {
        self.ctx.on_failure(self.id, error);
    }

    fn is_msg_valid(&self) -> bool {
        self.ctx.is_valid()
    }

    fn on_processing_start(&self, rule_node: &str) {
        self.ctx.on_processing_start(self.id, rule_node);
    }
}
