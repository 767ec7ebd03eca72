use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::broker::SendMetadata;
use crate::error::QueueError;

/// Completion of a producer send. Exactly one method is called per send.
#[cfg_attr(test, mockall::automock)]
pub trait QueueCallback: Send + Sync {
    fn on_success(&self, metadata: Option<SendMetadata>);

    fn on_failure(&self, error: QueueError);
}

/// Collapses `count` send completions into one call on `inner`: success once
/// all sends succeeded, failure on the first failure. Later calls are ignored.
pub struct MultipleMsgCallback {
    remaining: AtomicUsize,
    fired: AtomicBool,
    inner: Arc<dyn QueueCallback>,
}

impl MultipleMsgCallback {
    pub fn new(count: usize, inner: Arc<dyn QueueCallback>) -> Self {
        let callback = Self {
            remaining: AtomicUsize::new(count),
            fired: AtomicBool::new(false),
            inner,
        };
        if count == 0 && !callback.fired.swap(true, Ordering::AcqRel) {
            callback.inner.on_success(None);
        }
        callback
    }

    pub fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl QueueCallback for MultipleMsgCallback {
    fn on_success(&self, _metadata: Option<SendMetadata>) {
        let last = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            == Ok(1);
        if last && !self.fired.swap(true, Ordering::AcqRel) {
            self.inner.on_success(None);
        }
    }

    fn on_failure(&self, error: QueueError) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.inner.on_failure(error);
        }
    }
}
