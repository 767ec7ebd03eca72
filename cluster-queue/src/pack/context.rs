use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, enabled, info, trace, warn, Level};
use uuid::Uuid;

use super::callback::{MsgCallback, PackCallback};
use crate::discovery::TenantId;
use crate::error::QueueError;
use crate::msg::{QueueMsg, QueuePayload};

/// Completion bookkeeping for one in-flight pack.
///
/// Every synthetic id starts in `pending` and moves at most once, to either
/// `succeeded` or `failed`. The move is an atomic remove from `pending`, so
/// duplicate callbacks find nothing to remove and do nothing.
pub struct PackProcessingContext<T> {
    queue: String,
    pending: DashMap<Uuid, Arc<QueueMsg<T>>>,
    succeeded: DashMap<Uuid, Arc<QueueMsg<T>>>,
    failed: DashMap<Uuid, Arc<QueueMsg<T>>>,
    exceptions: DashMap<TenantId, QueueError>,
    last_visited: DashMap<Uuid, String>,
    gate: Notify,
    gate_open: AtomicBool,
    progress: Notify,
    cancel: CancellationToken,
    skip_timed_out: bool,
}

/// Snapshot of a pack after its wait resolved.
pub struct PackResult<T> {
    /// Whether every message reached a terminal state before the deadline.
    pub completed: bool,
    pub succeeded: HashMap<Uuid, Arc<QueueMsg<T>>>,
    pub failed: HashMap<Uuid, Arc<QueueMsg<T>>>,
    pub timed_out: HashMap<Uuid, Arc<QueueMsg<T>>>,
    /// First failure per tenant.
    pub exceptions: HashMap<TenantId, QueueError>,
}

impl<T> PackResult<T> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.timed_out.len()
    }
}

impl<T: QueuePayload> PackProcessingContext<T> {
    pub fn new(
        queue: impl Into<String>,
        msgs: impl IntoIterator<Item = (Uuid, Arc<QueueMsg<T>>)>,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = Self {
            queue: queue.into(),
            pending: msgs.into_iter().collect(),
            succeeded: DashMap::new(),
            failed: DashMap::new(),
            exceptions: DashMap::new(),
            last_visited: DashMap::new(),
            gate: Notify::new(),
            gate_open: AtomicBool::new(false),
            progress: Notify::new(),
            cancel,
            skip_timed_out: true,
        };
        if ctx.pending.is_empty() {
            ctx.open_gate();
        }
        ctx
    }

    /// When false, `cleanup` leaves callbacks of timed-out messages valid so
    /// their handlers may run to completion in the background.
    pub fn with_skip_timed_out(mut self, skip_timed_out: bool) -> Self {
        self.skip_timed_out = skip_timed_out;
        self
    }

    pub fn callback(self: &Arc<Self>, id: Uuid) -> Arc<dyn MsgCallback> {
        Arc::new(PackCallback::new(id, Arc::clone(self)))
    }

    /// Returns true when this call moved the message out of pending.
    pub fn on_success(&self, id: Uuid) -> bool {
        if !self.is_valid() {
            return false;
        }
        match self.pending.remove(&id) {
            Some((id, msg)) => {
                self.succeeded.insert(id, msg);
                self.close_if_drained();
                true
            }
            None => false,
        }
    }

    /// Returns true when this call moved the message out of pending.
    pub fn on_failure(&self, id: Uuid, error: QueueError) -> bool {
        if !self.is_valid() {
            return false;
        }
        let Some((id, msg)) = self.pending.remove(&id) else {
            return false;
        };

        let error = match error {
            QueueError::HandlerFailure {
                message,
                rule_node: None,
            } => QueueError::HandlerFailure {
                message,
                rule_node: self.last_visited.get(&id).map(|n| n.value().clone()),
            },
            other => other,
        };
        let tenant = msg.value.tenant_id();
        debug!(queue = %self.queue, id = %id, tenant = %tenant, error = ?error, "Message failed");
        self.exceptions.entry(tenant).or_insert(error);

        self.failed.insert(id, msg);
        self.close_if_drained();
        true
    }

    pub fn on_processing_start(&self, id: Uuid, rule_node: &str) {
        if self.is_valid() && self.pending.contains_key(&id) {
            self.last_visited.insert(id, rule_node.to_string());
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Makes every outstanding callback stale.
    pub fn invalidate(&self) {
        self.cancel.cancel();
    }

    /// Waits until none of `ids` is pending anymore.
    pub async fn await_resolved(&self, ids: &[Uuid]) {
        loop {
            let progressed = self.progress.notified();
            tokio::pin!(progressed);
            progressed.as_mut().enable();
            if ids.iter().all(|id| !self.pending.contains_key(id)) {
                return;
            }
            progressed.await;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.gate_open.load(Ordering::SeqCst)
    }

    /// Waits until every message reached a terminal state or `timeout` elapsed.
    /// Returns false on timeout.
    pub async fn await_completion(&self, timeout: Duration) -> bool {
        let notified = self.gate.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_complete() {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok() || self.is_complete()
    }

    pub fn pending_ids(&self) -> HashSet<Uuid> {
        self.pending.iter().map(|e| *e.key()).collect()
    }

    pub fn succeeded_ids(&self) -> HashSet<Uuid> {
        self.succeeded.iter().map(|e| *e.key()).collect()
    }

    pub fn failed_ids(&self) -> HashSet<Uuid> {
        self.failed.iter().map(|e| *e.key()).collect()
    }

    pub fn exception_for(&self, tenant_id: TenantId) -> Option<QueueError> {
        self.exceptions.get(&tenant_id).map(|e| e.value().clone())
    }

    pub fn last_visited(&self, id: Uuid) -> Option<String> {
        self.last_visited.get(&id).map(|n| n.value().clone())
    }

    /// Logs messages still pending after the deadline. They stay pending:
    /// a timeout is not a failure, the handler may still be running.
    pub fn log_timeouts(&self) {
        let pending = self.pending.len();
        if pending == 0 {
            return;
        }
        if let Some(first) = self.pending.iter().next() {
            info!(
                queue = %self.queue,
                timed_out = pending,
                id = %first.key(),
                key = %first.value().key,
                last_rule_node = ?self.last_visited(*first.key()),
                "Timeout to process message"
            );
        }
        if enabled!(Level::TRACE) {
            for entry in self.pending.iter() {
                trace!(
                    queue = %self.queue,
                    id = %entry.key(),
                    key = %entry.value().key,
                    last_rule_node = ?self.last_visited(*entry.key()),
                    "Timeout to process message"
                );
            }
        }
    }

    pub fn log_failures(&self) {
        let failed = self.failed.len();
        if failed == 0 {
            return;
        }
        if let Some(first) = self.failed.iter().next() {
            warn!(
                queue = %self.queue,
                failed,
                id = %first.key(),
                key = %first.value().key,
                last_rule_node = ?self.last_visited(*first.key()),
                "Failed to process message"
            );
        }
        if enabled!(Level::TRACE) {
            for entry in self.failed.iter() {
                trace!(queue = %self.queue, id = %entry.key(), key = %entry.value().key, "Failed to process message");
            }
        }
    }

    pub fn result(&self, completed: bool) -> PackResult<T> {
        let collect = |map: &DashMap<Uuid, Arc<QueueMsg<T>>>| {
            map.iter()
                .map(|e| (*e.key(), Arc::clone(e.value())))
                .collect::<HashMap<_, _>>()
        };
        PackResult {
            completed,
            succeeded: collect(&self.succeeded),
            failed: collect(&self.failed),
            timed_out: collect(&self.pending),
            exceptions: self
                .exceptions
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        }
    }

    /// Releases the messages. Outstanding callbacks are invalidated unless
    /// timed-out messages are kept running.
    pub fn cleanup(&self) {
        if self.skip_timed_out {
            self.invalidate();
        }
        self.pending.clear();
        self.succeeded.clear();
        self.failed.clear();
        self.last_visited.clear();
        self.progress.notify_waiters();
    }

    fn close_if_drained(&self) {
        self.progress.notify_waiters();
        if self.pending.is_empty() {
            self.open_gate();
        }
    }

    fn open_gate(&self) {
        if !self.gate_open.swap(true, Ordering::SeqCst) {
            self.gate.notify_waiters();
        }
    }
}
