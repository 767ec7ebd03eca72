use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::msg::EncodedMsg;

/// Process-local topic storage shared by in-memory consumers and producers.
#[derive(Default)]
pub struct InMemoryStorage {
    topics: DashMap<String, VecDeque<EncodedMsg>>,
    offsets: AtomicI64,
    notify: Notify,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to a topic and returns the storage-wide offset assigned.
    pub fn put(&self, topic: &str, msg: EncodedMsg) -> i64 {
        let offset = self.offsets.fetch_add(1, Ordering::Relaxed);
        self.topics.entry(topic.to_string()).or_default().push_back(msg);
        self.notify.notify_waiters();
        offset
    }

    /// Removes up to `max` messages from the head of a topic.
    pub fn take(&self, topic: &str, max: usize) -> Vec<EncodedMsg> {
        match self.topics.get_mut(topic) {
            Some(mut queue) => {
                let n = queue.len().min(max);
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }
}
