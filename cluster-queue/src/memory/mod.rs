//! Single-process broker: topics live in memory, commit is a no-op.

mod consumer;
mod producer;
mod storage;

pub use consumer::{InMemoryConsumerFactory, InMemoryQueueConsumer};
pub use producer::InMemoryQueueProducer;
pub use storage::InMemoryStorage;
