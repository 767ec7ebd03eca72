//! rdkafka-backed implementations of the broker contracts.

mod config;
mod consumer;
mod producer;

pub use config::{ConsumerConfigBuilder, ProducerConfigBuilder};
pub use consumer::{KafkaConsumerFactory, KafkaQueueConsumer};
pub use producer::KafkaQueueProducer;
