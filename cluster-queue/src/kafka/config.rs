use rdkafka::ClientConfig;

use crate::config::Config;

fn base_client(config: &Config) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("client.id", &config.service_id);
    if config.kafka_tls {
        client
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }
    client
}

/// Client settings for queue consumers.
///
/// Offsets are committed by the pack processor once a pack resolves, so
/// librdkafka never commits or stores offsets on its own.
pub struct ConsumerConfigBuilder {
    client: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn from_config(config: &Config, group_id: &str) -> Self {
        let mut client = base_client(config);
        client
            .set("group.id", group_id)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("partition.assignment.strategy", "cooperative-sticky");
        Self { client }
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.client.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.client
    }
}

/// Client settings shared by every producer of a node.
pub struct ProducerConfigBuilder {
    client: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn from_config(config: &Config) -> Self {
        let mut client = base_client(config);
        client
            .set("partitioner", "murmur2_random")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set("message.timeout.ms", config.kafka_message_timeout_ms.to_string())
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                config.kafka_producer_queue_mib.saturating_mul(1024).to_string(),
            );
        Self { client }
    }

    pub fn build(self) -> ClientConfig {
        self.client
    }
}
