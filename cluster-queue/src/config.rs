use std::time::Duration;

use anyhow::{bail, Result};
use envconfig::Envconfig;

use crate::discovery::{QueueConfig, ServiceType, TopicService};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "500")]
    pub kafka_max_poll_records: usize,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "snappy")]
    pub kafka_compression_codec: String,

    // Cluster identity
    #[envconfig(default = "")]
    pub queue_prefix: String,

    #[envconfig(default = "tb-node-0")]
    pub service_id: String,

    // Core queue
    #[envconfig(default = "tb_core")]
    pub core_topic: String,

    #[envconfig(default = "10")]
    pub core_partitions: i32,

    #[envconfig(default = "25")]
    pub core_poll_interval_ms: u64,

    #[envconfig(default = "2000")]
    pub core_pack_processing_timeout_ms: u64,

    #[envconfig(default = "false")]
    pub core_consumer_per_partition: bool,

    // Rule engine queues are configured through the queue directory; these
    // apply to the notifications consumer and to queues without overrides.
    #[envconfig(default = "25")]
    pub rule_engine_poll_interval_ms: u64,

    #[envconfig(default = "2000")]
    pub rule_engine_pack_processing_timeout_ms: u64,

    // Calculated fields queue
    #[envconfig(default = "tb_cf_event")]
    pub cf_topic: String,

    #[envconfig(default = "10")]
    pub cf_partitions: i32,

    #[envconfig(default = "25")]
    pub cf_poll_interval_ms: u64,

    #[envconfig(default = "60000")]
    pub cf_pack_processing_timeout_ms: u64,

    // Edge queue
    #[envconfig(default = "tb_edge")]
    pub edge_topic: String,

    #[envconfig(default = "10")]
    pub edge_partitions: i32,

    #[envconfig(default = "25")]
    pub edge_poll_interval_ms: u64,

    #[envconfig(default = "10000")]
    pub edge_pack_processing_timeout_ms: u64,

    #[envconfig(default = "3")]
    pub edge_notification_max_retries: u32,

    #[envconfig(default = "1000")]
    pub edge_notification_retry_backoff_ms: u64,

    // Notifications consumer
    #[envconfig(default = "25")]
    pub notifications_poll_interval_ms: u64,

    // Consumer lifecycle
    #[envconfig(default = "1000")]
    pub repartition_delay_ms: u64,

    #[envconfig(default = "1000")]
    pub lifecycle_retry_backoff_ms: u64,

    #[envconfig(default = "8")]
    pub dispatch_pool_size: usize,

    #[envconfig(default = "true")]
    pub stats_enabled: bool,

    #[envconfig(default = "60000")]
    pub stats_print_interval_ms: u64,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    /// Reject settings that would make consumers spin or never commit.
    pub fn validate(&self) -> Result<()> {
        if self.service_id.trim().is_empty() {
            bail!("SERVICE_ID must not be empty");
        }
        let timeouts = [
            ("CORE_POLL_INTERVAL_MS", self.core_poll_interval_ms),
            ("CORE_PACK_PROCESSING_TIMEOUT_MS", self.core_pack_processing_timeout_ms),
            ("RULE_ENGINE_POLL_INTERVAL_MS", self.rule_engine_poll_interval_ms),
            (
                "RULE_ENGINE_PACK_PROCESSING_TIMEOUT_MS",
                self.rule_engine_pack_processing_timeout_ms,
            ),
            ("CF_POLL_INTERVAL_MS", self.cf_poll_interval_ms),
            ("CF_PACK_PROCESSING_TIMEOUT_MS", self.cf_pack_processing_timeout_ms),
            ("EDGE_POLL_INTERVAL_MS", self.edge_poll_interval_ms),
            ("EDGE_PACK_PROCESSING_TIMEOUT_MS", self.edge_pack_processing_timeout_ms),
            ("NOTIFICATIONS_POLL_INTERVAL_MS", self.notifications_poll_interval_ms),
            ("LIFECYCLE_RETRY_BACKOFF_MS", self.lifecycle_retry_backoff_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.dispatch_pool_size == 0 {
            bail!("DISPATCH_POOL_SIZE must be greater than zero");
        }
        if self.kafka_max_poll_records == 0 {
            bail!("KAFKA_MAX_POLL_RECORDS must be greater than zero");
        }
        Ok(())
    }

    pub fn topic_service(&self) -> TopicService {
        TopicService::new(self.queue_prefix.clone())
    }

    pub fn notifications_poll_interval(&self) -> Duration {
        Duration::from_millis(self.notifications_poll_interval_ms)
    }

    pub fn repartition_delay(&self) -> Duration {
        Duration::from_millis(self.repartition_delay_ms)
    }

    pub fn lifecycle_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lifecycle_retry_backoff_ms)
    }

    pub fn stats_print_interval(&self) -> Duration {
        Duration::from_millis(self.stats_print_interval_ms)
    }

    pub fn edge_notification_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.edge_notification_retry_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Poll interval and pack timeout applied to a role's own consumers.
    pub fn role_timings(&self, service_type: ServiceType) -> (Duration, Duration) {
        let (poll, pack) = match service_type {
            ServiceType::Core | ServiceType::Transport => {
                (self.core_poll_interval_ms, self.core_pack_processing_timeout_ms)
            }
            ServiceType::RuleEngine => (
                self.rule_engine_poll_interval_ms,
                self.rule_engine_pack_processing_timeout_ms,
            ),
            ServiceType::CalculatedFields => {
                (self.cf_poll_interval_ms, self.cf_pack_processing_timeout_ms)
            }
            ServiceType::Edge => (self.edge_poll_interval_ms, self.edge_pack_processing_timeout_ms),
        };
        (Duration::from_millis(poll), Duration::from_millis(pack))
    }

    /// Main queue of a role whose queue is not managed by the queue directory.
    pub fn main_queue(&self, service_type: ServiceType) -> QueueConfig {
        let (topic, partitions, per_partition) = match service_type {
            ServiceType::Core | ServiceType::Transport => (
                self.core_topic.as_str(),
                self.core_partitions,
                self.core_consumer_per_partition,
            ),
            ServiceType::RuleEngine => ("tb_rule_engine.main", 10, false),
            ServiceType::CalculatedFields => (self.cf_topic.as_str(), self.cf_partitions, true),
            ServiceType::Edge => (self.edge_topic.as_str(), self.edge_partitions, false),
        };
        let (poll_interval, pack_processing_timeout) = self.role_timings(service_type);

        let mut config = QueueConfig::new(service_type, crate::discovery::MAIN_QUEUE_NAME, topic);
        config.partitions = partitions;
        config.consumer_per_partition = per_partition;
        config.poll_interval = poll_interval;
        config.pack_processing_timeout = pack_processing_timeout;
        config
    }
}
