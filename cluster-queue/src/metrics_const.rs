// ==== Pack processing ====
/// Counter for messages handed to a handler, labelled by queue
pub const PACK_MESSAGES_TOTAL_COUNTER: &str = "queue_pack_messages_total";

/// Counter for messages acknowledged successfully
pub const PACK_MESSAGES_SUCCEEDED_COUNTER: &str = "queue_pack_messages_succeeded_total";

/// Counter for messages whose handler reported failure
pub const PACK_MESSAGES_FAILED_COUNTER: &str = "queue_pack_messages_failed_total";

/// Counter for messages still pending when the pack deadline elapsed
pub const PACK_MESSAGES_TIMED_OUT_COUNTER: &str = "queue_pack_messages_timed_out_total";

/// Counter for packs re-submitted by a retry strategy
pub const PACK_RETRIES_COUNTER: &str = "queue_pack_retries_total";

/// Histogram for the wall time from pack dispatch to commit
pub const PACK_PROCESSING_DURATION_HISTOGRAM: &str = "queue_pack_processing_duration_seconds";

/// Histogram for messages per polled pack
pub const PACK_SIZE_HISTOGRAM: &str = "queue_pack_size_messages";

// ==== Consumer loops ====
/// Counter for offset commits issued after a pack resolved
pub const CONSUMER_COMMITS_COUNTER: &str = "queue_consumer_commits_total";

/// Counter for poll/process errors that made the loop back off
pub const CONSUMER_LOOP_ERRORS_COUNTER: &str = "queue_consumer_loop_errors_total";

/// Gauge for live consumers owned by a queue's manager
pub const CONSUMERS_ACTIVE_GAUGE: &str = "queue_consumers_active";

/// Gauge for topic-partitions a queue's manager is subscribed to
pub const CONSUMER_PARTITIONS_GAUGE: &str = "queue_consumer_partitions";

/// Counter for messages skipped because they could not be decoded
pub const CONSUMER_POISON_PILLS_COUNTER: &str = "queue_consumer_poison_pills_total";

// ==== Lifecycle ====
/// Counter for lifecycle tasks applied, labelled by kind
pub const LIFECYCLE_TASKS_APPLIED_COUNTER: &str = "queue_lifecycle_tasks_applied_total";

/// Counter for UPDATE tasks dropped because a later one superseded them
pub const LIFECYCLE_TASKS_COALESCED_COUNTER: &str = "queue_lifecycle_tasks_coalesced_total";

/// Counter for drain attempts that found another drain in progress
pub const LIFECYCLE_CONTENTION_COUNTER: &str = "queue_lifecycle_contention_total";

/// Counter for repartition passes executed in consumer-per-partition mode
pub const REPARTITION_PASSES_COUNTER: &str = "queue_repartition_passes_total";

// ==== Service ====
/// Counter for partition change events handled, labelled by role
pub const PARTITION_CHANGE_EVENTS_COUNTER: &str = "queue_partition_change_events_total";

/// Counter for tenant queue consumers created lazily on assignment
pub const TENANT_QUEUES_CREATED_COUNTER: &str = "queue_tenant_queues_created_total";

/// Counter for tenant queue consumers removed on ownership loss
pub const TENANT_QUEUES_REMOVED_COUNTER: &str = "queue_tenant_queues_removed_total";

/// Counter for envelopes with no matching dispatch arm
pub const UNHANDLED_MESSAGES_COUNTER: &str = "queue_unhandled_messages_total";

// ==== Router ====
/// Counter for producer sends, labelled by role and status
pub const ROUTER_SENDS_COUNTER: &str = "queue_router_sends_total";

/// Counter for broadcasts, labelled by role and status
pub const ROUTER_BROADCASTS_COUNTER: &str = "queue_router_broadcasts_total";

/// Counter for edge notification send retries
pub const ROUTER_EDGE_RETRIES_COUNTER: &str = "queue_router_edge_retries_total";

/// Counter for profile cache lookups that fell back to the original target
pub const ROUTER_PROFILE_MISSES_COUNTER: &str = "queue_router_profile_misses_total";

// ==== Stats flush ====
/// Gauge for messages counted in the last stats interval, labelled by outcome
pub const STATS_INTERVAL_MESSAGES_GAUGE: &str = "queue_stats_interval_messages";

/// Gauge for pack iterations counted in the last stats interval, labelled by outcome
pub const STATS_INTERVAL_ITERATIONS_GAUGE: &str = "queue_stats_interval_iterations";
