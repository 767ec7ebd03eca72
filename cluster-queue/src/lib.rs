//! Message-consumption and routing core of a clustered IoT platform.
//!
//! Nodes consume per-role queues whose partitions are assigned by a cluster
//! directory. Each polled pack is dispatched to business handlers under a
//! deadline, tracked by a [`pack::PackProcessingContext`], then committed.
//! Partition and queue-configuration changes flow through a per-queue
//! [`consumer::QueueLifecycleManager`] into a [`consumer::QueueConsumerManager`].
//! Outbound traffic is routed by [`router::ClusterRouter`].

pub mod broker;
pub mod config;
pub mod consumer;
pub mod discovery;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod metrics;
pub mod metrics_const;
pub mod msg;
pub mod pack;
pub mod router;
pub mod service;
pub mod test_utils;
