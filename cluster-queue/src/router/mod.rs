//! Outbound routing: resolves logical destinations to topic-partitions and
//! sends through the producers of each role.

mod callback;
mod cluster_router;
mod profile;
mod retry;

pub use callback::{MultipleMsgCallback, QueueCallback};
#[cfg(test)]
pub use callback::MockQueueCallback;
pub use cluster_router::{ClusterRouter, ProducerProvider};
pub use profile::{InMemoryProfileCache, ProfileCache, RuleEngineProfile};
#[cfg(test)]
pub use profile::MockProfileCache;
pub use retry::{RetryPolicy, RetryPolicyBuilder};
