use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::discovery::{QueueKey, TenantId};
use crate::error::QueueError;
use crate::metrics_const::{STATS_INTERVAL_ITERATIONS_GAUGE, STATS_INTERVAL_MESSAGES_GAUGE};

pub type Labels<'a> = &'a [(&'static str, String)];

/// Destination for counters, gauges and histograms.
///
/// Every component receives its sink at construction so nothing in the crate
/// depends on process-wide state.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64);
    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

fn owned_labels(labels: Labels<'_>) -> Vec<(String, String)> {
    labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Forwards to the `metrics` facade; whichever recorder the binary installs
/// (usually the Prometheus exporter) receives the values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetricsSink;

impl MetricsSink for PrometheusMetricsSink {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        metrics::counter!(name, &owned_labels(labels)).increment(value);
    }

    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        metrics::gauge!(name, &owned_labels(labels)).set(value);
    }

    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        metrics::histogram!(name, &owned_labels(labels)).record(value);
    }
}

type SeriesKey = (&'static str, Vec<(String, String)>);

/// Records every value in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    counters: DashMap<SeriesKey, u64>,
    gauges: DashMap<SeriesKey, f64>,
    histograms: DashMap<SeriesKey, Vec<f64>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of a counter across all label sets.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|e| e.key().0 == name)
            .map(|e| *e.value())
            .sum()
    }

    /// Sum of a counter across the label sets containing `label = value`.
    pub fn counter_with(&self, name: &str, label: &str, value: &str) -> u64 {
        self.counters
            .iter()
            .filter(|e| {
                e.key().0 == name && e.key().1.iter().any(|(k, v)| k == label && v == value)
            })
            .map(|e| *e.value())
            .sum()
    }

    /// Last value set on a gauge, for any label set.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .iter()
            .find(|e| e.key().0 == name)
            .map(|e| *e.value())
    }

    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.histograms
            .iter()
            .filter(|e| e.key().0 == name)
            .flat_map(|e| e.value().clone())
            .collect()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        *self.counters.entry((name, owned_labels(labels))).or_default() += value;
    }

    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.gauges.insert((name, owned_labels(labels)), value);
    }

    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.histograms
            .entry((name, owned_labels(labels)))
            .or_default()
            .push(value);
    }
}

/// Per-queue processing statistics, flushed and reset on an interval.
pub struct ConsumerStats {
    key: QueueKey,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    successful_iterations: AtomicU64,
    failed_iterations: AtomicU64,
    tenant_exceptions: DashMap<TenantId, QueueError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub successful_iterations: u64,
    pub failed_iterations: u64,
}

impl ConsumerStats {
    pub fn new(key: QueueKey) -> Self {
        Self {
            key,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            successful_iterations: AtomicU64::new(0),
            failed_iterations: AtomicU64::new(0),
            tenant_exceptions: DashMap::new(),
        }
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    /// Record one processing iteration of a pack.
    pub fn record_iteration(&self, succeeded: usize, failed: usize, timed_out: usize) {
        let as_u64 = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        self.total
            .fetch_add(as_u64(succeeded + failed + timed_out), Ordering::Relaxed);
        self.succeeded.fetch_add(as_u64(succeeded), Ordering::Relaxed);
        self.failed.fetch_add(as_u64(failed), Ordering::Relaxed);
        self.timed_out.fetch_add(as_u64(timed_out), Ordering::Relaxed);
        if failed == 0 && timed_out == 0 {
            self.successful_iterations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_iterations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Keeps the first exception seen per tenant within the interval.
    pub fn record_exception(&self, tenant_id: TenantId, error: &QueueError) {
        self.tenant_exceptions
            .entry(tenant_id)
            .or_insert_with(|| error.clone());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            successful_iterations: self.successful_iterations.load(Ordering::Relaxed),
            failed_iterations: self.failed_iterations.load(Ordering::Relaxed),
        }
    }

    /// Logs and publishes the interval's numbers, then resets them.
    pub fn flush(&self, sink: &dyn MetricsSink) -> StatsSnapshot {
        let snapshot = StatsSnapshot {
            total: self.total.swap(0, Ordering::Relaxed),
            succeeded: self.succeeded.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            timed_out: self.timed_out.swap(0, Ordering::Relaxed),
            successful_iterations: self.successful_iterations.swap(0, Ordering::Relaxed),
            failed_iterations: self.failed_iterations.swap(0, Ordering::Relaxed),
        };

        let queue = self.key.to_string();
        for (outcome, value) in [
            ("total", snapshot.total),
            ("succeeded", snapshot.succeeded),
            ("failed", snapshot.failed),
            ("timed_out", snapshot.timed_out),
        ] {
            sink.gauge(
                STATS_INTERVAL_MESSAGES_GAUGE,
                &[("queue", queue.clone()), ("outcome", outcome.to_string())],
                value as f64,
            );
        }
        for (outcome, value) in [
            ("succeeded", snapshot.successful_iterations),
            ("failed", snapshot.failed_iterations),
        ] {
            sink.gauge(
                STATS_INTERVAL_ITERATIONS_GAUGE,
                &[("queue", queue.clone()), ("outcome", outcome.to_string())],
                value as f64,
            );
        }

        if snapshot.total > 0 {
            info!(
                queue = %self.key,
                total = snapshot.total,
                succeeded = snapshot.succeeded,
                failed = snapshot.failed,
                timed_out = snapshot.timed_out,
                successful_iterations = snapshot.successful_iterations,
                failed_iterations = snapshot.failed_iterations,
                "Queue stats"
            );
        }
        let tenants: Vec<TenantId> = self.tenant_exceptions.iter().map(|e| *e.key()).collect();
        for tenant in tenants {
            if let Some((tenant, error)) = self.tenant_exceptions.remove(&tenant) {
                warn!(queue = %self.key, tenant = %tenant, error = ?error, "Tenant processing failures in stats interval");
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ServiceType;

    #[test]
    fn test_in_memory_sink_sums_across_labels() {
        let sink = InMemoryMetricsSink::new();
        sink.increment("sends", &[("status", "ok".to_string())], 2);
        sink.increment("sends", &[("status", "error".to_string())], 1);
        sink.increment("sends", &[("status", "ok".to_string())], 3);

        assert_eq!(sink.counter("sends"), 6);
        assert_eq!(sink.counter_with("sends", "status", "ok"), 5);
        assert_eq!(sink.counter("other"), 0);
    }

    #[test]
    fn test_stats_flush_resets_counters() {
        let stats = ConsumerStats::new(QueueKey::new(ServiceType::RuleEngine));
        stats.record_iteration(3, 1, 1);
        stats.record_iteration(4, 0, 0);
        stats.record_exception(TenantId::SYS, &QueueError::handler("bad payload"));
        stats.record_exception(TenantId::SYS, &QueueError::Timeout);

        let sink = InMemoryMetricsSink::new();
        let flushed = stats.flush(&sink);
        assert_eq!(
            flushed,
            StatsSnapshot {
                total: 9,
                succeeded: 7,
                failed: 1,
                timed_out: 1,
                successful_iterations: 1,
                failed_iterations: 1,
            }
        );
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert!(sink.gauge_value(STATS_INTERVAL_MESSAGES_GAUGE).is_some());
    }

    #[test]
    fn test_first_exception_per_tenant_is_kept() {
        let stats = ConsumerStats::new(QueueKey::new(ServiceType::Core));
        let tenant = TenantId::random();
        stats.record_exception(tenant, &QueueError::handler("first"));
        stats.record_exception(tenant, &QueueError::handler("second"));

        let kept = stats.tenant_exceptions.get(&tenant).unwrap();
        assert!(kept.to_string().contains("first"));
    }
}
