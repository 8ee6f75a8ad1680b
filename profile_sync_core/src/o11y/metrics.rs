use dashmap::DashMap;
use std::sync::Arc;

/// Counter sink keyed by job and event name.
///
/// Injected once at startup; new data types add new job names without any
/// new counter plumbing.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, job: &str, event: &str, by: u64);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Emits every increment as a debug event on the `profile_sync.metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, job: &str, event: &str, by: u64) {
        tracing::debug!(target: "profile_sync.metrics", job, event, by, "metric");
    }
}

/// Counters kept in process; used by tests and the `show-config` diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<(String, String), u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job: &str, event: &str) -> u64 {
        self.counters
            .get(&(job.to_string(), event.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// All counters sorted by `(job, event)`.
    pub fn snapshot(&self) -> Vec<((String, String), u64)> {
        let mut out: Vec<_> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort();
        out
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, job: &str, event: &str, by: u64) {
        *self
            .counters
            .entry((job.to_string(), event.to_string()))
            .or_insert(0) += by;
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _job: &str, _event: &str, _by: u64) {}
}
