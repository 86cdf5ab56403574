use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Notifications emitted by the coordinator. Every method defaults to a no-op.
pub trait IdempotencyObserver: Send + Sync {
    /// A stored result was returned without running the operation.
    fn on_hit(&self, _key: &str) {}

    fn on_miss(&self, _key: &str) {}

    /// A caller attached to an execution already in flight for the same key.
    fn on_joined(&self, _key: &str) {}

    fn on_executed(&self, _key: &str, _elapsed_ms: f64) {}

    fn on_operation_failed(&self, _key: &str) {}

    fn on_store_error(&self, _operation: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl IdempotencyObserver for NoopObserver {}

/// In-process counters for idempotent executions.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub joined: AtomicU64,
    pub executions: AtomicU64,
    pub failures: AtomicU64,
    pub store_errors: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

impl IdempotencyObserver for IdempotencyMetrics {
    fn on_hit(&self, _key: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_miss(&self, _key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_joined(&self, _key: &str) {
        self.joined.fetch_add(1, Ordering::Relaxed);
    }

    fn on_executed(&self, _key: &str, _elapsed_ms: f64) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_operation_failed(&self, _key: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn on_store_error(&self, _operation: &str) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
    pub executions: u64,
    pub failures: u64,
    pub store_errors: u64,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Forwards notifications to the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusObserver;

impl IdempotencyObserver for PrometheusObserver {
    fn on_hit(&self, _key: &str) {
        counter!("idempotency_lookups_total", "result" => "hit").increment(1);
    }

    fn on_miss(&self, _key: &str) {
        counter!("idempotency_lookups_total", "result" => "miss").increment(1);
    }

    fn on_joined(&self, _key: &str) {
        counter!("idempotency_joined_total").increment(1);
    }

    fn on_executed(&self, _key: &str, elapsed_ms: f64) {
        counter!("idempotency_executions_total", "success" => "true").increment(1);
        histogram!("idempotency_execution_duration_ms").record(elapsed_ms);
    }

    fn on_operation_failed(&self, _key: &str) {
        counter!("idempotency_executions_total", "success" => "false").increment(1);
    }

    fn on_store_error(&self, operation: &str) {
        counter!("idempotency_store_errors_total", "operation" => operation.to_string()).increment(1);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_lookups_total", Unit::Count, "Store lookups by result (hit/miss)");
    describe_counter!("idempotency_joined_total", Unit::Count, "Callers that joined an in-flight execution");
    describe_counter!("idempotency_executions_total", Unit::Count, "Operation executions by outcome");
    describe_histogram!("idempotency_execution_duration_ms", Unit::Milliseconds, "Operation execution latency in milliseconds");
    describe_counter!("idempotency_store_errors_total", Unit::Count, "Store failures by operation");
}
