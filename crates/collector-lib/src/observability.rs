//! Observability infrastructure for the collector
//!
//! Provides:
//! - The `MetricsRecorder` seam the supervisor reports each cycle through
//! - Prometheus metrics (records collected, cycle duration, errors by stage,
//!   process memory and runtime gauges)
//! - Structured lifecycle logging with tracing

use crate::cluster::CredentialSource;
use crate::collector::RuntimeSample;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

/// Histogram buckets for collection cycles (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

pub const STAGE_COLLECT: &str = "collect";
pub const STAGE_PUBLISH: &str = "publish";

/// Sink for per-cycle collection statistics
///
/// `source` is the origin ("system" or "kubernetes") and `kind` the record
/// family ("runtime", "nodes", "pods", "events").
pub trait MetricsRecorder: Send + Sync {
    /// One completed cycle; `failed` when collection itself returned an error
    fn record_collection(&self, source: &str, kind: &str, duration: Duration, count: usize, failed: bool);

    /// One record that could not be published
    fn record_publish_error(&self, source: &str, kind: &str);

    /// Latest reading of the collector process
    fn record_runtime(&self, sample: &RuntimeSample);
}

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<CollectorMetricsInner> = OnceLock::new();

struct CollectorMetricsInner {
    metrics_collected: IntCounterVec,
    collection_duration_seconds: HistogramVec,
    collection_errors: IntCounterVec,
    resident_memory_bytes: IntGauge,
    runtime_worker_threads: IntGauge,
    runtime_alive_tasks: IntGauge,
}

impl CollectorMetricsInner {
    fn new() -> Self {
        Self {
            metrics_collected: register_int_counter_vec!(
                "sentinel_collector_metrics_collected_total",
                "Total number of records produced by collection cycles",
                &["source", "type"]
            )
            .expect("Failed to register metrics_collected_total"),

            collection_duration_seconds: register_histogram_vec!(
                "sentinel_collector_collection_duration_seconds",
                "Time spent in one collection cycle",
                &["source", "type"],
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_duration_seconds"),

            collection_errors: register_int_counter_vec!(
                "sentinel_collector_collection_errors_total",
                "Total number of collection and publish errors",
                &["source", "type", "stage"]
            )
            .expect("Failed to register collection_errors_total"),

            resident_memory_bytes: register_int_gauge!(
                "sentinel_collector_resident_memory_bytes",
                "Resident memory of the collector process"
            )
            .expect("Failed to register resident_memory_bytes"),

            runtime_worker_threads: register_int_gauge!(
                "sentinel_collector_runtime_worker_threads",
                "Worker threads of the async runtime"
            )
            .expect("Failed to register runtime_worker_threads"),

            runtime_alive_tasks: register_int_gauge!(
                "sentinel_collector_runtime_alive_tasks",
                "Tasks alive in the async runtime"
            )
            .expect("Failed to register runtime_alive_tasks"),
        }
    }
}

/// Prometheus-backed [`MetricsRecorder`]
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct CollectorMetrics {
    inner: &'static CollectorMetricsInner,
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorMetrics {
    /// Create a new metrics handle (registers global metrics if needed)
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new),
        }
    }

    /// Records collected so far for a source/type pair
    pub fn collected(&self, source: &str, kind: &str) -> u64 {
        self.inner
            .metrics_collected
            .with_label_values(&[source, kind])
            .get()
    }

    /// Errors counted so far for a source/type/stage triple
    pub fn errors(&self, source: &str, kind: &str, stage: &str) -> u64 {
        self.inner
            .collection_errors
            .with_label_values(&[source, kind, stage])
            .get()
    }
}

impl MetricsRecorder for CollectorMetrics {
    fn record_collection(&self, source: &str, kind: &str, duration: Duration, count: usize, failed: bool) {
        self.inner
            .collection_duration_seconds
            .with_label_values(&[source, kind])
            .observe(duration.as_secs_f64());

        if failed {
            self.inner
                .collection_errors
                .with_label_values(&[source, kind, STAGE_COLLECT])
                .inc();
        } else {
            self.inner
                .metrics_collected
                .with_label_values(&[source, kind])
                .inc_by(count as u64);
        }
    }

    fn record_publish_error(&self, source: &str, kind: &str) {
        self.inner
            .collection_errors
            .with_label_values(&[source, kind, STAGE_PUBLISH])
            .inc();
    }

    fn record_runtime(&self, sample: &RuntimeSample) {
        // Keep the last known value when /proc could not be read
        if let Some(bytes) = sample.resident_memory_bytes {
            self.inner
                .resident_memory_bytes
                .set(i64::try_from(bytes).unwrap_or(i64::MAX));
        }
        self.inner
            .runtime_worker_threads
            .set(i64::try_from(sample.worker_threads).unwrap_or(i64::MAX));
        self.inner
            .runtime_alive_tasks
            .set(i64::try_from(sample.alive_tasks).unwrap_or(i64::MAX));
    }
}

/// Structured logger for collector lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log collector startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "collector_started",
            instance = %self.instance,
            collector_version = %version,
            "Sentinel collector started"
        );
    }

    /// Log which credentials the cluster client was built from
    pub fn log_credential_source(&self, source: &CredentialSource) {
        match source {
            CredentialSource::InCluster => info!(
                event = "cluster_connected",
                instance = %self.instance,
                credential_source = %source,
                "Using in-cluster configuration"
            ),
            CredentialSource::Kubeconfig(path) => info!(
                event = "cluster_connected",
                instance = %self.instance,
                credential_source = %source,
                kubeconfig = %path.display(),
                "Using kubeconfig file"
            ),
        }
    }

    /// Log collector shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "collector_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Sentinel collector shutting down"
        );
    }
}
