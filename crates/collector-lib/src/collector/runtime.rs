//! Process and async runtime metrics for the collector itself
//!
//! Samples go to the metrics topic like every other record and, when a
//! recorder is attached, to the collector's own Prometheus gauges.

use super::{CollectError, Collector, MetricBatch, Source};
use crate::models::{Labels, Metric, SOURCE_RUNTIME};
use crate::observability::MetricsRecorder;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// One reading of the collector process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSample {
    /// `None` where /proc is unavailable
    pub resident_memory_bytes: Option<u64>,
    pub worker_threads: usize,
    pub alive_tasks: usize,
}

/// Samples resident memory and tokio scheduler counters
pub struct RuntimeCollector {
    status_path: PathBuf,
    recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl Default for RuntimeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeCollector {
    pub fn new() -> Self {
        Self::with_status_path("/proc/self/status")
    }

    /// Read process status from a custom path (for testing)
    pub fn with_status_path(path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: path.into(),
            recorder: None,
        }
    }

    /// Also publish every sample as Prometheus gauges
    pub fn with_recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Parse `VmRSS:  1234 kB` from /proc status content, in bytes
    pub fn parse_rss(content: &str) -> Option<u64> {
        content
            .lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .and_then(|kb| kb.checked_mul(1024))
    }

    async fn resident_memory(&self) -> Option<u64> {
        match fs::read_to_string(&self.status_path).await {
            Ok(content) => Self::parse_rss(&content),
            Err(e) => {
                debug!(
                    path = %self.status_path.display(),
                    error = %e,
                    "Process status unavailable, skipping resident memory"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Collector for RuntimeCollector {
    type Record = Metric;

    fn source(&self) -> Source {
        Source::Runtime
    }

    async fn collect(&mut self) -> Result<Vec<Metric>, CollectError> {
        let runtime = tokio::runtime::Handle::current().metrics();
        let sample = RuntimeSample {
            resident_memory_bytes: self.resident_memory().await,
            worker_threads: runtime.num_workers(),
            alive_tasks: runtime.num_alive_tasks(),
        };

        if let Some(recorder) = &self.recorder {
            recorder.record_runtime(&sample);
        }

        let labels = Labels::new();
        let mut batch = MetricBatch::new(Utc::now(), SOURCE_RUNTIME);
        batch.gauge_opt(
            "process_resident_memory_bytes",
            sample.resident_memory_bytes.map(|b| b as f64),
            &labels,
        );
        batch.gauge("runtime_worker_threads", sample.worker_threads as f64, &labels);
        batch.gauge("runtime_alive_tasks", sample.alive_tasks as f64, &labels);

        Ok(batch.into_metrics())
    }
}
