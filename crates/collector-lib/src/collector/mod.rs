//! Telemetry collectors
//!
//! One collector per source. Each turns a snapshot of cluster (or process)
//! state into freshly built records; only the event collector carries state
//! between calls.

mod event;
mod node;
mod pod;
mod runtime;

pub use event::{event_id, severity_for, EventCollector, WATERMARK_LOOKBACK_SECS};
pub use node::NodeCollector;
pub use pod::{container_state_ordinal, phase_ordinal, PodCollector};
pub use runtime::{RuntimeCollector, RuntimeSample};

use crate::cluster::ClusterError;
use crate::models::{Labels, Metric, MetricKind, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to list {resource}: {source}")]
    List {
        resource: &'static str,
        #[source]
        source: ClusterError,
    },
}

impl CollectError {
    pub(crate) fn list(resource: &'static str) -> impl FnOnce(ClusterError) -> Self {
        move |source| CollectError::List { resource, source }
    }
}

/// Identity of a collection loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Runtime,
    Nodes,
    Pods,
    Events,
}

impl Source {
    /// `source` label on collection metrics
    pub fn origin(&self) -> &'static str {
        match self {
            Source::Runtime => "system",
            _ => "kubernetes",
        }
    }

    /// `type` label on collection metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Runtime => "runtime",
            Source::Nodes => "nodes",
            Source::Pods => "pods",
            Source::Events => "events",
        }
    }

    /// Health registry component name
    pub fn component(&self) -> &'static str {
        match self {
            Source::Runtime => "runtime_loop",
            Source::Nodes => "node_loop",
            Source::Pods => "pod_loop",
            Source::Events => "event_loop",
        }
    }
}

/// A source of telemetry records polled on a fixed interval
#[async_trait]
pub trait Collector: Send {
    type Record: TelemetryRecord;

    fn source(&self) -> Source;

    /// Take one snapshot
    async fn collect(&mut self) -> Result<Vec<Self::Record>, CollectError>;
}

/// Accumulates metrics sharing one cycle timestamp
pub(crate) struct MetricBatch {
    timestamp: DateTime<Utc>,
    source: &'static str,
    metrics: Vec<Metric>,
}

impl MetricBatch {
    pub(crate) fn new(timestamp: DateTime<Utc>, source: &'static str) -> Self {
        Self {
            timestamp,
            source,
            metrics: Vec::new(),
        }
    }

    pub(crate) fn gauge(&mut self, name: &str, value: f64, labels: &Labels) {
        self.push(name, value, labels.clone(), MetricKind::Gauge);
    }

    /// Gauge that is skipped when the value is absent
    pub(crate) fn gauge_opt(&mut self, name: &str, value: Option<f64>, labels: &Labels) {
        if let Some(value) = value {
            self.gauge(name, value, labels);
        }
    }

    pub(crate) fn counter(&mut self, name: &str, value: f64, labels: &Labels) {
        self.push(name, value, labels.clone(), MetricKind::Counter);
    }

    fn push(&mut self, name: &str, value: f64, labels: Labels, kind: MetricKind) {
        self.metrics.push(Metric::new(
            name,
            value,
            labels,
            self.timestamp,
            self.source,
            kind,
        ));
    }

    pub(crate) fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub(crate) fn into_metrics(self) -> Vec<Metric> {
        self.metrics
    }
}

/// Copy of `base` with extra labels layered on top
pub(crate) fn with_labels<const N: usize>(base: &Labels, extra: [(&str, String); N]) -> Labels {
    let mut labels = base.clone();
    for (key, value) in extra {
        labels.insert(key.to_string(), value);
    }
    labels
}

/// `1.0` when a condition status is "True"
pub(crate) fn condition_value(status: &str) -> f64 {
    if status == "True" {
        1.0
    } else {
        0.0
    }
}

/// Seconds between an object's creation and `now`; `None` without a creation time
pub(crate) fn age_seconds(
    created: Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,
    now: DateTime<Utc>,
) -> Option<f64> {
    created.map(|t| (now - t.0).num_milliseconds() as f64 / 1000.0)
}
