//! Normalized telemetry records produced by every collector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source tag for records derived from Kubernetes objects
pub const SOURCE_KUBERNETES: &str = "kubernetes";

/// Source tag for records describing the collector process itself
pub const SOURCE_RUNTIME: &str = "runtime";

/// Label set attached to a metric or event
pub type Labels = BTreeMap<String, String>;

/// Metric kind as understood by downstream stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// A single metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
}

impl Metric {
    /// Create a gauge sample sourced from Kubernetes
    pub fn gauge(
        name: impl Into<String>,
        value: f64,
        labels: Labels,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(name, value, labels, timestamp, SOURCE_KUBERNETES, MetricKind::Gauge)
    }

    /// Create a counter sample sourced from Kubernetes
    pub fn counter(
        name: impl Into<String>,
        value: f64,
        labels: Labels,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(name, value, labels, timestamp, SOURCE_KUBERNETES, MetricKind::Counter)
    }

    pub fn new(
        name: impl Into<String>,
        value: f64,
        labels: Labels,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        kind: MetricKind,
    ) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty(), "metric name must not be empty");

        Self {
            name,
            value,
            labels,
            timestamp,
            source: source.into(),
            kind,
        }
    }
}

/// Event severity derived from the event type and reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
            EventSeverity::Critical => "critical",
        }
    }
}

/// The resource an event refers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventObject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

/// A cluster event normalized for the logs topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
    pub message: String,
    /// "component/host" of the reporting source
    pub source: String,
    /// Last time the event was observed
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub object: EventObject,
    pub labels: Labels,
}

/// Logical destination of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Metrics,
    Logs,
}

/// A record that can be published to the broker
pub trait TelemetryRecord: Serialize + Send + Sync + 'static {
    /// Topic this record type is routed to
    const TOPIC: TopicKind;

    /// Partitioning key used for ordering on the broker
    fn natural_key(&self) -> &str;

    /// Timestamp carried on the broker message
    fn timestamp(&self) -> DateTime<Utc>;
}

impl TelemetryRecord for Metric {
    const TOPIC: TopicKind = TopicKind::Metrics;

    fn natural_key(&self) -> &str {
        &self.name
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl TelemetryRecord for Event {
    const TOPIC: TopicKind = TopicKind::Logs;

    fn natural_key(&self) -> &str {
        &self.event_type
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
