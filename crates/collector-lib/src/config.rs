//! Collector configuration
//!
//! Every field has a serde default so a partial file or a handful of
//! environment variables is enough to run. Loading from sources lives in the
//! binary; this module owns the shape, defaults and validation.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("kafka.brokers must contain at least one address")]
    NoBrokers,

    #[error("topic name for {0} must not be empty")]
    EmptyTopic(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// Top-level collector configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;
        self.collection.validate()
    }
}

/// Cluster connection preference
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubernetesConfig {
    /// Try the in-cluster service account before any kubeconfig file
    #[serde(default)]
    pub in_cluster: bool,

    /// Explicit kubeconfig path
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

/// Compression applied to produced record batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    None,
    Gzip,
    Lz4,
    #[default]
    Snappy,
    Zstd,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_metrics_topic")]
    pub metrics: String,

    #[serde(default = "default_logs_topic")]
    pub logs: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics_topic(),
            logs: default_logs_topic(),
        }
    }
}

fn default_metrics_topic() -> String {
    "metrics".to_string()
}

fn default_logs_topic() -> String {
    "logs".to_string()
}

/// Broker connection and batching
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    #[serde(default)]
    pub topics: TopicsConfig,

    /// Records per produce request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Linger before a partial batch is flushed
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default)]
    pub compression: CompressionCodec,

    /// Upper bound on connecting, retrying and each produce request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topics: TopicsConfig::default(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            compression: CompressionCodec::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    10
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl KafkaConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::NoBrokers);
        }
        if self.topics.metrics.trim().is_empty() {
            return Err(ConfigError::EmptyTopic("metrics"));
        }
        if self.topics.logs.trim().is_empty() {
            return Err(ConfigError::EmptyTopic("logs"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroValue("kafka.batch_size"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("kafka.request_timeout_ms"));
        }
        Ok(())
    }
}

/// Per-source polling intervals
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_runtime_interval")]
    pub runtime_interval_secs: u64,

    #[serde(default = "default_node_interval")]
    pub node_interval_secs: u64,

    #[serde(default = "default_pod_interval")]
    pub pod_interval_secs: u64,

    #[serde(default = "default_event_interval")]
    pub event_interval_secs: u64,

    /// Upper bound on draining loops at shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            runtime_interval_secs: default_runtime_interval(),
            node_interval_secs: default_node_interval(),
            pod_interval_secs: default_pod_interval(),
            event_interval_secs: default_event_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_runtime_interval() -> u64 {
    10
}

fn default_node_interval() -> u64 {
    30
}

fn default_pod_interval() -> u64 {
    15
}

fn default_event_interval() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl CollectionConfig {
    pub fn runtime_interval(&self) -> Duration {
        Duration::from_secs(self.runtime_interval_secs)
    }

    pub fn node_interval(&self) -> Duration {
        Duration::from_secs(self.node_interval_secs)
    }

    pub fn pod_interval(&self) -> Duration {
        Duration::from_secs(self.pod_interval_secs)
    }

    pub fn event_interval(&self) -> Duration {
        Duration::from_secs(self.event_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("collection.runtime_interval_secs", self.runtime_interval_secs),
            ("collection.node_interval_secs", self.node_interval_secs),
            ("collection.pod_interval_secs", self.pod_interval_secs),
            ("collection.event_interval_secs", self.event_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }
        Ok(())
    }
}

/// Health and metrics HTTP server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
