//! Publishing telemetry records to the message broker
//!
//! Records are serialized to JSON, keyed by their natural key and routed to
//! the metrics or logs topic. The [`BrokerWriter`] seam keeps the supervisor
//! independent of the Kafka client.

mod kafka;

pub use kafka::{BatchSettings, BatchSink, KafkaBrokerWriter, KafkaTopicSink};

use crate::config::TopicsConfig;
use crate::models::{TelemetryRecord, TopicKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to brokers: {0}")]
    Connect(String),

    #[error("no producer for topic {0}")]
    UnknownTopic(String),

    #[error("failed to produce to {topic}: {reason}")]
    Produce { topic: String, reason: String },

    #[error("broker writer is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to serialize record: {0}")]
    Json(#[from] serde_json::Error),
}

/// A serialized record ready for the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Serialize a record with its natural key and own timestamp
pub fn encode<R: TelemetryRecord>(record: &R) -> Result<BrokerMessage, SerializationError> {
    Ok(BrokerMessage {
        key: record.natural_key().to_string(),
        payload: serde_json::to_vec(record)?,
        timestamp: record.timestamp(),
    })
}

/// Topic names for each logical destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub metrics: String,
    pub logs: String,
}

impl Topics {
    pub fn resolve(&self, kind: TopicKind) -> &str {
        match kind {
            TopicKind::Metrics => &self.metrics,
            TopicKind::Logs => &self.logs,
        }
    }

    pub fn names(&self) -> [&str; 2] {
        [&self.metrics, &self.logs]
    }
}

impl From<&TopicsConfig> for Topics {
    fn from(config: &TopicsConfig) -> Self {
        Self {
            metrics: config.metrics.clone(),
            logs: config.logs.clone(),
        }
    }
}

/// Acknowledged, batched delivery of messages to named topics
#[async_trait]
pub trait BrokerWriter: Send + Sync {
    /// Publish one message and wait for the broker acknowledgment
    async fn write(&self, topic: &str, message: BrokerMessage) -> Result<(), BrokerError>;

    /// Flush pending batches; later writes fail with [`BrokerError::Closed`]
    async fn close(&self) -> Result<(), BrokerError>;
}
