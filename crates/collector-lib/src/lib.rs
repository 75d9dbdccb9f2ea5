//! Collector library for Kubernetes cluster telemetry
//!
//! This crate provides the core functionality for:
//! - Connecting to the cluster API (in-cluster or kubeconfig credentials)
//! - Collecting node, pod, event and process runtime telemetry
//! - Publishing records to Kafka topics
//! - Supervising the per-source collection loops
//! - Health checks and observability

pub mod broker;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod health;
pub mod models;
pub mod observability;
pub mod quantity;
pub mod supervisor;

pub use broker::{BrokerError, BrokerWriter, KafkaBrokerWriter, Topics};
pub use cluster::{ClusterApi, ClusterClientFactory, CredentialSource, KubeClusterApi};
pub use config::CollectorConfig;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{CollectorMetrics, MetricsRecorder, StructuredLogger};
pub use supervisor::{CollectionSupervisor, Intervals, SupervisorBuilder, SupervisorState};
