//! Access to the Kubernetes control-plane and metrics APIs
//!
//! Collectors only see the [`ClusterApi`] capability trait. The production
//! implementation wraps a `kube::Client`; tests substitute an in-memory fake.

mod client;
pub mod factory;

#[cfg(test)]
pub(crate) mod fake;

pub use client::KubeClusterApi;
pub use factory::{
    AttemptOutcome, ClusterClientFactory, ConnectionError, CredentialLoader, CredentialSource,
    KubeCredentialLoader,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use thiserror::Error;

/// Resource usage keyed by resource name (`cpu`, `memory`)
pub type ResourceUsage = BTreeMap<String, Quantity>;

/// Usage sample for a single node from metrics.k8s.io
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUsage {
    pub name: String,
    pub usage: ResourceUsage,
}

/// Usage sample for a single container from metrics.k8s.io
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsage {
    pub name: String,
    pub usage: ResourceUsage,
}

/// Usage sample for a pod and its containers from metrics.k8s.io
#[derive(Debug, Clone, PartialEq)]
pub struct PodUsage {
    pub name: String,
    pub namespace: String,
    pub containers: Vec<ContainerUsage>,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),

    #[error("cluster API unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the cluster used by the collectors
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// List pods across all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError>;

    /// List events across all namespaces
    async fn list_events(&self) -> Result<Vec<Event>, ClusterError>;

    /// List node usage from the metrics API
    async fn list_node_usage(&self) -> Result<Vec<NodeUsage>, ClusterError>;

    /// List pod usage from the metrics API
    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>, ClusterError>;
}
