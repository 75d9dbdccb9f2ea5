//! `ClusterApi` backed by a live kube client

use super::{ClusterApi, ClusterError, ContainerUsage, NodeUsage, PodUsage, ResourceUsage};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

const NODE_METRICS_PATH: &str = "/apis/metrics.k8s.io/v1beta1/nodes";
const POD_METRICS_PATH: &str = "/apis/metrics.k8s.io/v1beta1/pods";

/// Cluster access through the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// GET a metrics.k8s.io path and decode the body
    async fn get_metrics<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClusterError> {
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .body(vec![])?;

        Ok(self.client.request(request).await?)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_events(&self) -> Result<Vec<Event>, ClusterError> {
        let api: Api<Event> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_node_usage(&self) -> Result<Vec<NodeUsage>, ClusterError> {
        let list: MetricsList<RawNodeMetrics> = self.get_metrics(NODE_METRICS_PATH).await?;
        Ok(list.items.into_iter().map(NodeUsage::from).collect())
    }

    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>, ClusterError> {
        let list: MetricsList<RawPodMetrics> = self.get_metrics(POD_METRICS_PATH).await?;
        Ok(list.items.into_iter().map(PodUsage::from).collect())
    }
}

// Wire shapes of the metrics.k8s.io/v1beta1 list responses

#[derive(Debug, Deserialize)]
struct MetricsList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RawNodeMetrics {
    metadata: ObjectMeta,
    #[serde(default)]
    usage: ResourceUsage,
}

#[derive(Debug, Deserialize)]
struct RawPodMetrics {
    metadata: ObjectMeta,
    #[serde(default)]
    containers: Vec<RawContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct RawContainerMetrics {
    name: String,
    #[serde(default)]
    usage: ResourceUsage,
}

impl From<RawNodeMetrics> for NodeUsage {
    fn from(raw: RawNodeMetrics) -> Self {
        Self {
            name: raw.metadata.name.unwrap_or_default(),
            usage: raw.usage,
        }
    }
}

impl From<RawPodMetrics> for PodUsage {
    fn from(raw: RawPodMetrics) -> Self {
        Self {
            name: raw.metadata.name.unwrap_or_default(),
            namespace: raw.metadata.namespace.unwrap_or_default(),
            containers: raw
                .containers
                .into_iter()
                .map(|c| ContainerUsage {
                    name: c.name,
                    usage: c.usage,
                })
                .collect(),
        }
    }
}
