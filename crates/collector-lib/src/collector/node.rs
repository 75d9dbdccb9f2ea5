//! Node capacity, condition and usage metrics

use super::{
    age_seconds, condition_value, with_labels, CollectError, Collector, MetricBatch, Source,
};
use crate::cluster::{ClusterApi, ResourceUsage};
use crate::models::{Labels, Metric, SOURCE_KUBERNETES};
use crate::quantity;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Collects one metric family per node attribute
pub struct NodeCollector {
    api: Arc<dyn ClusterApi>,
}

impl NodeCollector {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    fn node_metrics(&self, node: &Node, usage: Option<&ResourceUsage>, batch: &mut MetricBatch) {
        let labels = node_labels(node);
        let status = node.status.as_ref();

        let capacity = status.and_then(|s| s.capacity.as_ref());
        batch.gauge_opt(
            "node_cpu_capacity_cores",
            resource(capacity, "cpu").and_then(quantity::cores),
            &labels,
        );
        batch.gauge_opt(
            "node_memory_capacity_bytes",
            resource(capacity, "memory").and_then(quantity::bytes),
            &labels,
        );
        batch.gauge_opt(
            "node_storage_capacity_bytes",
            storage(capacity).and_then(quantity::bytes),
            &labels,
        );
        batch.gauge_opt(
            "node_pod_capacity",
            resource(capacity, "pods").and_then(quantity::bytes),
            &labels,
        );

        let allocatable = status.and_then(|s| s.allocatable.as_ref());
        batch.gauge_opt(
            "node_cpu_allocatable_cores",
            resource(allocatable, "cpu").and_then(quantity::cores),
            &labels,
        );
        batch.gauge_opt(
            "node_memory_allocatable_bytes",
            resource(allocatable, "memory").and_then(quantity::bytes),
            &labels,
        );
        batch.gauge_opt(
            "node_storage_allocatable_bytes",
            storage(allocatable).and_then(quantity::bytes),
            &labels,
        );
        batch.gauge_opt(
            "node_pod_allocatable",
            resource(allocatable, "pods").and_then(quantity::bytes),
            &labels,
        );

        for condition in status.and_then(|s| s.conditions.as_ref()).into_iter().flatten() {
            let condition_labels = with_labels(
                &labels,
                [
                    ("condition", condition.type_.clone()),
                    ("status", condition.status.clone()),
                    ("reason", condition.reason.clone().unwrap_or_default()),
                ],
            );
            batch.gauge(
                "node_condition",
                condition_value(&condition.status),
                &condition_labels,
            );
        }

        if let Some(usage) = usage {
            batch.gauge_opt(
                "node_cpu_usage_cores",
                usage.get("cpu").and_then(quantity::cores),
                &labels,
            );
            batch.gauge_opt(
                "node_memory_usage_bytes",
                usage.get("memory").and_then(quantity::bytes),
                &labels,
            );
        }

        let info = status.and_then(|s| s.node_info.as_ref());
        let info_labels = with_labels(
            &labels,
            [
                (
                    "kubelet_version",
                    info.map(|i| i.kubelet_version.clone()).unwrap_or_default(),
                ),
                (
                    "kube_proxy_version",
                    info.map(|i| i.kube_proxy_version.clone()).unwrap_or_default(),
                ),
                (
                    "container_runtime",
                    info.map(|i| i.container_runtime_version.clone())
                        .unwrap_or_default(),
                ),
            ],
        );
        batch.gauge("node_info", 1.0, &info_labels);

        batch.gauge_opt(
            "node_age_seconds",
            age_seconds(node.metadata.creation_timestamp.as_ref(), batch.timestamp()),
            &labels,
        );

        let taints = node.spec.as_ref().and_then(|s| s.taints.as_ref());
        for taint in taints.into_iter().flatten() {
            let taint_labels = with_labels(
                &labels,
                [
                    ("taint_key", taint.key.clone()),
                    ("taint_value", taint.value.clone().unwrap_or_default()),
                    ("taint_effect", taint.effect.clone()),
                ],
            );
            batch.gauge("node_taint", 1.0, &taint_labels);
        }
    }
}

#[async_trait]
impl Collector for NodeCollector {
    type Record = Metric;

    fn source(&self) -> Source {
        Source::Nodes
    }

    async fn collect(&mut self) -> Result<Vec<Metric>, CollectError> {
        let start = Instant::now();

        let (nodes, usage) = tokio::join!(self.api.list_nodes(), self.api.list_node_usage());
        let nodes = nodes.map_err(CollectError::list("nodes"))?;

        let usage: HashMap<String, ResourceUsage> = match usage {
            Ok(usage) => usage.into_iter().map(|u| (u.name, u.usage)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to get node metrics, continuing without usage data");
                HashMap::new()
            }
        };

        let mut batch = MetricBatch::new(Utc::now(), SOURCE_KUBERNETES);
        for node in &nodes {
            let name = node.metadata.name.as_deref().unwrap_or_default();
            self.node_metrics(node, usage.get(name), &mut batch);
        }

        let metrics = batch.into_metrics();
        debug!(
            node_count = nodes.len(),
            metric_count = metrics.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Collected node metrics"
        );

        Ok(metrics)
    }
}

fn node_labels(node: &Node) -> Labels {
    let info = node
        .status
        .as_ref()
        .and_then(|s| s.node_info.clone())
        .unwrap_or_default();

    let mut labels = Labels::new();
    labels.insert(
        "node".to_string(),
        node.metadata.name.clone().unwrap_or_default(),
    );
    labels.insert("architecture".to_string(), info.architecture);
    labels.insert("os".to_string(), info.operating_system);
    labels.insert("kernel".to_string(), info.kernel_version);
    labels.insert("runtime".to_string(), info.container_runtime_version);

    for (key, value) in node.metadata.labels.iter().flatten() {
        labels.insert(format!("label_{key}"), value.clone());
    }

    labels
}

pub(super) fn resource<'a>(
    resources: Option<&'a BTreeMap<String, Quantity>>,
    name: &str,
) -> Option<&'a Quantity> {
    resources.and_then(|r| r.get(name))
}

/// Nodes usually report `ephemeral-storage`; `storage` wins when both are present
fn storage(resources: Option<&BTreeMap<String, Quantity>>) -> Option<&Quantity> {
    resource(resources, "storage").or_else(|| resource(resources, "ephemeral-storage"))
}
