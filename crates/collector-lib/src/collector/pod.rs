//! Pod, container and pod usage metrics

use super::node::resource;
use super::{
    age_seconds, condition_value, with_labels, CollectError, Collector, MetricBatch, Source,
};
use crate::cluster::{ClusterApi, ContainerUsage, PodUsage};
use crate::models::{Labels, Metric, SOURCE_KUBERNETES};
use crate::quantity;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ContainerState, Pod};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Ordinal for `pod_phase`.
///
/// The order is not lifecycle order; downstream dashboards depend on these
/// exact values.
pub fn phase_ordinal(phase: Option<&str>) -> f64 {
    match phase {
        Some("Running") => 1.0,
        Some("Pending") => 2.0,
        Some("Succeeded") => 3.0,
        Some("Failed") => 4.0,
        Some("Unknown") => 5.0,
        _ => 0.0,
    }
}

/// Ordinal for `container_state`: running 1, waiting 2, terminated 3, none 0
pub fn container_state_ordinal(state: Option<&ContainerState>) -> f64 {
    match state {
        Some(s) if s.running.is_some() => 1.0,
        Some(s) if s.waiting.is_some() => 2.0,
        Some(s) if s.terminated.is_some() => 3.0,
        _ => 0.0,
    }
}

pub struct PodCollector {
    api: Arc<dyn ClusterApi>,
}

impl PodCollector {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    fn pod_metrics(&self, pod: &Pod, usage: Option<&PodUsage>, batch: &mut MetricBatch) {
        let labels = pod_labels(pod);
        let status = pod.status.as_ref();

        batch.gauge(
            "pod_phase",
            phase_ordinal(status.and_then(|s| s.phase.as_deref())),
            &labels,
        );

        let conditions = status.and_then(|s| s.conditions.as_ref());
        let ready = conditions
            .into_iter()
            .flatten()
            .find(|c| c.type_ == "Ready")
            .map(|c| condition_value(&c.status))
            .unwrap_or(0.0);
        batch.gauge("pod_ready", ready, &labels);

        let containers = pod.spec.as_ref().map(|s| s.containers.as_slice());
        for container in containers.into_iter().flatten() {
            let container_labels = with_labels(
                &labels,
                [
                    ("container", container.name.clone()),
                    ("image", container.image.clone().unwrap_or_default()),
                ],
            );
            let resources = container.resources.as_ref();
            let requests = resources.and_then(|r| r.requests.as_ref());
            let limits = resources.and_then(|r| r.limits.as_ref());

            batch.gauge_opt(
                "container_cpu_request_cores",
                resource(requests, "cpu").and_then(quantity::cores),
                &container_labels,
            );
            batch.gauge_opt(
                "container_memory_request_bytes",
                resource(requests, "memory").and_then(quantity::bytes),
                &container_labels,
            );
            batch.gauge_opt(
                "container_cpu_limit_cores",
                resource(limits, "cpu").and_then(quantity::cores),
                &container_labels,
            );
            batch.gauge_opt(
                "container_memory_limit_bytes",
                resource(limits, "memory").and_then(quantity::bytes),
                &container_labels,
            );
        }

        let statuses = status.and_then(|s| s.container_statuses.as_ref());
        for container in statuses.into_iter().flatten() {
            let container_labels = with_labels(
                &labels,
                [
                    ("container", container.name.clone()),
                    ("image", container.image.clone()),
                    ("image_id", container.image_id.clone()),
                ],
            );

            let ready = if container.ready { 1.0 } else { 0.0 };
            batch.gauge("container_ready", ready, &container_labels);
            batch.counter(
                "container_restart_count",
                f64::from(container.restart_count),
                &container_labels,
            );
            batch.gauge(
                "container_state",
                container_state_ordinal(container.state.as_ref()),
                &container_labels,
            );
        }

        if let Some(usage) = usage {
            usage_metrics(&labels, &usage.containers, batch);
        }

        batch.gauge_opt(
            "pod_age_seconds",
            age_seconds(pod.metadata.creation_timestamp.as_ref(), batch.timestamp()),
            &labels,
        );

        for condition in conditions.into_iter().flatten() {
            let condition_labels = with_labels(
                &labels,
                [
                    ("condition", condition.type_.clone()),
                    ("status", condition.status.clone()),
                    ("reason", condition.reason.clone().unwrap_or_default()),
                ],
            );
            batch.gauge(
                "pod_condition",
                condition_value(&condition.status),
                &condition_labels,
            );
        }
    }
}

/// Pod-level sums followed by per-container usage
fn usage_metrics(labels: &Labels, containers: &[ContainerUsage], batch: &mut MetricBatch) {
    let total_millicores: i128 = containers
        .iter()
        .filter_map(|c| c.usage.get("cpu").and_then(quantity::millis))
        .sum();
    let total_bytes: i128 = containers
        .iter()
        .filter_map(|c| c.usage.get("memory").and_then(quantity::units))
        .sum();

    if total_millicores > 0 {
        batch.gauge(
            "pod_cpu_usage_cores",
            total_millicores as f64 / 1000.0,
            labels,
        );
    }
    if total_bytes > 0 {
        batch.gauge("pod_memory_usage_bytes", total_bytes as f64, labels);
    }

    for container in containers {
        let container_labels = with_labels(labels, [("container", container.name.clone())]);
        batch.gauge_opt(
            "container_cpu_usage_cores",
            container.usage.get("cpu").and_then(quantity::cores),
            &container_labels,
        );
        batch.gauge_opt(
            "container_memory_usage_bytes",
            container.usage.get("memory").and_then(quantity::bytes),
            &container_labels,
        );
    }
}

#[async_trait]
impl Collector for PodCollector {
    type Record = Metric;

    fn source(&self) -> Source {
        Source::Pods
    }

    async fn collect(&mut self) -> Result<Vec<Metric>, CollectError> {
        let start = Instant::now();

        let (pods, usage) = tokio::join!(self.api.list_pods(), self.api.list_pod_usage());
        let pods = pods.map_err(CollectError::list("pods"))?;

        let usage: HashMap<(String, String), PodUsage> = match usage {
            Ok(usage) => usage
                .into_iter()
                .map(|u| ((u.namespace.clone(), u.name.clone()), u))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to get pod metrics, continuing without usage data");
                HashMap::new()
            }
        };

        let mut batch = MetricBatch::new(Utc::now(), SOURCE_KUBERNETES);
        for pod in &pods {
            let key = (
                pod.metadata.namespace.clone().unwrap_or_default(),
                pod.metadata.name.clone().unwrap_or_default(),
            );
            self.pod_metrics(pod, usage.get(&key), &mut batch);
        }

        let metrics = batch.into_metrics();
        debug!(
            pod_count = pods.len(),
            metric_count = metrics.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Collected pod metrics"
        );

        Ok(metrics)
    }
}

fn pod_labels(pod: &Pod) -> Labels {
    let mut labels = Labels::new();
    labels.insert(
        "pod".to_string(),
        pod.metadata.name.clone().unwrap_or_default(),
    );
    labels.insert(
        "namespace".to_string(),
        pod.metadata.namespace.clone().unwrap_or_default(),
    );
    labels.insert(
        "node".to_string(),
        pod.spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
    );
    labels.insert(
        "phase".to_string(),
        pod.status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
    );

    for (key, value) in pod.metadata.labels.iter().flatten() {
        labels.insert(format!("label_{key}"), value.clone());
    }

    if let Some(owner) = pod.metadata.owner_references.as_ref().and_then(|o| o.first()) {
        labels.insert("owner_kind".to_string(), owner.kind.clone());
        labels.insert("owner_name".to_string(), owner.name.clone());
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{self, FakeCluster};
    use crate::models::MetricKind;

    fn find<'a>(metrics: &'a [Metric], name: &str) -> Vec<&'a Metric> {
        metrics.iter().filter(|m| m.name == name).collect()
    }

    async fn collect(cluster: FakeCluster) -> Vec<Metric> {
        PodCollector::new(Arc::new(cluster)).collect().await.unwrap()
    }

    #[test]
    fn test_phase_ordinal_table() {
        assert_eq!(phase_ordinal(Some("Running")), 1.0);
        assert_eq!(phase_ordinal(Some("Pending")), 2.0);
        assert_eq!(phase_ordinal(Some("Succeeded")), 3.0);
        assert_eq!(phase_ordinal(Some("Failed")), 4.0);
        assert_eq!(phase_ordinal(Some("Unknown")), 5.0);
        assert_eq!(phase_ordinal(Some("")), 0.0);
        assert_eq!(phase_ordinal(None), 0.0);
    }

    #[test]
    fn test_container_state_ordinal() {
        let running = fake::with_container_status(
            fake::pod("default", "a", Some("Running"), &["app"]),
            "app",
            0,
            Some("running"),
        );
        let statuses = running.status.unwrap().container_statuses.unwrap();
        assert_eq!(container_state_ordinal(statuses[0].state.as_ref()), 1.0);

        assert_eq!(
            container_state_ordinal(Some(&ContainerState::default())),
            0.0
        );
        assert_eq!(container_state_ordinal(None), 0.0);
    }

    #[tokio::test]
    async fn test_pod_phase_and_labels() {
        let cluster = FakeCluster {
            pods: vec![
                fake::pod("shop", "web", Some("Running"), &["app"]),
                fake::pod("shop", "job", Some("Succeeded"), &["worker"]),
                fake::pod("shop", "new", None, &["app"]),
            ],
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;
        let phases = find(&metrics, "pod_phase");

        let value_of = |pod: &str| {
            phases
                .iter()
                .find(|m| m.labels["pod"] == pod)
                .map(|m| m.value)
                .unwrap()
        };
        assert_eq!(value_of("web"), 1.0);
        assert_eq!(value_of("job"), 3.0);
        assert_eq!(value_of("new"), 0.0);

        let web = phases.iter().find(|m| m.labels["pod"] == "web").unwrap();
        assert_eq!(web.labels["namespace"], "shop");
        assert_eq!(web.labels["node"], "worker-1");
        assert_eq!(web.labels["phase"], "Running");
        assert_eq!(web.labels["label_app"], "web");
        assert_eq!(web.labels["owner_kind"], "ReplicaSet");
        assert_eq!(web.labels["owner_name"], "web-rs");
    }

    #[tokio::test]
    async fn test_restart_counts_are_counters() {
        let pod = fake::pod("default", "api", Some("Running"), &["app", "proxy"]);
        let pod = fake::with_container_status(pod, "app", 7, Some("running"));
        let pod = fake::with_container_status(pod, "proxy", 0, Some("waiting"));

        let cluster = FakeCluster {
            pods: vec![pod],
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;
        let restarts = find(&metrics, "container_restart_count");

        assert_eq!(restarts.len(), 2);
        assert!(restarts.iter().all(|m| m.kind == MetricKind::Counter));
        assert_eq!(restarts[0].labels["container"], "app");
        assert_eq!(restarts[0].value, 7.0);
        assert_eq!(restarts[0].labels["image_id"], "sha256:app");
        assert_eq!(restarts[1].value, 0.0);

        let states = find(&metrics, "container_state");
        assert_eq!(states[0].value, 1.0);
        assert_eq!(states[1].value, 2.0);

        let ready = find(&metrics, "container_ready");
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|m| m.value == 1.0));
    }

    #[tokio::test]
    async fn test_container_requests_and_limits() {
        let cluster = FakeCluster {
            pods: vec![fake::pod("default", "api", Some("Running"), &["app"])],
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;

        let request = find(&metrics, "container_cpu_request_cores")[0];
        assert_eq!(request.value, 0.1);
        assert_eq!(request.labels["image"], "registry.local/app:1.0");
        assert_eq!(find(&metrics, "container_cpu_limit_cores")[0].value, 0.5);
        assert_eq!(
            find(&metrics, "container_memory_request_bytes")[0].value,
            134_217_728.0
        );
        assert_eq!(
            find(&metrics, "container_memory_limit_bytes")[0].value,
            268_435_456.0
        );
    }

    #[tokio::test]
    async fn test_usage_sums_over_containers() {
        let cluster = FakeCluster {
            pods: vec![fake::pod("default", "api", Some("Running"), &["app", "proxy"])],
            pod_usage: vec![fake::pod_usage(
                "default",
                "api",
                &[
                    ("app", fake::resources(&[("cpu", "150m"), ("memory", "100Mi")])),
                    ("proxy", fake::resources(&[("cpu", "50m"), ("memory", "28Mi")])),
                ],
            )],
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;

        assert_eq!(find(&metrics, "pod_cpu_usage_cores")[0].value, 0.2);
        assert_eq!(
            find(&metrics, "pod_memory_usage_bytes")[0].value,
            134_217_728.0
        );

        let container_cpu = find(&metrics, "container_cpu_usage_cores");
        assert_eq!(container_cpu.len(), 2);
        assert_eq!(container_cpu[0].labels["container"], "app");
        assert_eq!(container_cpu[0].value, 0.15);
    }

    #[tokio::test]
    async fn test_zero_usage_sum_not_emitted() {
        let cluster = FakeCluster {
            pods: vec![fake::pod("default", "idle", Some("Running"), &["app"])],
            pod_usage: vec![fake::pod_usage(
                "default",
                "idle",
                &[("app", fake::resources(&[("cpu", "0"), ("memory", "4Mi")]))],
            )],
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;

        assert!(find(&metrics, "pod_cpu_usage_cores").is_empty());
        assert!(find(&metrics, "container_cpu_usage_cores").is_empty());
        assert_eq!(find(&metrics, "pod_memory_usage_bytes").len(), 1);
    }

    #[tokio::test]
    async fn test_usage_matched_by_namespace_and_name() {
        let cluster = FakeCluster {
            pods: vec![fake::pod("prod", "api", Some("Running"), &["app"])],
            pod_usage: vec![fake::pod_usage(
                "staging",
                "api",
                &[("app", fake::resources(&[("cpu", "150m")]))],
            )],
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;
        assert!(find(&metrics, "pod_cpu_usage_cores").is_empty());
    }

    #[tokio::test]
    async fn test_usage_listing_failure_is_partial() {
        let cluster = FakeCluster {
            pods: vec![fake::pod("default", "api", Some("Running"), &["app"])],
            pod_usage: vec![fake::pod_usage(
                "default",
                "api",
                &[("app", fake::resources(&[("cpu", "150m")]))],
            )],
            fail_usage: true,
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;

        assert!(find(&metrics, "pod_cpu_usage_cores").is_empty());
        assert!(find(&metrics, "container_cpu_usage_cores").is_empty());
        assert_eq!(find(&metrics, "pod_phase").len(), 1);
        assert_eq!(find(&metrics, "container_cpu_request_cores").len(), 1);
    }

    #[tokio::test]
    async fn test_pod_conditions_and_ready() {
        let cluster = FakeCluster {
            pods: vec![fake::pod("default", "api", Some("Running"), &["app"])],
            ..FakeCluster::default()
        };

        let metrics = collect(cluster).await;

        assert_eq!(find(&metrics, "pod_ready")[0].value, 1.0);
        let conditions = find(&metrics, "pod_condition");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].labels["condition"], "Ready");
        assert_eq!(conditions[0].labels["reason"], "");

        let age = find(&metrics, "pod_age_seconds")[0].value;
        assert!((599.0..700.0).contains(&age));
    }

    #[tokio::test]
    async fn test_pod_listing_failure() {
        let cluster = FakeCluster {
            fail_objects: true,
            ..FakeCluster::default()
        };

        let err = PodCollector::new(Arc::new(cluster))
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::List { resource: "pods", .. }));
    }
}
