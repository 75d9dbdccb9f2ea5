//! In-memory `ClusterApi` and object builders for tests

use super::{ClusterApi, ClusterError, ContainerUsage, NodeUsage, PodUsage, ResourceUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, Event, EventSource, Node, NodeCondition, NodeSpec,
    NodeStatus, NodeSystemInfo, ObjectReference, Pod, PodCondition, PodSpec, PodStatus,
    ResourceRequirements, Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fake cluster with canned listings and per-call failure switches
#[derive(Default)]
pub struct FakeCluster {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
    pub events: Mutex<Vec<Event>>,
    pub node_usage: Vec<NodeUsage>,
    pub pod_usage: Vec<PodUsage>,
    pub fail_objects: bool,
    pub fail_usage: bool,
    pub list_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    pub fn push_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn objects<T: Clone>(&self, items: &[T]) -> Result<Vec<T>, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_objects {
            return Err(ClusterError::Unavailable("connection refused".to_string()));
        }
        Ok(items.to_vec())
    }

    fn usage<T: Clone>(&self, items: &[T]) -> Result<Vec<T>, ClusterError> {
        if self.fail_usage {
            return Err(ClusterError::Unavailable(
                "the server could not find the requested resource".to_string(),
            ));
        }
        Ok(items.to_vec())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.objects(&self.nodes)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        self.objects(&self.pods)
    }

    async fn list_events(&self) -> Result<Vec<Event>, ClusterError> {
        let events = self.events.lock().unwrap().clone();
        self.objects(&events)
    }

    async fn list_node_usage(&self) -> Result<Vec<NodeUsage>, ClusterError> {
        self.usage(&self.node_usage)
    }

    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>, ClusterError> {
        self.usage(&self.pod_usage)
    }
}

pub fn resources(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

pub fn node_usage(name: &str, pairs: &[(&str, &str)]) -> NodeUsage {
    NodeUsage {
        name: name.to_string(),
        usage: resources(pairs),
    }
}

pub fn pod_usage(namespace: &str, name: &str, containers: &[(&str, ResourceUsage)]) -> PodUsage {
    PodUsage {
        name: name.to_string(),
        namespace: namespace.to_string(),
        containers: containers
            .iter()
            .map(|(n, usage)| ContainerUsage {
                name: n.to_string(),
                usage: usage.clone(),
            })
            .collect(),
    }
}

/// Node builder with a Ready condition and common capacity
pub fn node(name: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "kubernetes.io/os".to_string(),
                "linux".to_string(),
            )])),
            creation_timestamp: Some(Time(Utc::now() - chrono::Duration::hours(1))),
            ..ObjectMeta::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            capacity: Some(resources(&[
                ("cpu", "4"),
                ("memory", "16Gi"),
                ("pods", "110"),
                ("ephemeral-storage", "100Gi"),
            ])),
            allocatable: Some(resources(&[
                ("cpu", "3800m"),
                ("memory", "15Gi"),
                ("pods", "110"),
            ])),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                reason: Some("KubeletReady".to_string()),
                ..NodeCondition::default()
            }]),
            node_info: Some(NodeSystemInfo {
                architecture: "amd64".to_string(),
                operating_system: "linux".to_string(),
                kernel_version: "6.1.0".to_string(),
                container_runtime_version: "containerd://1.7.2".to_string(),
                kubelet_version: "v1.28.3".to_string(),
                kube_proxy_version: "v1.28.3".to_string(),
                ..NodeSystemInfo::default()
            }),
            ..NodeStatus::default()
        }),
    }
}

pub fn with_taint(mut node: Node, key: &str, value: Option<&str>, effect: &str) -> Node {
    let spec = node.spec.get_or_insert_with(NodeSpec::default);
    spec.taints.get_or_insert_with(Vec::new).push(Taint {
        key: key.to_string(),
        value: value.map(str::to_string),
        effect: effect.to_string(),
        ..Taint::default()
    });
    node
}

/// Pod builder with one container per name
pub fn pod(namespace: &str, name: &str, phase: Option<&str>, containers: &[&str]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
            owner_references: Some(vec![OwnerReference {
                kind: "ReplicaSet".to_string(),
                name: format!("{name}-rs"),
                ..OwnerReference::default()
            }]),
            creation_timestamp: Some(Time(Utc::now() - chrono::Duration::minutes(10))),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some("worker-1".to_string()),
            containers: containers
                .iter()
                .map(|c| Container {
                    name: c.to_string(),
                    image: Some(format!("registry.local/{c}:1.0")),
                    resources: Some(ResourceRequirements {
                        requests: Some(resources(&[("cpu", "100m"), ("memory", "128Mi")])),
                        limits: Some(resources(&[("cpu", "500m"), ("memory", "256Mi")])),
                        ..ResourceRequirements::default()
                    }),
                    ..Container::default()
                })
                .collect(),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: phase.map(str::to_string),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        }),
    }
}

/// Attach a container status to a pod
pub fn with_container_status(
    mut pod: Pod,
    container: &str,
    restarts: i32,
    state: Option<&str>,
) -> Pod {
    let state = state.map(|s| match s {
        "running" => ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..ContainerState::default()
        },
        "waiting" => ContainerState {
            waiting: Some(ContainerStateWaiting::default()),
            ..ContainerState::default()
        },
        _ => ContainerState {
            terminated: Some(ContainerStateTerminated::default()),
            ..ContainerState::default()
        },
    });

    let status = pod.status.get_or_insert_with(PodStatus::default);
    status
        .container_statuses
        .get_or_insert_with(Vec::new)
        .push(ContainerStatus {
            name: container.to_string(),
            image: format!("registry.local/{container}:1.0"),
            image_id: format!("sha256:{container}"),
            ready: true,
            restart_count: restarts,
            state,
            ..ContainerStatus::default()
        });
    pod
}

/// Event builder; `last_seen` of `None` models an event without lastTimestamp
pub fn event(
    namespace: &str,
    object: &str,
    event_type: &str,
    reason: &str,
    last_seen: Option<DateTime<Utc>>,
) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{object}.17a")),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        involved_object: ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(object.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{object}")),
            ..ObjectReference::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(format!("{reason} for {object}")),
        source: Some(EventSource {
            component: Some("kubelet".to_string()),
            host: Some("worker-1".to_string()),
        }),
        first_timestamp: last_seen.map(Time),
        last_timestamp: last_seen.map(Time),
        ..Event::default()
    }
}
