//! Incremental cluster event collection
//!
//! The collector keeps a watermark: the newest last-seen timestamp it has
//! already emitted. Each call lists every event cluster-wide and keeps only
//! those seen strictly after the watermark, then moves the watermark forward
//! to the newest kept event. Events without a last-seen timestamp are never
//! kept.

use super::{CollectError, Collector, Source};
use crate::cluster::ClusterApi;
use crate::models::{Event, EventObject, EventSeverity, Labels};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Event as KubeEvent;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How far back a fresh collector starts, in seconds
pub const WATERMARK_LOOKBACK_SECS: i64 = 300;

fn lookback() -> Duration {
    Duration::seconds(WATERMARK_LOOKBACK_SECS)
}

/// Composite IDs longer than this are replaced by a random UUID
const MAX_ID_LEN: usize = 100;

const ERROR_REASONS: &[&str] = &[
    "Failed",
    "FailedScheduling",
    "FailedMount",
    "FailedAttachVolume",
    "FailedDetachVolume",
    "FailedCreate",
    "FailedDelete",
    "Unhealthy",
    "BackOff",
    "Evicted",
    "Preempting",
    "OutOfDisk",
    "FreeDiskSpaceFailed",
];

const CRITICAL_REASONS: &[&str] = &[
    "Killing",
    "NetworkNotReady",
    "NodeNotReady",
    "Rebooted",
    "NodeAllocatableEnforced",
    "SystemOOM",
    "ContainerGCFailed",
];

/// Severity from event type and reason. Only `Warning` events escalate.
pub fn severity_for(event_type: &str, reason: &str) -> EventSeverity {
    if event_type != "Warning" {
        return EventSeverity::Info;
    }

    if ERROR_REASONS.contains(&reason) {
        EventSeverity::Error
    } else if CRITICAL_REASONS.contains(&reason) {
        EventSeverity::Critical
    } else {
        EventSeverity::Warning
    }
}

/// `{namespace}-{object}-{reason}-{uid}-{first seen unix seconds}`.
///
/// Falls back to a random UUID v4 when the composite is too long, which means
/// a replayed event may get a different ID.
pub fn event_id(event: &KubeEvent) -> String {
    let first_seen = event
        .first_timestamp
        .as_ref()
        .map(|t| t.0.timestamp())
        .unwrap_or(0);

    let id = format!(
        "{}-{}-{}-{}-{}",
        event.metadata.namespace.as_deref().unwrap_or_default(),
        event.involved_object.name.as_deref().unwrap_or_default(),
        event.reason.as_deref().unwrap_or_default(),
        event.involved_object.uid.as_deref().unwrap_or_default(),
        first_seen,
    );

    if id.len() > MAX_ID_LEN {
        let fallback = uuid::Uuid::new_v4().to_string();
        warn!(
            composite_len = id.len(),
            event_id = %fallback,
            "Event ID too long, substituting random ID (not reproducible across replays)"
        );
        return fallback;
    }

    id
}

/// Collects cluster events newer than its watermark
pub struct EventCollector {
    api: Arc<dyn ClusterApi>,
    watermark: DateTime<Utc>,
}

impl EventCollector {
    /// Start five minutes in the past
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self::with_watermark(api, Utc::now() - lookback())
    }

    /// Resume from a checkpoint
    pub fn with_watermark(api: Arc<dyn ClusterApi>, watermark: DateTime<Utc>) -> Self {
        Self { api, watermark }
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn set_watermark(&mut self, watermark: DateTime<Utc>) {
        self.watermark = watermark;
        info!(watermark = %watermark, "Updated event collection watermark");
    }

    /// Back to five minutes before now
    pub fn reset(&mut self) {
        self.watermark = Utc::now() - lookback();
        info!(watermark = %self.watermark, "Event collector state reset");
    }

    fn convert(event: &KubeEvent, last_seen: DateTime<Utc>) -> Event {
        let event_type = event.type_.clone().unwrap_or_default();
        let reason = event.reason.clone().unwrap_or_default();
        let component = event
            .source
            .as_ref()
            .and_then(|s| s.component.clone())
            .unwrap_or_default();
        let host = event
            .source
            .as_ref()
            .and_then(|s| s.host.clone())
            .unwrap_or_default();
        let involved = &event.involved_object;

        let object = EventObject {
            kind: involved.kind.clone().unwrap_or_default(),
            name: involved.name.clone().unwrap_or_default(),
            namespace: involved.namespace.clone().unwrap_or_default(),
            uid: involved.uid.clone().unwrap_or_default(),
        };

        let mut labels = Labels::new();
        labels.insert(
            "namespace".to_string(),
            event.metadata.namespace.clone().unwrap_or_default(),
        );
        labels.insert("component".to_string(), component.clone());
        labels.insert("host".to_string(), host.clone());
        labels.insert("kind".to_string(), object.kind.clone());
        labels.insert("name".to_string(), object.name.clone());
        labels.insert("reason".to_string(), reason.clone());
        labels.insert("type".to_string(), event_type.clone());

        if let Some(version) = involved.resource_version.as_ref().filter(|v| !v.is_empty()) {
            labels.insert("resource_version".to_string(), version.clone());
        }
        if let Some(path) = involved.field_path.as_ref().filter(|p| !p.is_empty()) {
            labels.insert("field_path".to_string(), path.clone());
        }
        if let Some(count) = event.count.filter(|c| *c > 0) {
            labels.insert("count".to_string(), count.to_string());
        }

        Event {
            id: event_id(event),
            severity: severity_for(&event_type, &reason),
            event_type,
            reason,
            message: event.message.clone().unwrap_or_default(),
            source: format!("{component}/{host}"),
            timestamp: last_seen,
            object,
            labels,
        }
    }
}

#[async_trait]
impl Collector for EventCollector {
    type Record = Event;

    fn source(&self) -> Source {
        Source::Events
    }

    async fn collect(&mut self) -> Result<Vec<Event>, CollectError> {
        let start = Instant::now();

        let listed = self
            .api
            .list_events()
            .await
            .map_err(CollectError::list("events"))?;

        let mut newest = self.watermark;
        let mut events = Vec::new();

        for event in &listed {
            let Some(last_seen) = event.last_timestamp.as_ref().map(|t| t.0) else {
                continue;
            };
            if last_seen <= self.watermark {
                continue;
            }

            events.push(Self::convert(event, last_seen));
            newest = newest.max(last_seen);
        }

        self.watermark = newest;

        debug!(
            total_events = listed.len(),
            collected_events = events.len(),
            watermark = %self.watermark,
            duration_ms = start.elapsed().as_millis() as u64,
            "Collected events"
        );

        Ok(events)
    }
}
