//! Collection supervisor
//!
//! Owns one polling loop per source (runtime, nodes, pods, events). Each loop
//! ticks on its own interval, collects a snapshot, publishes every record to
//! the broker one at a time, and reports the cycle to the metrics recorder.
//! A failing cycle is logged and counted; the loop keeps going.
//!
//! Lifecycle: `Idle -> Running -> Draining -> Stopped`. `stop` holds to its
//! deadline: loops still running are aborted, and a writer that cannot flush
//! in the remaining time is abandoned.

use crate::broker::{encode, BrokerError, BrokerWriter, Topics};
use crate::cluster::ClusterApi;
use crate::collector::{
    Collector, EventCollector, NodeCollector, PodCollector, RuntimeCollector, Source,
};
use crate::config::CollectionConfig;
use crate::health::{components, HealthRegistry};
use crate::models::TelemetryRecord;
use crate::observability::MetricsRecorder;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot start supervisor in state {0:?}")]
    InvalidState(SupervisorState),

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("failed to close broker writer: {0}")]
    Close(#[from] BrokerError),

    #[error("broker writer did not close within the {0:?} shutdown deadline")]
    CloseTimeout(Duration),
}

/// Poll interval per source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub runtime: Duration,
    pub nodes: Duration,
    pub pods: Duration,
    pub events: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self::from(&CollectionConfig::default())
    }
}

impl From<&CollectionConfig> for Intervals {
    fn from(config: &CollectionConfig) -> Self {
        Self {
            runtime: config.runtime_interval(),
            nodes: config.node_interval(),
            pods: config.pod_interval(),
            events: config.event_interval(),
        }
    }
}

/// Runs and stops the collection loops
pub struct CollectionSupervisor {
    api: Arc<dyn ClusterApi>,
    writer: Arc<dyn BrokerWriter>,
    recorder: Arc<dyn MetricsRecorder>,
    health: HealthRegistry,
    topics: Topics,
    intervals: Intervals,
    state: watch::Sender<SupervisorState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl CollectionSupervisor {
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Spawn every loop and block until [`stop`](Self::stop) is called
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut observed = SupervisorState::Idle;
        let started = self.state.send_if_modified(|state| {
            observed = *state;
            if *state == SupervisorState::Idle {
                *state = SupervisorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SupervisorError::InvalidState(observed));
        }

        let mut shutdown = self.shutdown.subscribe();

        {
            let mut tasks = self.tasks.lock().await;
            // stop() was called while this start waited for the lock
            if *self.shutdown.borrow() {
                info!("Stop requested before the collection loops started");
                return Ok(());
            }

            self.health.register(components::CLUSTER).await;
            self.health.register(components::BROKER).await;

            let runtime = RuntimeCollector::new().with_recorder(self.recorder.clone());
            self.spawn_loop(&mut tasks, runtime, self.intervals.runtime)
                .await;
            self.spawn_loop(&mut tasks, NodeCollector::new(self.api.clone()), self.intervals.nodes)
                .await;
            self.spawn_loop(&mut tasks, PodCollector::new(self.api.clone()), self.intervals.pods)
                .await;
            self.spawn_loop(&mut tasks, EventCollector::new(self.api.clone()), self.intervals.events)
                .await;

            // Under the lock, so a concurrent stop clears it afterwards
            self.health.set_ready(true).await;
        }

        info!(
            runtime_interval_secs = self.intervals.runtime.as_secs(),
            node_interval_secs = self.intervals.nodes.as_secs(),
            pod_interval_secs = self.intervals.pods.as_secs(),
            event_interval_secs = self.intervals.events.as_secs(),
            "Collection supervisor running"
        );

        cancelled(&mut shutdown).await;
        Ok(())
    }

    async fn spawn_loop<C>(&self, tasks: &mut JoinSet<()>, collector: C, interval: Duration)
    where
        C: Collector + 'static,
    {
        self.health.register(collector.source().component()).await;

        let source_loop = SourceLoop {
            topic: self.topics.resolve(<C::Record as TelemetryRecord>::TOPIC).to_string(),
            collector,
            interval,
            writer: self.writer.clone(),
            recorder: self.recorder.clone(),
            health: self.health.clone(),
        };
        tasks.spawn(source_loop.run(self.shutdown.subscribe()));
    }

    /// Cancel every loop, wait for them up to `deadline`, then close the writer
    ///
    /// Loops still running at the deadline are aborted, and the writer gets
    /// whatever time remains. Calling `stop` again once draining has begun is
    /// a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<(), SupervisorError> {
        let draining = self.state.send_if_modified(|state| match state {
            SupervisorState::Idle | SupervisorState::Running => {
                *state = SupervisorState::Draining;
                true
            }
            SupervisorState::Draining | SupervisorState::Stopped => false,
        });
        if !draining {
            return Ok(());
        }

        let started = Instant::now();
        info!(deadline_secs = deadline.as_secs(), "Stopping collection loops");
        self.shutdown.send_replace(true);

        let mut tasks = self.tasks.lock().await;
        self.health.set_ready(false).await;
        let drained = tokio::time::timeout(deadline, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Collection loop terminated abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                deadline_secs = deadline.as_secs(),
                "Collection loops did not stop before the deadline, aborting"
            );
            tasks.abort_all();
        }
        drop(tasks);

        let remaining = deadline.saturating_sub(started.elapsed());
        let closed = match tokio::time::timeout(remaining, self.writer.close()).await {
            Ok(result) => result.map_err(SupervisorError::from),
            Err(_) => {
                warn!(
                    deadline_secs = deadline.as_secs(),
                    "Broker writer did not flush before the deadline, dropping pending records"
                );
                Err(SupervisorError::CloseTimeout(deadline))
            }
        };
        if let Err(e) = &closed {
            self.health.set_unhealthy(components::BROKER, e.to_string()).await;
        }

        self.state.send_replace(SupervisorState::Stopped);
        info!("Collection supervisor stopped");

        closed
    }
}

/// Resolves once a stop has been requested (or the supervisor is gone)
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Outcome of one collection cycle
#[derive(Debug, Default, PartialEq, Eq)]
struct CycleReport {
    collected: usize,
    published: usize,
    failed: bool,
}

struct SourceLoop<C> {
    collector: C,
    interval: Duration,
    topic: String,
    writer: Arc<dyn BrokerWriter>,
    recorder: Arc<dyn MetricsRecorder>,
    health: HealthRegistry,
}

impl<C: Collector> SourceLoop<C> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let source = self.collector.source();
        info!(
            source = source.kind(),
            interval_secs = self.interval.as_secs(),
            topic = %self.topic,
            "Starting collection loop"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&mut shutdown) => break,
            }

            // An in-flight cycle is abandoned on stop
            tokio::select! {
                report = self.run_cycle() => {
                    debug!(
                        source = source.kind(),
                        collected = report.collected,
                        published = report.published,
                        failed = report.failed,
                        "Collection cycle complete"
                    );
                }
                _ = cancelled(&mut shutdown) => break,
            }
        }

        info!(source = source.kind(), "Collection loop stopped");
    }

    async fn run_cycle(&mut self) -> CycleReport {
        let source = self.collector.source();
        let started = Instant::now();

        let records = match self.collector.collect().await {
            Ok(records) => records,
            Err(e) => {
                error!(source = source.kind(), error = %e, "Collection failed");
                self.recorder
                    .record_collection(source.origin(), source.kind(), started.elapsed(), 0, true);
                self.health
                    .set_degraded(source.component(), e.to_string())
                    .await;
                // Every collection error is a failed cluster listing
                self.health
                    .set_unhealthy(components::CLUSTER, e.to_string())
                    .await;
                return CycleReport {
                    failed: true,
                    ..CycleReport::default()
                };
            }
        };

        if source != Source::Runtime {
            self.health.set_healthy(components::CLUSTER).await;
        }

        let mut report = CycleReport {
            collected: records.len(),
            ..CycleReport::default()
        };
        let mut last_publish_error = None;

        for record in &records {
            let message = match encode(record) {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        source = source.kind(),
                        key = record.natural_key(),
                        error = %e,
                        "Dropping record that failed to serialize"
                    );
                    continue;
                }
            };

            match self.writer.write(&self.topic, message).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    warn!(
                        source = source.kind(),
                        topic = %self.topic,
                        key = record.natural_key(),
                        error = %e,
                        "Failed to publish record"
                    );
                    self.recorder
                        .record_publish_error(source.origin(), source.kind());
                    last_publish_error = Some(e);
                }
            }
        }

        match last_publish_error {
            Some(e) if report.published == 0 => {
                self.health
                    .set_unhealthy(components::BROKER, e.to_string())
                    .await;
            }
            _ if report.published > 0 => self.health.set_healthy(components::BROKER).await,
            _ => {}
        }

        self.recorder.record_collection(
            source.origin(),
            source.kind(),
            started.elapsed(),
            report.collected,
            false,
        );
        self.health.set_healthy(source.component()).await;

        report
    }
}

/// Builder for the collection supervisor
pub struct SupervisorBuilder {
    api: Option<Arc<dyn ClusterApi>>,
    writer: Option<Arc<dyn BrokerWriter>>,
    recorder: Option<Arc<dyn MetricsRecorder>>,
    health: HealthRegistry,
    topics: Topics,
    intervals: Intervals,
}

impl SupervisorBuilder {
    /// Create a new builder with default topics and intervals
    pub fn new() -> Self {
        Self {
            api: None,
            writer: None,
            recorder: None,
            health: HealthRegistry::new(),
            topics: Topics::from(&crate::config::TopicsConfig::default()),
            intervals: Intervals::default(),
        }
    }

    /// Set the cluster API shared by the node, pod and event loops
    pub fn cluster(mut self, api: Arc<dyn ClusterApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Set the broker writer
    pub fn writer(mut self, writer: Arc<dyn BrokerWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Set the metrics recorder
    pub fn recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Share a health registry with the HTTP server
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    pub fn intervals(mut self, intervals: Intervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn build(self) -> Result<CollectionSupervisor, SupervisorError> {
        let api = self.api.ok_or(SupervisorError::Missing("cluster api"))?;
        let writer = self.writer.ok_or(SupervisorError::Missing("broker writer"))?;
        let recorder = self
            .recorder
            .ok_or(SupervisorError::Missing("metrics recorder"))?;

        let (state, _) = watch::channel(SupervisorState::Idle);
        let (shutdown, _) = watch::channel(false);

        Ok(CollectionSupervisor {
            api,
            writer,
            recorder,
            health: self.health,
            topics: self.topics,
            intervals: self.intervals,
            state,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
