//! Kafka delivery with one batching worker per topic
//!
//! `write` hands the message to the topic's worker over a channel and waits
//! for its acknowledgment. The worker gathers messages until the batch is full
//! or the linger deadline passes, produces them, and acks every caller with
//! its own result. Connecting, broker retries and every produce request are
//! bounded by the configured request timeout.

use super::{BrokerError, BrokerMessage, BrokerWriter, Topics};
use crate::config::{CompressionCodec, KafkaConfig};
use async_trait::async_trait;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use rskafka::BackoffConfig;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

impl From<CompressionCodec> for Compression {
    fn from(codec: CompressionCodec) -> Self {
        match codec {
            CompressionCodec::None => Compression::NoCompression,
            CompressionCodec::Gzip => Compression::Gzip,
            CompressionCodec::Lz4 => Compression::Lz4,
            CompressionCodec::Snappy => Compression::Snappy,
            CompressionCodec::Zstd => Compression::Zstd,
        }
    }
}

/// Destination for a flushed batch
#[async_trait]
pub trait BatchSink: Send + 'static {
    /// Produce a batch; one result per message, in input order
    async fn produce(&mut self, batch: &[BrokerMessage]) -> Vec<Result<(), String>>;

    /// Forget cached connection state after a produce was abandoned
    fn reset(&mut self) {}
}

/// How a worker gathers and sends batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub linger: Duration,
    /// A produce still pending after this fails every record in the batch
    pub produce_timeout: Duration,
}

impl From<&KafkaConfig> for BatchSettings {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            linger: config.batch_timeout(),
            produce_timeout: config.request_timeout(),
        }
    }
}

/// Stable partition for a key (FNV-1a)
pub(crate) fn partition_for(key: &str, partitions: &[i32]) -> i32 {
    if partitions.is_empty() {
        return 0;
    }

    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    partitions[hash as usize % partitions.len()]
}

/// Produces a topic's batches through rskafka, one partition client per partition
pub struct KafkaTopicSink {
    client: Arc<Client>,
    topic: String,
    codec: CompressionCodec,
    partitions: Option<Vec<i32>>,
    producers: HashMap<i32, PartitionClient>,
}

impl KafkaTopicSink {
    pub fn new(client: Arc<Client>, topic: impl Into<String>, codec: CompressionCodec) -> Self {
        Self {
            client,
            topic: topic.into(),
            codec,
            partitions: None,
            producers: HashMap::new(),
        }
    }

    /// Partition ids of the topic, discovered once and cached
    async fn partitions(&mut self) -> Result<Vec<i32>, String> {
        if let Some(partitions) = &self.partitions {
            return Ok(partitions.clone());
        }

        let topics = self.client.list_topics().await.map_err(|e| e.to_string())?;
        let partitions: Vec<i32> = topics
            .into_iter()
            .find(|t| t.name == self.topic)
            .map(|t| t.partitions.into_iter().collect())
            .unwrap_or_default();

        if partitions.is_empty() {
            return Err(format!("topic {} has no partitions", self.topic));
        }

        debug!(topic = %self.topic, partitions = partitions.len(), "Discovered topic partitions");
        self.partitions = Some(partitions.clone());
        Ok(partitions)
    }

    async fn producer(&mut self, partition: i32) -> Result<&PartitionClient, String> {
        match self.producers.entry(partition) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let client = self
                    .client
                    .partition_client(self.topic.clone(), partition, UnknownTopicHandling::Error)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(entry.insert(client))
            }
        }
    }
}

fn to_record(message: &BrokerMessage) -> Record {
    Record {
        key: Some(message.key.as_bytes().to_vec()),
        value: Some(message.payload.clone()),
        headers: BTreeMap::new(),
        timestamp: message.timestamp,
    }
}

#[async_trait]
impl BatchSink for KafkaTopicSink {
    async fn produce(&mut self, batch: &[BrokerMessage]) -> Vec<Result<(), String>> {
        let partitions = match self.partitions().await {
            Ok(partitions) => partitions,
            Err(reason) => return vec![Err(reason); batch.len()],
        };

        let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (index, message) in batch.iter().enumerate() {
            groups
                .entry(partition_for(&message.key, &partitions))
                .or_default()
                .push(index);
        }

        let codec = self.codec;
        let mut results = vec![Ok(()); batch.len()];

        for (partition, indices) in groups {
            let records: Vec<Record> = indices.iter().map(|&i| to_record(&batch[i])).collect();

            let outcome = match self.producer(partition).await {
                Ok(producer) => producer
                    .produce(records, codec.into())
                    .await
                    .map(|_offsets| ())
                    .map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };

            if let Err(reason) = outcome {
                // Rediscover leadership and partitions on the next batch
                self.reset();
                for index in indices {
                    results[index] = Err(reason.clone());
                }
            }
        }

        results
    }

    fn reset(&mut self) {
        self.producers.clear();
        self.partitions = None;
    }
}

struct PendingRecord {
    message: BrokerMessage,
    ack: oneshot::Sender<Result<(), BrokerError>>,
}

struct BatchWorker<S> {
    topic: String,
    sink: S,
    settings: BatchSettings,
}

impl<S: BatchSink> BatchWorker<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<PendingRecord>) {
        let mut batch = Vec::with_capacity(self.settings.batch_size);

        while let Some(first) = rx.recv().await {
            batch.push(first);

            let deadline = Instant::now() + self.settings.linger;
            while batch.len() < self.settings.batch_size {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(record)) => batch.push(record),
                    // Channel closed or linger elapsed
                    Ok(None) | Err(_) => break,
                }
            }

            self.flush(&mut batch).await;
        }

        debug!(topic = %self.topic, "Producer worker stopped");
    }

    async fn flush(&mut self, batch: &mut Vec<PendingRecord>) {
        let (messages, acks): (Vec<_>, Vec<_>) = batch.drain(..).map(|p| (p.message, p.ack)).unzip();

        let produced = timeout(self.settings.produce_timeout, self.sink.produce(&messages)).await;
        let results = match produced {
            Ok(results) => results,
            Err(_) => {
                self.sink.reset();
                let reason = format!(
                    "produce timed out after {}ms",
                    self.settings.produce_timeout.as_millis()
                );
                vec![Err(reason); messages.len()]
            }
        };

        let mut failed = 0usize;
        for (ack, result) in acks.into_iter().zip(results) {
            let result = result.map_err(|reason| BrokerError::Produce {
                topic: self.topic.clone(),
                reason,
            });
            if result.is_err() {
                failed += 1;
            }
            // The writer may have stopped waiting
            let _ = ack.send(result);
        }

        if failed > 0 {
            warn!(topic = %self.topic, batch_size = messages.len(), failed, "Batch partially failed");
        } else {
            debug!(topic = %self.topic, batch_size = messages.len(), "Produced batch");
        }
    }
}

/// Kafka [`BrokerWriter`] with per-topic batching
pub struct KafkaBrokerWriter {
    senders: RwLock<HashMap<String, mpsc::Sender<PendingRecord>>>,
    workers: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl KafkaBrokerWriter {
    /// Connect to the brokers and start a worker for each configured topic
    pub async fn connect(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let backoff = BackoffConfig {
            deadline: Some(config.request_timeout()),
            ..BackoffConfig::default()
        };
        let build = ClientBuilder::new(config.brokers.clone())
            .backoff_config(backoff)
            .build();

        let client = timeout(config.request_timeout(), build)
            .await
            .map_err(|_| {
                BrokerError::Connect(format!(
                    "no broker answered within {}ms",
                    config.request_timeout_ms
                ))
            })?
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let client = Arc::new(client);

        let topics = Topics::from(&config.topics);
        let sinks = topics
            .names()
            .into_iter()
            .map(|topic| {
                (
                    topic.to_string(),
                    KafkaTopicSink::new(client.clone(), topic, config.compression),
                )
            })
            .collect();

        info!(
            brokers = ?config.brokers,
            metrics_topic = %topics.metrics,
            logs_topic = %topics.logs,
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout_ms,
            compression = ?config.compression,
            request_timeout_ms = config.request_timeout_ms,
            "Connected to Kafka"
        );

        Ok(Self::spawn(sinks, BatchSettings::from(config)))
    }

    /// Start one batching worker per `(topic, sink)`
    pub fn spawn<S: BatchSink>(sinks: Vec<(String, S)>, settings: BatchSettings) -> Self {
        let settings = BatchSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        let mut senders = HashMap::new();
        let mut workers = JoinSet::new();

        for (topic, sink) in sinks {
            if senders.contains_key(&topic) {
                continue;
            }

            let (tx, rx) = mpsc::channel(settings.batch_size * 2);
            let worker = BatchWorker {
                topic: topic.clone(),
                sink,
                settings,
            };
            workers.spawn(worker.run(rx));
            senders.insert(topic, tx);
        }

        Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrokerWriter for KafkaBrokerWriter {
    async fn write(&self, topic: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let sender = self.senders.read().await.get(topic).cloned();
        let sender = sender.ok_or_else(|| {
            if self.closed.load(Ordering::SeqCst) {
                BrokerError::Closed
            } else {
                BrokerError::UnknownTopic(topic.to_string())
            }
        })?;

        let (ack, ack_rx) = oneshot::channel();
        sender
            .send(PendingRecord { message, ack })
            .await
            .map_err(|_| BrokerError::Closed)?;

        ack_rx.await.unwrap_or_else(|_| {
            Err(BrokerError::Produce {
                topic: topic.to_string(),
                reason: "producer stopped before acknowledging".to_string(),
            })
        })
    }

    /// Flush pending batches and stop every worker
    ///
    /// Dropping the returned future before it resolves aborts the workers
    /// that are still producing.
    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the senders lets each worker drain its channel and exit
        self.senders.write().await.clear();

        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Producer worker terminated abnormally");
            }
        }

        info!("Broker writer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Sink recording batch sizes; keys listed in `failing` are rejected
    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<StdMutex<Vec<Vec<String>>>>,
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn produce(&mut self, batch: &[BrokerMessage]) -> Vec<Result<(), String>> {
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|m| m.key.clone()).collect());

            batch
                .iter()
                .map(|m| {
                    if self.failing.contains(&m.key.as_str()) {
                        Err("NOT_LEADER_FOR_PARTITION".to_string())
                    } else {
                        Ok(())
                    }
                })
                .collect()
        }
    }

    /// Never finishes a produce
    #[derive(Clone, Default)]
    struct HangingSink {
        resets: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchSink for HangingSink {
        async fn produce(&mut self, _batch: &[BrokerMessage]) -> Vec<Result<(), String>> {
            std::future::pending().await
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(batch_size: usize, linger: Duration) -> BatchSettings {
        BatchSettings {
            batch_size,
            linger,
            produce_timeout: Duration::from_secs(5),
        }
    }

    fn message(key: &str) -> BrokerMessage {
        BrokerMessage {
            key: key.to_string(),
            payload: b"{}".to_vec(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_partition_for_is_stable() {
        let partitions = [0, 1, 2, 3, 4, 5];
        let first = partition_for("node_cpu_usage_cores", &partitions);

        for _ in 0..10 {
            assert_eq!(partition_for("node_cpu_usage_cores", &partitions), first);
        }
        assert!(partitions.contains(&first));
        assert_eq!(partition_for("anything", &[7]), 7);
        assert_eq!(partition_for("anything", &[]), 0);
    }

    #[test]
    fn test_compression_mapping() {
        assert!(matches!(
            Compression::from(CompressionCodec::Snappy),
            Compression::Snappy
        ));
        assert!(matches!(
            Compression::from(CompressionCodec::None),
            Compression::NoCompression
        ));
    }

    #[tokio::test]
    async fn test_batch_flushes_when_full() {
        let sink = RecordingSink::default();
        let writer = KafkaBrokerWriter::spawn(
            vec![("metrics".to_string(), sink.clone())],
            settings(3, Duration::from_secs(30)),
        );

        let writes = async {
            tokio::join!(
                writer.write("metrics", message("a")),
                writer.write("metrics", message("b")),
                writer.write("metrics", message("c")),
            )
        };
        let (a, b, c) = tokio::time::timeout(Duration::from_secs(5), writes)
            .await
            .expect("full batch should flush without waiting for linger");

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_after_linger() {
        let sink = RecordingSink::default();
        let writer = KafkaBrokerWriter::spawn(
            vec![("logs".to_string(), sink.clone())],
            settings(100, Duration::from_millis(20)),
        );

        writer.write("logs", message("Warning")).await.unwrap();

        assert_eq!(*sink.batches.lock().unwrap(), vec![vec!["Warning".to_string()]]);
    }

    #[tokio::test]
    async fn test_failure_acknowledged_per_record() {
        let sink = RecordingSink {
            failing: vec!["bad"],
            ..RecordingSink::default()
        };
        let writer = KafkaBrokerWriter::spawn(
            vec![("metrics".to_string(), sink)],
            settings(2, Duration::from_secs(30)),
        );

        let (good, bad) = tokio::join!(
            writer.write("metrics", message("good")),
            writer.write("metrics", message("bad")),
        );

        assert!(good.is_ok());
        match bad {
            Err(BrokerError::Produce { topic, reason }) => {
                assert_eq!(topic, "metrics");
                assert_eq!(reason, "NOT_LEADER_FOR_PARTITION");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let writer = KafkaBrokerWriter::spawn(
            vec![("metrics".to_string(), RecordingSink::default())],
            settings(10, Duration::from_millis(5)),
        );

        let err = writer.write("traces", message("x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(ref t) if t == "traces"));
    }

    #[tokio::test]
    async fn test_close_rejects_later_writes() {
        let sink = RecordingSink::default();
        let writer = KafkaBrokerWriter::spawn(
            vec![("metrics".to_string(), sink.clone())],
            settings(10, Duration::from_millis(5)),
        );

        writer.write("metrics", message("before")).await.unwrap();
        writer.close().await.unwrap();
        // Second close is a no-op
        writer.close().await.unwrap();

        let err = writer.write("metrics", message("after")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_in_flight_writes() {
        let sink = RecordingSink::default();
        let writer = Arc::new(KafkaBrokerWriter::spawn(
            vec![("metrics".to_string(), sink.clone())],
            settings(100, Duration::from_millis(200)),
        ));

        let in_flight = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.write("metrics", message("pending")).await })
        };
        // Let the write reach the worker before closing
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.close().await.unwrap();

        assert!(in_flight.await.unwrap().is_ok());
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_topic_names_share_one_worker() {
        let sink = RecordingSink::default();
        let writer = KafkaBrokerWriter::spawn(
            vec![
                ("events".to_string(), sink.clone()),
                ("events".to_string(), sink.clone()),
            ],
            settings(10, Duration::from_millis(5)),
        );

        assert_eq!(writer.workers.lock().await.len(), 1);
        writer.write("events", message("x")).await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_produce_fails_the_batch() {
        let sink = HangingSink::default();
        let writer = KafkaBrokerWriter::spawn(
            vec![("metrics".to_string(), sink.clone())],
            BatchSettings {
                batch_size: 10,
                linger: Duration::from_millis(5),
                produce_timeout: Duration::from_millis(50),
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(2), writer.write("metrics", message("a")))
            .await
            .expect("write should fail once the produce timeout passes");

        match result {
            Err(BrokerError::Produce { topic, reason }) => {
                assert_eq!(topic, "metrics");
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(sink.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_close_aborts_stuck_workers() {
        let writer = Arc::new(KafkaBrokerWriter::spawn(
            vec![("metrics".to_string(), HangingSink::default())],
            BatchSettings {
                batch_size: 1,
                linger: Duration::from_millis(1),
                produce_timeout: Duration::from_secs(3600),
            },
        ));

        let in_flight = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.write("metrics", message("stuck")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closed = tokio::time::timeout(Duration::from_millis(50), writer.close()).await;
        assert!(closed.is_err());

        // The aborted worker drops the pending ack
        let result = tokio::time::timeout(Duration::from_secs(1), in_flight)
            .await
            .expect("in-flight write should resolve once its worker is aborted")
            .unwrap();
        assert!(matches!(result, Err(BrokerError::Produce { .. })));
        assert!(matches!(
            writer.write("metrics", message("after")).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_gives_up_on_unreachable_brokers() {
        let config = KafkaConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            request_timeout_ms: 200,
            ..KafkaConfig::default()
        };

        let result = tokio::time::timeout(Duration::from_secs(5), KafkaBrokerWriter::connect(&config))
            .await
            .expect("connect should be bounded by the request timeout");

        assert!(matches!(result, Err(BrokerError::Connect(_))));
    }
}
