//! Main Redpanda/Kafka consumer implementation

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::consumer::{
    backpressure::BackpressureController,
    config::ConsumerConfig,
    error::{ConsumerError, ConsumerResult, ErrorSeverity},
    offset_manager::OffsetManager,
    shutdown::{ShutdownCoordinator, ShutdownState},
};
use crate::metrics::PipelineMetrics;
use crate::pipeline::EventPipeline;
use crate::router::partition_for;
use crate::sink::{DeadLetterSink, SnapshotSink};

/// Kafka properties that may be passed through from configuration
const ALLOWED_KAFKA_PROPS: &[&str] = &[
    "compression.type",
    "fetch.min.bytes",
    "fetch.max.wait.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    "request.timeout.ms",
    "metadata.max.age.ms",
    "queued.min.messages",
    "queued.max.messages.kbytes",
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "socket.keepalive.enable",
    "statistics.interval.ms",
    "security.protocol",
    "sasl.mechanisms",
    "sasl.username",
    "sasl.password",
    "ssl.ca.location",
];

/// A message handed to a worker
struct WorkItem {
    topic: String,
    partition: i32,
    offset: i64,
    payload: Vec<u8>,
}

impl WorkItem {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().unwrap_or_default().to_vec(),
        }
    }
}

/// Consumer feeding per-worker aggregation pipelines
///
/// Each worker owns one [`EventPipeline`] and therefore one disjoint slice of
/// aggregation state. Messages are routed to workers by tenant hash, so all
/// windows and sessions of a tenant are updated by the same worker in
/// partition order.
pub struct AggregatorConsumer<S, D> {
    config: ConsumerConfig,
    consumer: Arc<StreamConsumer>,
    offsets: Arc<OffsetManager>,
    backpressure: Arc<BackpressureController>,
    shutdown: Arc<ShutdownState>,
    metrics: Arc<PipelineMetrics>,
    pipelines: Vec<EventPipeline<S, D>>,
    sweep_interval: Duration,
}

impl<S, D> AggregatorConsumer<S, D>
where
    S: SnapshotSink + 'static,
    D: DeadLetterSink + 'static,
{
    /// Connect, subscribe and build one pipeline per worker with `factory`
    pub fn new<F>(
        config: ConsumerConfig,
        sweep_interval: Duration,
        mut factory: F,
    ) -> ConsumerResult<Self>
    where
        F: FnMut(usize) -> EventPipeline<S, D>,
    {
        config.validate().map_err(ConsumerError::Config)?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .set("auto.offset.reset", &config.auto_offset_reset);

        for (key, value) in &config.kafka_properties {
            if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
                return Err(ConsumerError::Config(format!(
                    "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                    key, ALLOWED_KAFKA_PROPS
                )));
            }
            client_config.set(key, value);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| ConsumerError::Connection(format!("Failed to create consumer: {}", e)))?;

        let topics: Vec<&str> = config.topics.iter().map(|s| s.as_str()).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| ConsumerError::Connection(format!("Failed to subscribe: {}", e)))?;
        info!("Subscribed to topics: {:?}", config.topics);

        let metrics = Arc::new(PipelineMetrics::new());
        let pipelines = (0..config.num_workers)
            .map(|worker| factory(worker).with_metrics(metrics.clone()))
            .collect();

        Ok(Self {
            backpressure: Arc::new(BackpressureController::new(
                config.max_inflight_messages,
                config.pause_threshold,
                config.resume_threshold,
            )),
            consumer: Arc::new(consumer),
            offsets: Arc::new(OffsetManager::new()),
            shutdown: Arc::new(ShutdownState::new()),
            metrics,
            pipelines,
            sweep_interval,
            config,
        })
    }

    /// Counters shared by all workers
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Handle for requesting shutdown from outside
    pub fn shutdown_handle(&self) -> Arc<ShutdownState> {
        self.shutdown.clone()
    }

    /// Consume until Ctrl-C, an external shutdown, or a fatal worker error
    pub async fn run(mut self) -> ConsumerResult<()> {
        info!(
            "Starting aggregator consumer with {} workers",
            self.pipelines.len()
        );

        let mut senders = Vec::with_capacity(self.pipelines.len());
        let mut workers = Vec::with_capacity(self.pipelines.len());
        for (worker_id, pipeline) in std::mem::take(&mut self.pipelines).into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(self.config.worker_queue_size);
            senders.push(tx);
            workers.push(self.spawn_worker(worker_id, pipeline, rx));
        }

        let committer = self.spawn_offset_committer();
        let reporter = self.spawn_metrics_reporter();

        self.consume(senders).await;

        // Workers drain their queues once the senders are dropped
        let coordinator = ShutdownCoordinator::new(
            self.shutdown.clone(),
            self.backpressure.clone(),
            self.config.shutdown_timeout,
        );
        if let Err(e) = coordinator.shutdown("consumer loop stopped").await {
            warn!("{}", e);
        }

        let mut first_error = None;
        for (worker_id, handle) in workers.into_iter().enumerate() {
            match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
                Ok(Ok(Ok(()))) => debug!("Worker {} stopped", worker_id),
                Ok(Ok(Err(e))) => {
                    report(&format!("Worker {} failed", worker_id), &e);
                    first_error.get_or_insert(e);
                }
                Ok(Err(e)) => error!("Worker {} panicked: {}", worker_id, e),
                Err(_) => warn!("Worker {} did not stop within timeout", worker_id),
            }
        }

        match committer.await {
            Ok(()) => debug!("Offset committer stopped"),
            Err(e) => error!("Offset committer panicked: {}", e),
        }
        reporter.abort();

        match self.offsets.commit(&*self.consumer) {
            Ok(n) => info!("Final offsets committed for {} partitions", n),
            Err(e) => report("Failed to commit final offsets", &e),
        }
        info!("Final stats: {:?}", self.metrics.snapshot());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read messages and hand them to workers until shutdown
    async fn consume(&self, senders: Vec<mpsc::Sender<WorkItem>>) {
        let consumer = self.consumer.clone();
        let mut stream = consumer.stream();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut resume_ticker = tokio::time::interval(Duration::from_millis(100));

        while !self.shutdown.is_shutting_down() {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::signal::ctrl_c() => {
                    self.shutdown.begin_shutdown("Ctrl-C received");
                    break;
                }
                _ = resume_ticker.tick() => {
                    if self.backpressure.should_resume() {
                        self.set_paused(false);
                    }
                }
                message = stream.next() => match message.map(|m| m.map(|m| WorkItem::from_message(&m))) {
                    Some(Ok(item)) => {
                        self.offsets.track(&item.topic, item.partition, item.offset);
                        self.backpressure.acquire();
                        if self.backpressure.should_pause() {
                            self.set_paused(true);
                        }

                        let worker = partition_for(&item.payload, senders.len());
                        if senders[worker].send(item).await.is_err() {
                            warn!("Worker {} queue closed", worker);
                            self.shutdown.begin_shutdown("worker stopped");
                            break;
                        }
                    }
                    Some(Err(e)) => error!("Kafka error: {}", e),
                    None => break,
                },
            }
        }

        info!("Consumer loop stopped");
    }

    fn set_paused(&self, paused: bool) {
        let result = self.consumer.assignment().and_then(|assignment| {
            if paused {
                self.consumer.pause(&assignment)
            } else {
                self.consumer.resume(&assignment)
            }
        });
        if let Err(e) = result {
            error!("Failed to {} assignment: {}", if paused { "pause" } else { "resume" }, e);
        }
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        mut pipeline: EventPipeline<S, D>,
        mut rx: mpsc::Receiver<WorkItem>,
    ) -> JoinHandle<ConsumerResult<()>> {
        let offsets = self.offsets.clone();
        let backpressure = self.backpressure.clone();
        let shutdown = self.shutdown.clone();
        let sweep_interval = self.sweep_interval;

        tokio::spawn(async move {
            info!("Aggregation worker {} started", worker_id);
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    item = rx.recv() => {
                        let Some(item) = item else { break };
                        let result = pipeline.process(&item.payload).await;
                        backpressure.release();

                        if let Err(e) = result {
                            let e = ConsumerError::Pipeline(e);
                            report(
                                &format!(
                                    "Worker {} failed on {}/{} offset {}",
                                    worker_id, item.topic, item.partition, item.offset
                                ),
                                &e,
                            );
                            shutdown.begin_shutdown("aggregation worker failed");
                            rx.close();
                            while rx.recv().await.is_some() {
                                backpressure.release();
                            }
                            if let Err(flush_err) = pipeline.flush().await {
                                error!("Worker {} flush failed: {}", worker_id, flush_err);
                            }
                            return Err(e);
                        }
                        offsets.complete(&item.topic, item.partition, item.offset);
                    }
                    _ = sweep.tick() => {
                        pipeline.sweep();
                    }
                }
            }

            pipeline.flush().await?;
            info!("Aggregation worker {} finished", worker_id);
            Ok::<(), ConsumerError>(())
        })
    }

    fn spawn_offset_committer(&self) -> JoinHandle<()> {
        let consumer = self.consumer.clone();
        let offsets = self.offsets.clone();
        let interval = self.config.commit_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = offsets.commit(&*consumer) {
                            report("Failed to commit offsets", &e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let backpressure = self.backpressure.clone();
        let offsets = self.offsets.clone();
        let interval = self.config.metrics_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = metrics.snapshot();
                info!(
                    "Pipeline stats - received: {}, aggregated: {}, dead-lettered: {}, undecodable: {}, events/sec: {:.2}, inflight: {}, uncommitted: {}",
                    stats.records_received,
                    stats.events_aggregated,
                    stats.records_dead_lettered,
                    stats.records_undecodable,
                    stats.events_per_second,
                    backpressure.inflight(),
                    offsets.pending_count()
                );
            }
        })
    }
}

/// Log an error at the level its severity calls for
fn report(context: &str, e: &ConsumerError) {
    match e.severity() {
        ErrorSeverity::Warning => warn!("{}: {}", context, e),
        ErrorSeverity::Error => error!("{}: {}", context, e),
        ErrorSeverity::Fatal => error!(fatal = true, "{}: {}", context, e),
    }
}
