//! Redpanda/Kafka aggregation service
//!
//! Configuration comes from an optional YAML file (first argument or
//! `AGGREGATOR_CONFIG`) with environment overrides on top.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tenant_aggregator::consumer::{AggregatorConsumer, DlqProducer};
use tenant_aggregator::sink::{
    snapshot_channel, DeadLetterSink, FileDeadLetter, JsonLinesSink, ParquetSnapshotSink,
    SnapshotSink,
};
use tenant_aggregator::{AggregatorConfig, EventPipeline};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tenant_aggregator::init_tracing();
    info!("Starting tenant aggregator consumer v{}", tenant_aggregator::VERSION);

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AGGREGATOR_CONFIG").ok())
        .map(PathBuf::from);
    let mut config = match &config_path {
        Some(path) => AggregatorConfig::from_file(path)?,
        None => AggregatorConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;

    let dead_letter: Arc<dyn DeadLetterSink> = match &config.kafka.dlq_topic {
        Some(topic) => Arc::new(
            DlqProducer::connect(&config.kafka.brokers, topic.clone())?
                .with_timeout(config.kafka.dlq_timeout),
        ),
        None => {
            let path = config.sink.dead_letter_path.clone().unwrap_or_else(|| {
                config
                    .sink
                    .output_dir
                    .clone()
                    .unwrap_or_default()
                    .join("dead_letter.jsonl")
            });
            info!("No DLQ topic configured, dead letters go to {}", path.display());
            Arc::new(FileDeadLetter::open(&path)?)
        }
    };

    let (sinks, writers) = build_sinks(&config)?;

    let window = config.window;
    let retry = config.retry.clone();
    let consumer = AggregatorConsumer::new(config.kafka.clone(), config.sweep_interval, |worker| {
        EventPipeline::new(window, sinks[worker].clone(), dead_letter.clone()).with_retry(retry.clone())
    })?;
    drop(sinks);

    let result = consumer.run().await;

    for handle in writers {
        match handle.await {
            Ok(Ok(written)) => info!("Snapshot writer finished after {} records", written),
            Ok(Err(e)) => error!("Snapshot writer failed: {}", e),
            Err(e) => error!("Snapshot writer panicked: {}", e),
        }
    }

    result.context("consumer stopped with an error")
}

type Writers = Vec<JoinHandle<tenant_aggregator::Result<u64>>>;

/// One snapshot sink per worker
///
/// With an output directory each worker writes Parquet parts to its own
/// `worker-N` subdirectory through a bounded queue; otherwise all workers share
/// a JSON lines writer on stdout.
fn build_sinks(config: &AggregatorConfig) -> anyhow::Result<(Vec<Arc<dyn SnapshotSink>>, Writers)> {
    let workers = config.kafka.num_workers;

    let Some(root) = &config.sink.output_dir else {
        let stdout: Arc<dyn SnapshotSink> =
            Arc::new(JsonLinesSink::new(std::io::LineWriter::new(std::io::stdout())));
        return Ok((vec![stdout; workers], Vec::new()));
    };

    let mut sinks: Vec<Arc<dyn SnapshotSink>> = Vec::with_capacity(workers);
    let mut writers = Vec::with_capacity(workers);
    for worker in 0..workers {
        let dir = root.join(format!("worker-{}", worker));
        let parquet = ParquetSnapshotSink::create(&dir, config.sink.batch_size)
            .with_context(|| format!("creating {}", dir.display()))?;
        let (sender, writer) = snapshot_channel(config.sink.channel_capacity, Arc::new(parquet));
        writers.push(
            writer
                .with_flush_every(config.sink.batch_size)
                .with_flush_interval(config.sink.flush_interval)
                .with_retry(config.retry.clone())
                .spawn(),
        );
        sinks.push(Arc::new(sender));
    }
    Ok((sinks, writers))
}
