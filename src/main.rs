use anyhow::Context;
use clap::Parser;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenant_aggregator::sink::{
    snapshot_channel, DeadLetterSink, FileDeadLetter, JsonLinesSink, ParquetSnapshotSink,
    SnapshotSink,
};
use tenant_aggregator::{AggregatorConfig, EventPipeline};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tenant-aggregator")]
#[command(about = "Hopping-window and session aggregation over JSON event lines", long_about = None)]
struct Cli {
    /// Newline-delimited events to read; stdin when omitted
    input: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Window size in seconds
    #[arg(long)]
    window_size: Option<f64>,

    /// Window step in seconds
    #[arg(long)]
    step: Option<f64>,

    /// Window expiry in seconds
    #[arg(long)]
    expiry: Option<f64>,

    /// Write Parquet snapshot parts here instead of JSON lines on stdout
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// File receiving schema-invalid records
    #[arg(long)]
    dead_letter: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

type Pipeline = EventPipeline<Arc<dyn SnapshotSink>, Arc<dyn DeadLetterSink>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdout may carry snapshots, so logs go to stderr
    if cli.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(&cli)?;
    info!("Window configuration: {:?}", config.window);

    let dead_letter_path = config.sink.dead_letter_path.clone().unwrap_or_else(|| {
        config
            .sink
            .output_dir
            .clone()
            .unwrap_or_default()
            .join("dead_letter.jsonl")
    });
    let dead_letter: Arc<dyn DeadLetterSink> = Arc::new(
        FileDeadLetter::open(&dead_letter_path)
            .with_context(|| format!("opening dead-letter file {}", dead_letter_path.display()))?,
    );

    let mut writer = None;
    let sink: Arc<dyn SnapshotSink> = match &config.sink.output_dir {
        Some(dir) => {
            let parquet = ParquetSnapshotSink::create(dir, config.sink.batch_size)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
            let (sender, snapshot_writer) =
                snapshot_channel(config.sink.channel_capacity, Arc::new(parquet));
            writer = Some(
                snapshot_writer
                    .with_flush_every(config.sink.batch_size)
                    .with_flush_interval(config.sink.flush_interval)
                    .with_retry(config.retry.clone())
                    .spawn(),
            );
            Arc::new(sender)
        }
        None => Arc::new(JsonLinesSink::new(BufWriter::new(std::io::stdout()))),
    };

    let pipeline = EventPipeline::new(config.window, sink, dead_letter).with_retry(config.retry.clone());

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &cli.input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let result = run(pipeline, input, config.sweep_interval, config.stats_interval).await;

    // The writer stops once the pipeline's sender has been dropped
    if let Some(handle) = writer {
        match handle.await {
            Ok(Ok(written)) => info!("Wrote {} snapshot records", written),
            Ok(Err(e)) => warn!("Snapshot writer failed: {}", e),
            Err(e) => warn!("Snapshot writer panicked: {}", e),
        }
    }

    result
}

fn load_config(cli: &Cli) -> anyhow::Result<AggregatorConfig> {
    let mut config = match &cli.config {
        Some(path) => AggregatorConfig::from_file(path)?,
        None => AggregatorConfig::default(),
    };
    config.apply_env()?;

    if let Some(size) = cli.window_size {
        config.window.size = Duration::try_from_secs_f64(size).context("--window-size")?;
    }
    if let Some(step) = cli.step {
        config.window.step = Duration::try_from_secs_f64(step).context("--step")?;
    }
    if let Some(expiry) = cli.expiry {
        config.window.expiry = Duration::try_from_secs_f64(expiry).context("--expiry")?;
    }
    if let Some(dir) = &cli.output_dir {
        config.sink.output_dir = Some(dir.clone());
    }
    if let Some(path) = &cli.dead_letter {
        config.sink.dead_letter_path = Some(path.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn run(
    mut pipeline: Pipeline,
    mut input: Box<dyn AsyncBufRead + Unpin + Send>,
    sweep_interval: Duration,
    stats_interval: Duration,
) -> anyhow::Result<()> {
    // Lines are read as raw bytes; invalid UTF-8 is left to the decoder
    let mut line = Vec::new();
    let mut sweep = tokio::time::interval(sweep_interval);
    let mut stats = tokio::time::interval(stats_interval);
    stats.tick().await;

    loop {
        tokio::select! {
            // A cancelled read leaves its bytes in `line` and the next read appends
            read = input.read_until(b'\n', &mut line) => {
                let read = read.context("reading input")?;
                if read == 0 && line.is_empty() {
                    break;
                }
                if let Some(record) = record_bytes(&line) {
                    if let Err(e) = pipeline.process(record).await {
                        if let Err(flush_err) = pipeline.flush().await {
                            warn!("Flush after failure also failed: {}", flush_err);
                        }
                        return Err(e).context("aggregation stopped");
                    }
                }
                line.clear();
                if read == 0 {
                    break;
                }
            }
            _ = sweep.tick() => {
                pipeline.sweep();
            }
            _ = stats.tick() => {
                info!("Pipeline stats: {:?}", pipeline.metrics().snapshot());
            }
        }
    }

    pipeline.sweep();
    pipeline.flush().await?;

    let stats = pipeline.metrics().snapshot();
    info!("Final stats: {}", serde_json::to_string(&stats)?);
    eprintln!(
        "Processed {} records: {} aggregated, {} dead-lettered, {} undecodable",
        stats.records_received,
        stats.events_aggregated,
        stats.records_dead_lettered,
        stats.records_undecodable
    );
    Ok(())
}

/// Line content without its terminator, or `None` for blank lines
fn record_bytes(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(line)
    }
}
