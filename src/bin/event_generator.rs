//! Tenant event generator
//!
//! Generates newline-delimited JSON events for exercising the aggregator.
//! Session events are paired: every `session_end` closes a session opened
//! earlier for the same tenant, unless none is open. A share of records can be
//! made schema-invalid or not decodable at all.

use clap::Parser;
use rand::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "event-generator")]
#[command(about = "Generates tenant events as JSON lines", long_about = None)]
struct Cli {
    /// Number of records to generate
    #[arg(short, long, default_value_t = 10_000)]
    count: usize,

    /// Output file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Tenant identifiers
    #[arg(long, value_delimiter = ',', default_value = "tenant_a,tenant_b,tenant_c")]
    tenants: Vec<String>,

    /// Event types besides session_start/session_end
    #[arg(long, value_delimiter = ',', default_value = "click,view,purchase")]
    event_types: Vec<String>,

    /// Share of session events, 0.0-1.0
    #[arg(long, default_value_t = 0.2)]
    session_ratio: f64,

    /// Share of records missing a required field, 0.0-1.0
    #[arg(long, default_value_t = 0.0)]
    invalid_ratio: f64,

    /// Share of records that are not JSON, 0.0-1.0
    #[arg(long, default_value_t = 0.0)]
    malformed_ratio: f64,

    /// First timestamp in seconds since the epoch; now when omitted
    #[arg(long)]
    start: Option<f64>,

    /// Mean spacing between timestamps, in seconds
    #[arg(long, default_value_t = 0.5)]
    spacing: f64,

    /// Random seed for reproducible output
    #[arg(long)]
    seed: Option<u64>,

    /// Kafka brokers; records are produced to --topic instead of written out
    #[cfg(feature = "kafka")]
    #[arg(long)]
    brokers: Option<String>,

    /// Kafka topic
    #[cfg(feature = "kafka")]
    #[arg(long, default_value = "events")]
    topic: String,
}

const PATHS: &[&str] = &["/home", "/search", "/cart", "/checkout"];
const BROWSERS: &[&str] = &["chrome", "firefox", "safari"];

struct Generator {
    rng: StdRng,
    tenants: Vec<String>,
    event_types: Vec<String>,
    session_ratio: f64,
    invalid_ratio: f64,
    malformed_ratio: f64,
    spacing: f64,
    clock: f64,
    open_sessions: HashMap<String, Vec<String>>,
}

impl Generator {
    fn new(cli: &Cli) -> anyhow::Result<Self> {
        for (name, ratio) in [
            ("session-ratio", cli.session_ratio),
            ("invalid-ratio", cli.invalid_ratio),
            ("malformed-ratio", cli.malformed_ratio),
        ] {
            anyhow::ensure!((0.0..=1.0).contains(&ratio), "--{} must be between 0.0 and 1.0", name);
        }
        anyhow::ensure!(!cli.tenants.is_empty(), "at least one tenant is required");
        anyhow::ensure!(!cli.event_types.is_empty(), "at least one event type is required");
        anyhow::ensure!(cli.spacing >= 0.0, "--spacing must not be negative");

        let rng = match cli.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let clock = cli
            .start
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as f64 / 1000.0);

        Ok(Self {
            rng,
            tenants: cli.tenants.clone(),
            event_types: cli.event_types.clone(),
            session_ratio: cli.session_ratio,
            invalid_ratio: cli.invalid_ratio,
            malformed_ratio: cli.malformed_ratio,
            spacing: cli.spacing,
            clock,
            open_sessions: HashMap::new(),
        })
    }

    /// Next raw record
    fn next_record(&mut self) -> anyhow::Result<Vec<u8>> {
        let event = self.next_event();

        if self.rng.gen_bool(self.malformed_ratio) {
            let text = serde_json::to_string(&event)?;
            let cut = self.rng.gen_range(1..text.len());
            return Ok(text.as_bytes()[..cut].to_vec());
        }

        let event = if self.rng.gen_bool(self.invalid_ratio) {
            self.corrupt(event)
        } else {
            event
        };
        Ok(serde_json::to_vec(&event)?)
    }

    fn next_event(&mut self) -> Value {
        self.clock += self.rng.gen_range(0.0..=self.spacing * 2.0);
        let tenant = self.tenants[self.rng.gen_range(0..self.tenants.len())].clone();

        let (event_type, session_id) = if self.rng.gen_bool(self.session_ratio) {
            self.session_event(&tenant)
        } else {
            let event_type = self.event_types[self.rng.gen_range(0..self.event_types.len())].clone();
            (event_type, format!("sess-{}", self.rng.gen_range(1000..10_000)))
        };

        let path = PATHS[self.rng.gen_range(0..PATHS.len())];
        let browser = BROWSERS[self.rng.gen_range(0..BROWSERS.len())];
        let timestamp = (self.clock * 1000.0).round() / 1000.0;

        json!({
            "tenant_id": tenant,
            "event_type": event_type,
            "timestamp": timestamp,
            "payload": {
                "session_id": session_id,
                "path": path,
                "browser": browser,
            }
        })
    }

    fn session_event(&mut self, tenant: &str) -> (String, String) {
        let open = self.open_sessions.entry(tenant.to_string()).or_default();
        if !open.is_empty() && self.rng.gen_bool(0.5) {
            let index = self.rng.gen_range(0..open.len());
            return ("session_end".to_string(), open.swap_remove(index));
        }
        let session_id = format!("sess-{}", self.rng.gen_range(1000..10_000));
        open.push(session_id.clone());
        ("session_start".to_string(), session_id)
    }

    fn corrupt(&mut self, mut event: Value) -> Value {
        if let Some(fields) = event.as_object_mut() {
            match self.rng.gen_range(0..3) {
                0 => {
                    fields.remove("tenant_id");
                }
                1 => {
                    fields.insert("timestamp".to_string(), json!("yesterday"));
                }
                _ => {
                    fields.insert("event_type".to_string(), Value::Null);
                }
            }
        }
        event
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut generator = Generator::new(&cli)?;

    #[cfg(feature = "kafka")]
    {
        if let Some(brokers) = &cli.brokers {
            return produce(&mut generator, cli.count, brokers, &cli.topic);
        }
    }

    let mut writer: BufWriter<Box<dyn Write>> = match &cli.output {
        Some(path) => BufWriter::new(Box::new(File::create(path)?)),
        None => BufWriter::new(Box::new(std::io::stdout())),
    };

    for i in 0..cli.count {
        if i > 0 && i % 10_000 == 0 {
            eprintln!("Generated {} events...", i);
        }
        writer.write_all(&generator.next_record()?)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    eprintln!("Generated {} events", cli.count);
    Ok(())
}

#[cfg(feature = "kafka")]
fn produce(generator: &mut Generator, count: usize, brokers: &str, topic: &str) -> anyhow::Result<()> {
    use rdkafka::error::KafkaError;
    use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
    use rdkafka::types::RDKafkaErrorCode;
    use rdkafka::ClientConfig;
    use std::time::Duration;

    let producer: BaseProducer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("linger.ms", "10")
        .create()?;

    for i in 0..count {
        let record = generator.next_record()?;
        let mut pending = BaseRecord::<(), [u8]>::to(topic).payload(&record);
        loop {
            match producer.send(pending) {
                Ok(()) => break,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    pending = returned;
                    producer.poll(Duration::from_millis(100));
                }
                Err((e, _)) => return Err(e.into()),
            }
        }
        producer.poll(Duration::ZERO);
        if i > 0 && i % 10_000 == 0 {
            eprintln!("Produced {} events...", i);
        }
    }

    producer.flush(Duration::from_secs(30))?;
    eprintln!("Produced {} events to {}", count, topic);
    Ok(())
}
