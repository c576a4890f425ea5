use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use txq_producer::{
    BytesSerializer, InMemoryBroker, Producer, ProducerConfig, ProducerRecord, StringSerializer,
};

#[derive(Parser, Debug)]
#[command(name = "txq-producer")]
#[command(about = "Load generator for the txq batching producer", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", help = "Producer configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(short = 'n', long, default_value_t = 100_000, help = "Number of records to send")]
    records: u64,

    #[arg(short, long, default_value = "load-test")]
    topic: String,

    #[arg(short, long, default_value_t = 6)]
    partitions: i32,

    #[arg(long, default_value_t = 3, help = "Brokers in the in-process cluster")]
    brokers: usize,

    #[arg(long, default_value_t = 100, help = "Size of each record value in bytes")]
    value_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting txq-producer load generator");

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            ProducerConfig::from_file(path)
                .with_context(|| format!("failed to load configuration from {:?}", path))?
        }
        None => ProducerConfig::default(),
    };

    let broker =
        Arc::new(InMemoryBroker::new(args.brokers).with_topic(&args.topic, args.partitions));
    config.bootstrap_servers = broker.bootstrap_servers();

    info!(
        brokers = args.brokers,
        topic = %args.topic,
        partitions = args.partitions,
        records = args.records,
        value_size = args.value_size,
        acks = ?config.acks,
        batch_size = config.batch_size,
        linger_ms = config.linger_ms,
        "Configuration summary"
    );

    let producer: Producer<String, Bytes> = Producer::builder(config)
        .transport(broker.clone())
        .key_serializer(StringSerializer)
        .value_serializer(BytesSerializer)
        .build()
        .context("failed to start the producer")?;

    let value = Bytes::from(vec![b'x'; args.value_size]);
    let started = Instant::now();
    let mut futures = Vec::with_capacity(args.records as usize);
    for i in 0..args.records {
        let record = ProducerRecord::new(args.topic.as_str(), value.clone())
            .with_key(format!("key-{}", i % 1024));
        futures.push(producer.send(record, None).await?);
    }
    producer.flush().await?;

    let mut failed = 0u64;
    for future in futures {
        if let Err(e) = future.await {
            failed += 1;
            if failed == 1 {
                error!(error = %e, "Record delivery failed");
            }
        }
    }

    let elapsed = started.elapsed();
    let rate = args.records as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        records = args.records,
        failed,
        elapsed_ms = elapsed.as_millis() as u64,
        records_per_sec = rate as u64,
        produce_requests = broker.produce_request_count(),
        "Load test complete"
    );
    if failed > 0 {
        warn!(failed, "Some records were not delivered");
    }

    producer.close(None).await?;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("txq_producer=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("txq_producer=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
