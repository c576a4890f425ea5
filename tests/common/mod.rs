#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use txq_producer::{
    Callback, Error, InMemoryBroker, Producer, ProducerConfig, ProducerRecord, RecordMetadata,
    StringSerializer,
};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("txq_producer=debug")
        .try_init()
        .ok();
}

/// A single-node broker with `topic` already created.
pub fn broker_with_topic(topic: &str, partitions: i32) -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::new(1).with_topic(topic, partitions))
}

/// Fast timings so failure paths resolve within a test's lifetime.
pub fn test_config(broker: &InMemoryBroker) -> ProducerConfig {
    let mut config = ProducerConfig::builder()
        .bootstrap_servers(broker.bootstrap_servers())
        .linger(Duration::from_millis(5))
        .max_block(Duration::from_secs(2))
        .request_timeout(Duration::from_millis(500))
        .delivery_timeout(Duration::from_secs(5))
        .retry_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .build()
        .unwrap();
    config.client_id = Some(format!("test-{}", std::process::id()));
    config
}

pub fn string_producer(
    broker: &Arc<InMemoryBroker>,
    config: ProducerConfig,
) -> Producer<String, String> {
    Producer::builder(config)
        .transport(broker.clone())
        .key_serializer(StringSerializer)
        .value_serializer(StringSerializer)
        .build()
        .unwrap()
}

pub fn record(topic: &str, value: &str) -> ProducerRecord<String, String> {
    ProducerRecord::new(topic, value.to_string())
}

/// Every completion a callback sees, in completion order.
#[derive(Clone, Default)]
pub struct Completions {
    seen: Arc<Mutex<Vec<(String, Result<RecordMetadata, Error>)>>>,
}

impl Completions {
    pub fn callback(&self, label: impl Into<String>) -> Callback {
        let seen = self.seen.clone();
        let label = label.into();
        Box::new(move |metadata: &RecordMetadata, err: Option<&Error>| {
            let result = match err {
                Some(err) => Err(err.clone()),
                None => Ok(metadata.clone()),
            };
            seen.lock().unwrap().push((label, result));
        })
    }

    pub fn labels(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn results(&self) -> Vec<(String, Result<RecordMetadata, Error>)> {
        self.seen.lock().unwrap().clone()
    }
}
