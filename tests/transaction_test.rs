mod common;

use async_trait::async_trait;
use common::{broker_with_topic, init_tracing, record, test_config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txq_producer::{
    Error, ExternalResource, InMemoryBroker, Producer, ProducerConfig, Result, StringSerializer,
    TopicPartition, TransactionState,
};

#[derive(Default)]
struct RecordingResource {
    begins: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
    commit_error: Mutex<Option<Error>>,
}

#[async_trait]
impl ExternalResource for RecordingResource {
    async fn begin(&self) -> Result<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        match self.commit_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn abort(&self) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn transactional_config(broker: &InMemoryBroker) -> ProducerConfig {
    let mut config = test_config(broker);
    config.transactional = true;
    config.transactional_id = Some("ledger-writer".to_string());
    // Records only leave the accumulator when the transaction flushes them.
    config.linger_ms = 60_000;
    config.delivery_timeout_ms = 120_000;
    config
}

fn transactional_producer(
    broker: &Arc<InMemoryBroker>,
    resource: &Arc<RecordingResource>,
) -> Producer<String, String> {
    Producer::builder(transactional_config(broker))
        .transport(broker.clone())
        .key_serializer(StringSerializer)
        .value_serializer(StringSerializer)
        .external_resource(resource.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_commit_flushes_records() {
    init_tracing();

    let broker = broker_with_topic("ledger", 1);
    let resource = Arc::new(RecordingResource::default());
    let producer = transactional_producer(&broker, &resource);
    assert_eq!(producer.transaction_state(), Some(TransactionState::None));

    producer.begin_transaction().await.unwrap();
    assert_eq!(
        producer.transaction_state(),
        Some(TransactionState::InTransaction)
    );

    let mut futures = Vec::new();
    for i in 0..3 {
        futures.push(
            producer
                .send(record("ledger", &format!("entry-{}", i)), None)
                .await
                .unwrap(),
        );
    }
    assert!(futures.iter().all(|f| !f.is_done()));

    producer.commit_transaction().await.unwrap();
    assert!(futures.iter().all(|f| f.is_done()));
    assert_eq!(resource.begins.load(Ordering::SeqCst), 1);
    assert_eq!(resource.commits.load(Ordering::SeqCst), 1);
    assert_eq!(
        broker.values(&TopicPartition::new("ledger", 0)).len(),
        3
    );
    assert_eq!(producer.transaction_state(), Some(TransactionState::None));

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_send_outside_transaction_is_rejected() {
    init_tracing();

    let broker = broker_with_topic("ledger", 1);
    let resource = Arc::new(RecordingResource::default());
    let producer = transactional_producer(&broker, &resource);

    let err = producer.send(record("ledger", "v"), None).await.unwrap_err();
    assert_eq!(
        err,
        Error::illegal_state(
            "Cannot send records outside of a transaction; call begin_transaction() first"
        )
    );

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_begin_twice_is_rejected() {
    init_tracing();

    let broker = broker_with_topic("ledger", 1);
    let resource = Arc::new(RecordingResource::default());
    let producer = transactional_producer(&broker, &resource);

    producer.begin_transaction().await.unwrap();
    let err = producer.begin_transaction().await.unwrap_err();
    assert!(matches!(err, Error::IllegalState { .. }));
    assert_eq!(resource.begins.load(Ordering::SeqCst), 1);

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_abort_discards_unsent_records() {
    init_tracing();

    let broker = broker_with_topic("ledger", 1);
    let resource = Arc::new(RecordingResource::default());
    let producer = transactional_producer(&broker, &resource);

    producer.begin_transaction().await.unwrap();
    let first = producer.send(record("ledger", "a"), None).await.unwrap();
    let second = producer.send(record("ledger", "b"), None).await.unwrap();

    producer.abort_transaction().await.unwrap();
    for future in [first, second] {
        assert_eq!(
            future.await.unwrap_err(),
            Error::TransactionAborted("Failing batch since transaction was aborted".to_string())
        );
    }
    assert_eq!(resource.aborts.load(Ordering::SeqCst), 1);
    assert!(broker.values(&TopicPartition::new("ledger", 0)).is_empty());

    // The producer is usable for the next transaction.
    producer.begin_transaction().await.unwrap();
    producer.send(record("ledger", "c"), None).await.unwrap();
    producer.commit_transaction().await.unwrap();
    assert_eq!(
        broker.values(&TopicPartition::new("ledger", 0)),
        vec![b"c".to_vec()]
    );

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_during_commit_is_indeterminate() {
    init_tracing();

    let broker = broker_with_topic("ledger", 1);
    let resource = Arc::new(RecordingResource::default());
    *resource.commit_error.lock().unwrap() = Some(Error::disconnected("connection reset"));
    let producer = transactional_producer(&broker, &resource);

    producer.begin_transaction().await.unwrap();
    producer.send(record("ledger", "v"), None).await.unwrap();
    let err = producer.commit_transaction().await.unwrap_err();
    assert!(matches!(err, Error::Disconnected { .. }));

    // The outcome is unknown, so nothing more may happen on this producer.
    assert!(producer.begin_transaction().await.is_err());
    assert!(producer.send(record("ledger", "w"), None).await.is_err());

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_failed_record_forces_abort() {
    init_tracing();

    let broker = broker_with_topic("ledger", 1);
    let resource = Arc::new(RecordingResource::default());
    let mut config = transactional_config(&broker);
    config.max_block_ms = 50;
    let producer: Producer<String, String> = Producer::builder(config)
        .transport(broker.clone())
        .key_serializer(StringSerializer)
        .value_serializer(StringSerializer)
        .external_resource(resource.clone())
        .build()
        .unwrap();

    producer.begin_transaction().await.unwrap();
    let failed = producer.send(record("missing", "v"), None).await.unwrap();
    assert!(matches!(failed.await, Err(Error::Timeout { .. })));

    let err = producer.commit_transaction().await.unwrap_err();
    assert!(matches!(err, Error::IllegalState { .. }));
    assert_eq!(resource.commits.load(Ordering::SeqCst), 0);

    producer.abort_transaction().await.unwrap();
    assert_eq!(resource.aborts.load(Ordering::SeqCst), 1);

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_close_aborts_open_transaction() {
    init_tracing();

    let broker = broker_with_topic("ledger", 1);
    let resource = Arc::new(RecordingResource::default());
    let producer = transactional_producer(&broker, &resource);

    producer.begin_transaction().await.unwrap();
    let pending = producer.send(record("ledger", "v"), None).await.unwrap();
    producer.close(Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(resource.aborts.load(Ordering::SeqCst), 1);
    assert!(matches!(pending.await, Err(Error::TransactionAborted(_))));
    assert!(broker.values(&TopicPartition::new("ledger", 0)).is_empty());
}
