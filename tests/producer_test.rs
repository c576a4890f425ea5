mod common;

use common::{broker_with_topic, init_tracing, record, string_producer, test_config, Completions};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use txq_producer::{
    InMemoryBroker, JsonSerializer, PartitionerKind, Producer, ProducerRecord, StringSerializer,
    TopicPartition,
};

#[tokio::test]
async fn test_records_are_batched_into_one_request() {
    init_tracing();

    let broker = broker_with_topic("orders", 1);
    let mut config = test_config(&broker);
    config.linger_ms = 200;
    let producer = string_producer(&broker, config);

    // Warm the metadata so every record lands in the same batch.
    let partitions = producer.partitions_for("orders").await.unwrap();
    assert_eq!(partitions.len(), 1);

    let completions = Completions::default();
    let mut futures = Vec::new();
    for i in 0..3 {
        let future = producer
            .send(
                record("orders", &format!("order-{}", i)),
                Some(completions.callback(i.to_string())),
            )
            .await
            .unwrap();
        futures.push(future);
    }
    producer.flush().await.unwrap();

    assert!(futures.iter().all(|f| f.is_done()));
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.await.unwrap().offset, i as i64);
    }
    assert_eq!(completions.labels(), vec!["0", "1", "2"]);
    assert_eq!(broker.produce_request_count(), 1);

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_per_partition_ordering() {
    init_tracing();

    let broker = broker_with_topic("events", 2);
    let producer = string_producer(&broker, test_config(&broker));

    let mut futures = Vec::new();
    for i in 0..50 {
        let partition = i % 2;
        let future = producer
            .send(
                record("events", &format!("{}", i)).with_partition(partition),
                None,
            )
            .await
            .unwrap();
        futures.push(future);
    }
    for future in futures {
        future.await.unwrap();
    }

    for partition in 0..2 {
        let values: Vec<i32> = broker
            .values(&TopicPartition::new("events", partition))
            .into_iter()
            .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
            .collect();
        let expected: Vec<i32> = (0..50).filter(|i| i % 2 == partition).collect();
        assert_eq!(values, expected);
    }

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_records_spread_across_nodes() {
    init_tracing();

    let broker = Arc::new(InMemoryBroker::new(3).with_topic("metrics", 6));
    let mut config = test_config(&broker);
    config.partitioner = PartitionerKind::RoundRobin;
    let producer = string_producer(&broker, config);

    let mut futures = Vec::new();
    for i in 0..12 {
        futures.push(
            producer
                .send(record("metrics", &format!("m{}", i)), None)
                .await
                .unwrap(),
        );
    }
    for future in futures {
        future.await.unwrap();
    }

    for partition in 0..6 {
        assert_eq!(
            broker
                .values(&TopicPartition::new("metrics", partition))
                .len(),
            2
        );
    }

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_headers_and_timestamp_reach_the_broker() {
    init_tracing();

    let broker = broker_with_topic("audit", 1);
    let producer = string_producer(&broker, test_config(&broker));

    let metadata = producer
        .send(
            record("audit", "login")
                .with_key("user-1".to_string())
                .with_timestamp(1_700_000_000_000)
                .with_header("source", "web"),
            None,
        )
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(metadata.serialized_key_size, 6);
    assert_eq!(metadata.serialized_value_size, 5);

    let stored = broker.records(&TopicPartition::new("audit", 0));
    assert_eq!(stored.len(), 1);
    let stored = &stored[0].record;
    assert_eq!(stored.timestamp, 1_700_000_000_000);
    assert_eq!(stored.key.as_deref(), Some(&b"user-1"[..]));
    assert_eq!(stored.headers.len(), 1);
    assert_eq!(stored.headers[0].key, "source");

    producer.close(None).await.unwrap();
}

#[derive(Debug, Clone, Serialize)]
struct OrderCreated {
    id: u64,
    amount_cents: i64,
}

#[tokio::test]
async fn test_json_values() {
    init_tracing();

    let broker = broker_with_topic("orders", 1);
    let producer: Producer<String, OrderCreated> = Producer::builder(test_config(&broker))
        .transport(broker.clone())
        .key_serializer(StringSerializer)
        .value_serializer(JsonSerializer::new())
        .build()
        .unwrap();

    let order = OrderCreated {
        id: 42,
        amount_cents: 1999,
    };
    producer
        .send(ProducerRecord::new("orders", order), None)
        .await
        .unwrap()
        .await
        .unwrap();

    let values = broker.values(&TopicPartition::new("orders", 0));
    let parsed: serde_json::Value = serde_json::from_slice(&values[0]).unwrap();
    assert_eq!(parsed["id"], 42);
    assert_eq!(parsed["amount_cents"], 1999);

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_auto_created_topic() {
    init_tracing();

    let broker = Arc::new(InMemoryBroker::new(1).with_auto_create(2));
    let producer = string_producer(&broker, test_config(&broker));

    let metadata = producer
        .send(record("fresh", "first").with_partition(1), None)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(metadata.partition, 1);
    assert_eq!(metadata.offset, 0);
    assert!(broker.metadata_request_count() >= 2);

    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_close_drains_buffered_records() {
    init_tracing();

    let broker = broker_with_topic("orders", 1);
    let mut config = test_config(&broker);
    config.linger_ms = 1_000;
    let producer = string_producer(&broker, config);

    let future = producer.send(record("orders", "late"), None).await.unwrap();
    producer
        .close(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(future.await.unwrap().offset, 0);
    assert_eq!(
        broker.values(&TopicPartition::new("orders", 0)),
        vec![b"late".to_vec()]
    );
}

#[tokio::test]
async fn test_concurrent_sends_to_new_topic_share_one_refresh() {
    init_tracing();

    let broker = broker_with_topic("orders", 1);
    broker.create_topic("payments", 3);
    let producer = string_producer(&broker, test_config(&broker));
    producer.partitions_for("orders").await.unwrap();
    let before = broker.metadata_request_count();

    let sends = (0..8).map(|i| producer.send(record("payments", &format!("p-{}", i)), None));
    let futures: Vec<_> = futures::future::join_all(sends)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();
    assert_eq!(broker.metadata_request_count() - before, 1);

    for future in futures {
        future.await.unwrap();
    }
    producer.close(None).await.unwrap();
}

#[tokio::test]
async fn test_flush_ignores_records_sent_after_it_starts() {
    init_tracing();

    let broker = Arc::new(InMemoryBroker::new(2).with_topic("orders", 2));
    let early_tp = TopicPartition::new("orders", 0);
    let late_tp = TopicPartition::new("orders", 1);
    let late_leader = broker.leader_for(&late_tp).unwrap();
    assert_ne!(broker.leader_for(&early_tp), Some(late_leader));

    let mut config = test_config(&broker);
    config.linger_ms = 60_000;
    config.delivery_timeout_ms = 120_000;
    let producer = string_producer(&broker, config);
    producer.partitions_for("orders").await.unwrap();
    broker.disconnect(late_leader);

    let early = producer
        .send(record("orders", "early").with_partition(0), None)
        .await
        .unwrap();
    let flush = producer.flush();
    tokio::pin!(flush);
    assert!(futures::poll!(&mut flush).is_pending());

    // Its leader is unreachable, so this record can only finish after the
    // flush if the flush does not wait for it.
    let late = producer
        .send(record("orders", "late").with_partition(1), None)
        .await
        .unwrap();
    timeout(Duration::from_secs(2), flush)
        .await
        .unwrap()
        .unwrap();
    assert!(early.is_done());
    assert!(!late.is_done());

    broker.reconnect(late_leader);
    producer.flush().await.unwrap();
    assert_eq!(late.await.unwrap().offset, 0);
    assert_eq!(early.await.unwrap().offset, 0);

    producer.close(None).await.unwrap();
}
