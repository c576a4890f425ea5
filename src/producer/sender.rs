//! The background sender task.
//!
//! One task per producer moves batches from the [`RecordAccumulator`] to the
//! brokers. Each pass of the loop refreshes metadata when due, asks the
//! accumulator which leaders have sendable data, drains their batches into
//! one produce request per node, and resolves or re-enqueues batches as
//! responses arrive. Callers only talk to the task through the accumulator,
//! the metadata cache, and the [`SenderHandle`].

use super::accumulator::RecordAccumulator;
use super::batch::ProducerBatch;
use crate::config::ProducerConfig;
use crate::metadata::{ClusterSnapshot, Metadata, Node, NodeId};
use crate::record::{TopicPartition, UNKNOWN};
use crate::transport::{
    MetadataRequest, PartitionData, PartitionResponse, ProduceRequest, Request, Response,
    Transport,
};
use crate::Error;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

tokio::task_local! {
    static SENDER_TASK: ();
}

/// Whether the current code runs on a sender task, e.g. inside a
/// completion callback.
pub(crate) fn on_sender_task() -> bool {
    SENDER_TASK.try_with(|_| ()).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenderState {
    Running = 0,
    /// Draining what is queued; no new records are accepted.
    Closing = 1,
    /// Failing everything that is left.
    ForceClosed = 2,
    Stopped = 3,
}

impl SenderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SenderState::Running,
            1 => SenderState::Closing,
            2 => SenderState::ForceClosed,
            _ => SenderState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub client_id: String,
    pub acks: i16,
    pub request_timeout: Duration,
    pub max_request_size: usize,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub delivery_timeout: Duration,
    pub poll_interval: Duration,
    pub allow_auto_topic_creation: bool,
    pub transactional_id: Option<String>,
    pub producer_id: Option<i64>,
}

impl SenderConfig {
    pub fn from_producer_config(
        config: &ProducerConfig,
        client_id: impl Into<String>,
        producer_id: Option<i64>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            acks: config.acks.as_i16(),
            request_timeout: config.request_timeout(),
            max_request_size: config.max_request_size,
            retries: config.retries,
            retry_backoff: config.retry_backoff(),
            delivery_timeout: config.delivery_timeout(),
            poll_interval: config.poll_interval(),
            allow_auto_topic_creation: config.allow_auto_topic_creation,
            transactional_id: config.transactional_id.clone(),
            producer_id,
        }
    }
}

struct Shared {
    state: AtomicU8,
    wakeup: Arc<Notify>,
    force: CancellationToken,
    stopped: watch::Sender<bool>,
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    fn state(&self) -> SenderState {
        SenderState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SenderState, to: SenderState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Control surface of a running sender task.
#[derive(Clone)]
pub struct SenderHandle {
    shared: Arc<Shared>,
    accumulator: Arc<RecordAccumulator>,
}

impl SenderHandle {
    /// Makes the sender re-check the accumulator now instead of at its
    /// next poll.
    pub fn wakeup(&self) {
        self.shared.wakeup.notify_one();
    }

    /// Stops accepting records and sends what is queued.
    pub fn initiate_close(&self) {
        self.accumulator.close();
        if self
            .shared
            .transition(SenderState::Running, SenderState::Closing)
        {
            debug!("Beginning graceful shutdown of the sender");
        }
        self.wakeup();
    }

    /// Fails every queued and in-flight batch and stops the sender.
    pub fn force_close(&self) {
        self.accumulator.close();
        let from_running = self
            .shared
            .transition(SenderState::Running, SenderState::ForceClosed);
        if from_running
            || self
                .shared
                .transition(SenderState::Closing, SenderState::ForceClosed)
        {
            debug!(from_running, "Force closing the sender");
        } else {
            debug!(state = ?self.state(), "Sender already stopping, force close ignored");
        }
        self.shared.force.cancel();
    }

    pub fn state(&self) -> SenderState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SenderState::Running
    }

    /// The error that stopped the pipeline, if any.
    pub fn fatal_error(&self) -> Option<Error> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Waits for the task to stop. Returns `false` if `timeout` elapsed
    /// first.
    pub async fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.shared.stopped.subscribe();
        let stopped = rx.wait_for(|stopped| *stopped);
        match timeout {
            Some(timeout) => {
                let finished = tokio::time::timeout(timeout, stopped).await;
                finished.is_ok()
            }
            None => {
                let finished = stopped.await;
                finished.is_ok()
            }
        }
    }
}

/// Marks the task stopped however the loop exits.
struct StopGuard(Arc<Shared>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0
            .state
            .store(SenderState::Stopped as u8, Ordering::Release);
        self.0.stopped.send_replace(true);
    }
}

type InFlightFuture = Pin<Box<dyn Future<Output = Completion> + Send>>;

enum Completion {
    Produce {
        request_id: u64,
        result: crate::Result<Response>,
    },
    Metadata {
        result: crate::Result<Response>,
    },
}

struct InFlightRequest {
    node: NodeId,
    batches: Vec<ProducerBatch>,
}

pub struct Sender {
    config: SenderConfig,
    accumulator: Arc<RecordAccumulator>,
    metadata: Arc<Metadata>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    requests: FuturesUnordered<InFlightFuture>,
    in_flight: HashMap<u64, InFlightRequest>,
    next_request_id: u64,
    metadata_in_flight: bool,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        accumulator: Arc<RecordAccumulator>,
        metadata: Arc<Metadata>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (stopped, _) = watch::channel(false);
        let wakeup = Arc::new(Notify::new());
        // A send blocked on memory needs full batches drained right away.
        accumulator.buffer_pool().notify_on_wait(Arc::clone(&wakeup));
        Self {
            config,
            accumulator,
            metadata,
            transport,
            shared: Arc::new(Shared {
                state: AtomicU8::new(SenderState::Running as u8),
                wakeup,
                force: CancellationToken::new(),
                stopped,
                fatal: Mutex::new(None),
            }),
            requests: FuturesUnordered::new(),
            in_flight: HashMap::new(),
            next_request_id: 0,
            metadata_in_flight: false,
        }
    }

    /// Starts the loop on the current runtime.
    pub fn spawn(self) -> SenderHandle {
        let handle = SenderHandle {
            shared: Arc::clone(&self.shared),
            accumulator: Arc::clone(&self.accumulator),
        };
        tokio::spawn(SENDER_TASK.scope((), self.run()));
        handle
    }

    async fn run(mut self) {
        let _guard = StopGuard(Arc::clone(&self.shared));
        info!(client_id = %self.config.client_id, "Starting sender");

        loop {
            match self.shared.state() {
                SenderState::Running => {}
                SenderState::Closing => {
                    if !self.accumulator.has_undrained() && self.in_flight.is_empty() {
                        break;
                    }
                }
                SenderState::ForceClosed | SenderState::Stopped => break,
            }

            let delay = self.run_once(Instant::now());
            let force = self.shared.force.clone();

            tokio::select! {
                biased;
                _ = force.cancelled() => break,
                Some(completion) = self.requests.next(), if !self.requests.is_empty() => {
                    self.handle_completion(completion);
                }
                _ = self.shared.wakeup.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.shared.force.is_cancelled() {
            let err = Error::closed("Producer is closed forcefully.");
            let mut aborted = 0;
            for (_, request) in self.in_flight.drain() {
                for batch in request.batches {
                    aborted += 1;
                    fail_batch(&self.accumulator, batch, &err);
                }
            }
            self.accumulator.abort_incomplete_batches(&err).await;
            warn!(
                client_id = %self.config.client_id,
                in_flight_aborted = aborted,
                "Sender force closed"
            );
        }
        info!(client_id = %self.config.client_id, "Sender stopped");
    }

    /// One pass over metadata, ready destinations, and expired batches.
    /// Returns how long the loop may sleep before the next pass.
    fn run_once(&mut self, now: Instant) -> Duration {
        let metadata_delay = self.maybe_update_metadata(now);
        let cluster = self.metadata.fetch();

        let mut ready = self.accumulator.ready(&cluster, now);
        if !ready.unknown_leader_topics.is_empty() {
            for topic in &ready.unknown_leader_topics {
                self.metadata.add(topic, now);
            }
            debug!(
                topics = ?ready.unknown_leader_topics,
                "Requesting metadata update for topics with unknown leader"
            );
            self.metadata.request_update();
        }

        let mut delay = self
            .config
            .poll_interval
            .min(ready.next_ready_check_delay)
            .min(metadata_delay);

        let before = ready.ready_nodes.len();
        ready.ready_nodes.retain(|id| {
            cluster
                .node_by_id(*id)
                .is_some_and(|node| self.transport.is_connected(node))
        });
        if ready.ready_nodes.len() < before {
            delay = delay.min(self.config.retry_backoff);
        }

        let drained = self.accumulator.drain(
            &cluster,
            &ready.ready_nodes,
            self.config.max_request_size,
            now,
        );

        self.fail_expired_batches(now);

        for (node_id, batches) in drained {
            match cluster.node_by_id(node_id).cloned() {
                Some(node) => self.send_produce(node, batches),
                None => {
                    debug!(node = node_id, "Leader left the cluster before send");
                    for batch in batches {
                        self.accumulator.requeue_unsent(batch);
                    }
                }
            }
        }
        delay
    }

    fn maybe_update_metadata(&mut self, now: Instant) -> Duration {
        if self.metadata_in_flight {
            return Duration::MAX;
        }
        let delay = self.metadata.time_to_next_update(now);
        if !delay.is_zero() {
            return delay;
        }

        let cluster = self.metadata.fetch();
        let Some(node) = self.least_loaded_node(&cluster) else {
            debug!("No node available for a metadata request");
            self.metadata.failed_update(now);
            return self.config.retry_backoff;
        };

        let topics = self.metadata.topics();
        trace!(node = node.id, topics = ?topics, "Sending metadata request");
        let request = Request::Metadata(MetadataRequest {
            topics,
            allow_auto_topic_creation: self.config.allow_auto_topic_creation,
        });
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.request_timeout;
        self.metadata_in_flight = true;
        self.requests.push(Box::pin(async move {
            let result = transport.send(&node, request, timeout).await;
            Completion::Metadata { result }
        }));
        Duration::MAX
    }

    /// The connected node with the fewest outstanding produce requests.
    fn least_loaded_node(&self, cluster: &ClusterSnapshot) -> Option<Node> {
        let mut load: HashMap<NodeId, usize> = HashMap::new();
        for request in self.in_flight.values() {
            *load.entry(request.node).or_default() += 1;
        }
        cluster
            .nodes()
            .filter(|node| self.transport.is_connected(node))
            .min_by_key(|node| load.get(&node.id).copied().unwrap_or(0))
            .cloned()
    }

    fn send_produce(&mut self, node: Node, batches: Vec<ProducerBatch>) {
        let partitions = batches
            .iter()
            .map(|batch| PartitionData {
                topic_partition: batch.topic_partition().clone(),
                records: batch.records(),
                record_count: batch.record_count() as u32,
                base_sequence: batch.base_sequence(),
            })
            .collect();
        let request = Request::Produce(ProduceRequest {
            acks: self.config.acks,
            timeout_ms: self.config.request_timeout.as_millis() as u64,
            transactional_id: self.config.transactional_id.clone(),
            producer_id: self.config.producer_id,
            partitions,
        });

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        debug!(
            node = node.id,
            request_id,
            batches = batches.len(),
            "Sending produce request"
        );
        self.in_flight.insert(
            request_id,
            InFlightRequest {
                node: node.id,
                batches,
            },
        );

        let transport = Arc::clone(&self.transport);
        let timeout = self.config.request_timeout;
        self.requests.push(Box::pin(async move {
            let result = transport.send(&node, request, timeout).await;
            Completion::Produce { request_id, result }
        }));
    }

    fn handle_completion(&mut self, completion: Completion) {
        let now = Instant::now();
        match completion {
            Completion::Metadata { result } => {
                self.metadata_in_flight = false;
                match result {
                    Ok(Response::Metadata(response)) => {
                        let (snapshot, invalid) = response.into_snapshot();
                        self.metadata.update(snapshot, invalid, now, false);
                    }
                    Ok(other) => {
                        warn!(response = ?other, "Unexpected response to a metadata request");
                        self.metadata.failed_update(now);
                    }
                    Err(err) => {
                        warn!(error = %err, "Metadata request failed");
                        self.metadata.failed_update(now);
                    }
                }
            }
            Completion::Produce { request_id, result } => {
                let Some(request) = self.in_flight.remove(&request_id) else {
                    return;
                };
                self.handle_produce_response(request, result, now);
            }
        }
    }

    fn handle_produce_response(
        &mut self,
        request: InFlightRequest,
        result: crate::Result<Response>,
        now: Instant,
    ) {
        let response = match result {
            Ok(Response::Produce(response)) => response,
            Ok(other) => {
                let err = Error::Broker {
                    message: format!("Unexpected response to a produce request: {:?}", other),
                };
                for batch in request.batches {
                    self.fail_batch(batch, &err);
                }
                return;
            }
            Err(err) => {
                warn!(node = request.node, error = %err, "Produce request failed");
                let disconnected = matches!(err, Error::Disconnected { .. });
                for batch in request.batches {
                    self.complete_with_error(batch, err.clone(), disconnected, now);
                }
                return;
            }
        };

        let mut responses: HashMap<TopicPartition, PartitionResponse> = response
            .partitions
            .into_iter()
            .map(|p| (p.topic_partition.clone(), p))
            .collect();

        for batch in request.batches {
            let tp = batch.topic_partition().clone();
            match responses.remove(&tp) {
                Some(PartitionResponse {
                    error: None,
                    base_offset,
                    log_append_time,
                    ..
                }) => self.complete_batch(batch, base_offset, log_append_time),
                Some(PartitionResponse {
                    error: Some(broker_error),
                    ..
                }) => {
                    let refresh = broker_error.invalidates_metadata();
                    let fatal = broker_error.is_fatal();
                    let err = broker_error.into_error(&tp);
                    if fatal {
                        self.fail_pipeline(batch, err);
                    } else {
                        self.complete_with_error(batch, err, refresh, now);
                    }
                }
                None => {
                    let err = Error::Broker {
                        message: format!("Produce response has no result for {}", tp),
                    };
                    self.fail_batch(batch, &err);
                }
            }
        }
    }

    fn complete_batch(&self, mut batch: ProducerBatch, base_offset: i64, log_append_time: i64) {
        let tp = batch.topic_partition().clone();
        let base_offset = if self.config.acks == 0 {
            UNKNOWN
        } else {
            base_offset
        };
        trace!(
            topic_partition = %tp,
            base_offset,
            records = batch.record_count(),
            "Batch acknowledged"
        );
        batch.complete(base_offset, log_append_time);
        self.accumulator.complete_in_flight(&tp);
        self.accumulator.deallocate(batch);
    }

    fn fail_batch(&self, batch: ProducerBatch, err: &Error) {
        fail_batch(&self.accumulator, batch, err);
    }

    fn can_retry(&self, batch: &ProducerBatch, err: &Error, now: Instant) -> bool {
        err.is_retriable()
            && batch.attempts() < self.config.retries
            && !batch.has_reached_delivery_timeout(self.config.delivery_timeout, now)
            && !self.shared.force.is_cancelled()
    }

    /// Re-enqueues `batch` if the error and its retry budget allow it,
    /// otherwise fails it.
    fn complete_with_error(
        &self,
        batch: ProducerBatch,
        err: Error,
        refresh_metadata: bool,
        now: Instant,
    ) {
        if refresh_metadata {
            self.metadata.request_update();
        }
        let tp = batch.topic_partition().clone();
        if self.can_retry(&batch, &err, now) {
            warn!(
                topic_partition = %tp,
                attempt = batch.attempts() + 1,
                retries_left = self.config.retries - batch.attempts() - 1,
                error = %err,
                "Got error produce response, retrying"
            );
            self.accumulator.reenqueue(batch, now);
            self.accumulator.complete_in_flight(&tp);
        } else {
            debug!(topic_partition = %tp, error = %err, "Failing batch");
            self.fail_batch(batch, &err);
        }
    }

    /// Records an error no destination can recover from and fails
    /// everything still queued with it.
    fn fail_pipeline(&self, batch: ProducerBatch, err: Error) {
        error!(
            client_id = %self.config.client_id,
            error = %err,
            "Fatal error in the sender, aborting queued batches"
        );
        {
            let mut fatal = self
                .shared
                .fatal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            fatal.get_or_insert_with(|| err.clone());
        }
        self.fail_batch(batch, &err);
        self.accumulator.abort_undrained_batches(&err);
    }

    /// Fails queued batches past the delivery timeout. In-flight batches are
    /// bounded by the request timeout instead, and [`Self::can_retry`] stops
    /// them from going back to the queue once their delivery timeout has
    /// passed.
    fn fail_expired_batches(&self, now: Instant) {
        for mut batch in self.accumulator.expired_batches(now) {
            let tp = batch.topic_partition().clone();
            let err = Error::timeout(format!(
                "Expiring {} record(s) for {}: {} ms has passed since batch creation",
                batch.record_count(),
                tp,
                now.saturating_duration_since(batch.created()).as_millis()
            ));
            warn!(topic_partition = %tp, error = %err, "Batch expired");
            batch.fail(&err);
            self.accumulator.deallocate(batch);
        }
    }
}

/// Fails an in-flight batch and returns its memory.
fn fail_batch(accumulator: &RecordAccumulator, mut batch: ProducerBatch, err: &Error) {
    let tp = batch.topic_partition().clone();
    batch.fail(err);
    accumulator.complete_in_flight(&tp);
    accumulator.deallocate(batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::accumulator::{AccumulatorConfig, AppendOutcome};
    use crate::producer::batch::{AppendRecord, RecordFuture};
    use crate::transport::memory::ProduceFault;
    use crate::transport::{BrokerError, InMemoryBroker};
    use bytes::Bytes;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        accumulator: Arc<RecordAccumulator>,
        metadata: Arc<Metadata>,
        handle: SenderHandle,
    }

    fn accumulator_config() -> AccumulatorConfig {
        AccumulatorConfig {
            batch_size: 1024,
            linger: Duration::ZERO,
            retry_backoff: Duration::from_millis(5),
            retry_backoff_max: Duration::from_millis(20),
            delivery_timeout: Duration::from_secs(5),
            max_in_flight_per_partition: 1,
            enable_idempotence: false,
        }
    }

    fn sender_config(retries: u32) -> SenderConfig {
        SenderConfig {
            client_id: "producer-test".into(),
            acks: -1,
            request_timeout: Duration::from_secs(1),
            max_request_size: 1_048_576,
            retries,
            retry_backoff: Duration::from_millis(5),
            delivery_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            allow_auto_topic_creation: false,
            transactional_id: None,
            producer_id: None,
        }
    }

    fn start(broker: InMemoryBroker, retries: u32) -> Fixture {
        start_with(broker, sender_config(retries))
    }

    fn start_with(broker: InMemoryBroker, config: SenderConfig) -> Fixture {
        let accumulator = RecordAccumulator::new(accumulator_config(), 64 * 1024);
        start_with_accumulator(broker, config, accumulator)
    }

    fn start_with_accumulator(
        broker: InMemoryBroker,
        config: SenderConfig,
        accumulator: RecordAccumulator,
    ) -> Fixture {
        let broker = Arc::new(broker);
        let accumulator = Arc::new(accumulator);
        let metadata = Arc::new(Metadata::new(
            Duration::from_millis(5),
            Duration::from_secs(300),
            Duration::from_secs(300),
        ));
        metadata
            .bootstrap(&broker.bootstrap_servers(), Instant::now())
            .unwrap();
        let transport: Arc<dyn Transport> = broker.clone();
        let handle = Sender::new(
            config,
            Arc::clone(&accumulator),
            Arc::clone(&metadata),
            transport,
        )
        .spawn();
        Fixture {
            broker,
            accumulator,
            metadata,
            handle,
        }
    }

    async fn await_topic(fixture: &Fixture, topic: &str) {
        fixture.metadata.add(topic, Instant::now());
        while !fixture.metadata.fetch().contains_topic(topic) {
            let version = fixture.metadata.request_update();
            fixture.handle.wakeup();
            fixture
                .metadata
                .await_update(version, Duration::from_secs(1))
                .await
                .unwrap();
        }
    }

    async fn append(fixture: &Fixture, tp: &TopicPartition, value: &'static str) -> RecordFuture {
        let value = Some(Bytes::from_static(value.as_bytes()));
        let record = AppendRecord::new(1, None, value, vec![], None);
        let outcome = fixture
            .accumulator
            .append(tp, record, Duration::from_secs(1), false, Instant::now())
            .await
            .unwrap();
        fixture.handle.wakeup();
        match outcome {
            AppendOutcome::Appended(result) => result.future,
            AppendOutcome::AbortForNewBatch(_) => panic!("append was not expected to abort"),
        }
    }

    #[tokio::test]
    async fn test_sends_and_completes_batches() {
        let fixture = start(InMemoryBroker::new(1).with_topic("orders", 2), 3);
        await_topic(&fixture, "orders").await;
        let tp = TopicPartition::new("orders", 1);

        let first = append(&fixture, &tp, "a").await;
        let second = append(&fixture, &tp, "b").await;
        assert_eq!(first.await.unwrap().offset, 0);
        assert_eq!(second.await.unwrap().offset, 1);
        assert_eq!(fixture.broker.values(&tp), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(!fixture.accumulator.has_incomplete());
    }

    #[tokio::test]
    async fn test_retries_retriable_errors() {
        let fixture = start(InMemoryBroker::new(1).with_topic("orders", 1), 3);
        await_topic(&fixture, "orders").await;
        fixture
            .broker
            .inject_produce_fault(ProduceFault::Error(BrokerError::NotEnoughReplicas));
        fixture.broker.inject_produce_fault(ProduceFault::Disconnect);

        let tp = TopicPartition::new("orders", 0);
        let metadata = append(&fixture, &tp, "a").await.await.unwrap();
        assert_eq!(metadata.offset, 0);
        assert_eq!(fixture.broker.produce_request_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_batch() {
        let fixture = start(InMemoryBroker::new(1).with_topic("orders", 1), 1);
        await_topic(&fixture, "orders").await;
        for _ in 0..2 {
            fixture
                .broker
                .inject_produce_fault(ProduceFault::Error(BrokerError::NotEnoughReplicas));
        }

        let tp = TopicPartition::new("orders", 0);
        let err = append(&fixture, &tp, "a").await.await.unwrap_err();
        assert!(matches!(err, Error::Retriable { .. }));
        assert_eq!(fixture.accumulator.in_flight_count(&tp), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_pipeline() {
        let fixture = start(InMemoryBroker::new(1).with_topic("orders", 1), 3);
        await_topic(&fixture, "orders").await;
        fixture
            .broker
            .inject_produce_fault(ProduceFault::Error(BrokerError::UnsupportedVersion));

        let tp = TopicPartition::new("orders", 0);
        let err = append(&fixture, &tp, "a").await.await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(fixture.handle.fatal_error(), Some(err));
    }

    #[tokio::test]
    async fn test_graceful_close_drains_queue() {
        let fixture = start(InMemoryBroker::new(1).with_topic("orders", 1), 3);
        await_topic(&fixture, "orders").await;
        let tp = TopicPartition::new("orders", 0);
        let future = append(&fixture, &tp, "a").await;

        fixture.handle.initiate_close();
        assert!(fixture
            .handle
            .await_termination(Some(Duration::from_secs(2)))
            .await);
        assert_eq!(fixture.handle.state(), SenderState::Stopped);
        assert_eq!(future.await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_force_close_fails_in_flight_batches() {
        let fixture = start(InMemoryBroker::new(1).with_topic("orders", 1), 3);
        await_topic(&fixture, "orders").await;
        fixture.broker.pause();
        let tp = TopicPartition::new("orders", 0);
        let future = append(&fixture, &tp, "a").await;
        while fixture.broker.produce_request_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        fixture.handle.force_close();
        assert!(fixture.handle.await_termination(None).await);
        let err = future.await.unwrap_err();
        assert_eq!(err, Error::closed("Producer is closed forcefully."));
        assert!(!fixture.accumulator.has_incomplete());
    }

    #[tokio::test]
    async fn test_retry_stops_after_delivery_timeout() {
        let mut config = sender_config(5);
        config.delivery_timeout = Duration::from_millis(50);
        let fixture = start_with(InMemoryBroker::new(1).with_topic("orders", 1), config);
        await_topic(&fixture, "orders").await;
        fixture.broker.pause();
        fixture
            .broker
            .inject_produce_fault(ProduceFault::Error(BrokerError::NotEnoughReplicas));

        let tp = TopicPartition::new("orders", 0);
        let future = append(&fixture, &tp, "a").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.broker.resume();

        let err = future.await.unwrap_err();
        assert!(matches!(err, Error::Retriable { .. }));
        assert_eq!(fixture.broker.produce_request_count(), 1);
        assert!(fixture.broker.values(&tp).is_empty());
    }

    #[tokio::test]
    async fn test_blocked_allocation_wakes_the_sender() {
        let mut config = sender_config(3);
        config.poll_interval = Duration::from_secs(60);
        let mut acc_config = accumulator_config();
        acc_config.linger = Duration::from_secs(60);
        acc_config.delivery_timeout = Duration::from_secs(120);
        let accumulator = RecordAccumulator::new(acc_config, 1024);
        let fixture = start_with_accumulator(
            InMemoryBroker::new(1).with_topic("orders", 2),
            config,
            accumulator,
        );
        await_topic(&fixture, "orders").await;

        // The first batch lingers and holds all of the memory.
        let first = append(&fixture, &TopicPartition::new("orders", 0), "a").await;
        assert!(!first.is_done());

        // Appending to another partition needs a second block. Only the
        // pool's signal makes the sender drain the first batch early.
        let second = tokio::time::timeout(
            Duration::from_secs(2),
            append(&fixture, &TopicPartition::new("orders", 1), "b"),
        )
        .await
        .unwrap();
        assert_eq!(first.await.unwrap().offset, 0);
        assert!(!second.is_done());
        assert_eq!(fixture.accumulator.buffer_pool().queued(), 0);
    }

    #[tokio::test]
    async fn test_force_close_after_stop_keeps_state() {
        let fixture = start(InMemoryBroker::new(1).with_topic("orders", 1), 3);
        fixture.handle.initiate_close();
        assert!(fixture
            .handle
            .await_termination(Some(Duration::from_secs(2)))
            .await);

        fixture.handle.force_close();
        assert_eq!(fixture.handle.state(), SenderState::Stopped);
    }

    #[tokio::test]
    async fn test_on_sender_task() {
        assert!(!on_sender_task());
        let inside = SENDER_TASK.scope((), async { on_sender_task() }).await;
        assert!(inside);
    }
}
