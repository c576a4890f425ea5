//! The producer: record submission, batching, and delivery.
//!
//! [`Producer::send`] serializes and partitions a record, appends it to the
//! [`RecordAccumulator`](accumulator::RecordAccumulator), and returns a
//! [`RecordFuture`] that resolves once the broker acknowledges the record's
//! batch. A background [`Sender`](sender::Sender) task does all network I/O.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use txq_producer::serializer::StringSerializer;
//! use txq_producer::{InMemoryBroker, Producer, ProducerConfig, ProducerRecord};
//!
//! # async fn run() -> txq_producer::Result<()> {
//! let broker = Arc::new(InMemoryBroker::new(1).with_topic("orders", 3));
//! let config = ProducerConfig::builder()
//!     .bootstrap_servers(broker.bootstrap_servers())
//!     .build()?;
//!
//! let producer: Producer<String, String> = Producer::builder(config)
//!     .transport(broker)
//!     .key_serializer(StringSerializer)
//!     .value_serializer(StringSerializer)
//!     .build()?;
//!
//! let record = ProducerRecord::new("orders", "created".to_string()).with_key("order-1".to_string());
//! let metadata = producer.send(record, None).await?.await?;
//! println!("written at offset {}", metadata.offset);
//!
//! producer.close(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod batch;
pub mod buffer_pool;
pub mod interceptor;
pub mod partitioner;
pub mod sender;
pub mod transaction;


pub use accumulator::{AccumulatorConfig, RecordAccumulator};
pub use batch::{Callback, RecordFuture};
pub use interceptor::ProducerInterceptor;
pub use partitioner::Partitioner;
pub use sender::{SenderHandle, SenderState};
pub use transaction::{ExternalResource, TransactionState};

use self::accumulator::AppendOutcome;
use self::batch::{estimate_size, AppendRecord, RecordCompletion};
use self::interceptor::ProducerInterceptors;
use self::sender::{on_sender_task, Sender, SenderConfig};
use self::transaction::TransactionManager;
use crate::config::ProducerConfig;
use crate::metadata::{ClusterSnapshot, Metadata, PartitionInfo};
use crate::record::{now_millis, ProducerRecord, RecordMetadata, TopicPartition};
use crate::serializer::Serializer;
use crate::transport::Transport;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

static CLIENT_ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Assembles a [`Producer`] from its configuration and collaborators.
pub struct ProducerBuilder<K, V> {
    config: ProducerConfig,
    transport: Option<Arc<dyn Transport>>,
    key_serializer: Option<Arc<dyn Serializer<K>>>,
    value_serializer: Option<Arc<dyn Serializer<V>>>,
    partitioner: Option<Arc<dyn Partitioner>>,
    interceptors: Vec<Arc<dyn ProducerInterceptor<K, V>>>,
    resource: Option<Arc<dyn ExternalResource>>,
}

impl<K, V> ProducerBuilder<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: ProducerConfig) -> Self {
        Self {
            config,
            transport: None,
            key_serializer: None,
            value_serializer: None,
            partitioner: None,
            interceptors: Vec::new(),
            resource: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn key_serializer(mut self, serializer: impl Serializer<K> + 'static) -> Self {
        self.key_serializer = Some(Arc::new(serializer));
        self
    }

    pub fn value_serializer(mut self, serializer: impl Serializer<V> + 'static) -> Self {
        self.value_serializer = Some(Arc::new(serializer));
        self
    }

    /// Replaces the partitioner selected by `partitioner` in the
    /// configuration.
    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn ProducerInterceptor<K, V>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// The resource transactions commit against. Only used with
    /// `transactional = true`.
    pub fn external_resource(mut self, resource: Arc<dyn ExternalResource>) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Validates the configuration and starts the sender task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Producer<K, V>> {
        let mut config = self.config;
        config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| Error::Config("a transport is required".into()))?;
        let key_serializer = self
            .key_serializer
            .ok_or_else(|| Error::Config("a key serializer is required".into()))?;
        let value_serializer = self
            .value_serializer
            .ok_or_else(|| Error::Config("a value serializer is required".into()))?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::illegal_state(
                "A producer must be built inside a Tokio runtime",
            ));
        }

        let client_id = config.client_id.clone().unwrap_or_else(|| {
            format!(
                "producer-{}",
                CLIENT_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed)
            )
        });
        let partitioner = self
            .partitioner
            .unwrap_or_else(|| partitioner::from_kind(config.partitioner));

        let metadata = Arc::new(Metadata::new(
            config.retry_backoff(),
            config.metadata_max_age(),
            config.metadata_max_idle(),
        ));
        metadata.bootstrap(&config.bootstrap_servers, Instant::now())?;

        let accumulator = Arc::new(RecordAccumulator::new(
            AccumulatorConfig::from_producer_config(&config),
            config.buffer_memory,
        ));

        let producer_id = config
            .enable_idempotence
            .then(|| i64::from(rand::random::<u32>()));
        let sender = Sender::new(
            SenderConfig::from_producer_config(&config, client_id.clone(), producer_id),
            Arc::clone(&accumulator),
            Arc::clone(&metadata),
            transport,
        )
        .spawn();

        let transactions = config
            .transactional
            .then(|| Arc::new(TransactionManager::new(self.resource)));

        info!(
            client_id = %client_id,
            bootstrap_servers = ?config.bootstrap_servers,
            acks = ?config.acks,
            batch_size = config.batch_size,
            linger_ms = config.linger_ms,
            transactional = config.transactional,
            enable_idempotence = config.enable_idempotence,
            "Producer started"
        );

        Ok(Producer {
            inner: Arc::new(ProducerInner {
                client_id,
                config,
                metadata,
                accumulator,
                sender,
                partitioner,
                key_serializer,
                value_serializer,
                interceptors: Arc::new(ProducerInterceptors::new(self.interceptors)),
                transactions,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct ProducerInner<K, V> {
    client_id: String,
    config: ProducerConfig,
    metadata: Arc<Metadata>,
    accumulator: Arc<RecordAccumulator>,
    sender: SenderHandle,
    partitioner: Arc<dyn Partitioner>,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    interceptors: Arc<ProducerInterceptors<K, V>>,
    transactions: Option<Arc<TransactionManager>>,
    closed: AtomicBool,
}

impl<K, V> Drop for ProducerInner<K, V> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            debug!(
                client_id = %self.client_id,
                "Producer dropped without close, draining in the background"
            );
            self.sender.initiate_close();
        }
    }
}

/// A handle to a producer. Clones share the same accumulator and sender.
pub struct Producer<K, V> {
    inner: Arc<ProducerInner<K, V>>,
}

impl<K, V> Clone for Producer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Producer<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(config: ProducerConfig) -> ProducerBuilder<K, V> {
        ProducerBuilder::new(config)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// `None` unless the producer is transactional.
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.inner.transactions.as_ref().map(|tm| tm.state())
    }

    /// Sends a record asynchronously.
    ///
    /// Returns once the record is buffered; the returned future resolves
    /// when its batch is acknowledged or fails. The call may wait up to
    /// `max_block_ms` for metadata and buffer memory.
    ///
    /// Errors that concern only this record (metadata timeout, record too
    /// large, invalid or unauthorized topic) resolve the future with the
    /// error and invoke `callback`. Errors that concern the producer itself
    /// (closed, not in a transaction, serialization) are returned directly.
    pub async fn send(
        &self,
        record: ProducerRecord<K, V>,
        callback: Option<Callback>,
    ) -> Result<RecordFuture> {
        self.ensure_open()?;
        if let Some(err) = self.inner.sender.fatal_error() {
            return Err(err);
        }
        if let Some(tm) = &self.inner.transactions {
            tm.ensure_can_send()?;
        }
        let record = self.inner.interceptors.on_send(record);
        self.do_send(record, callback).await
    }

    async fn do_send(
        &self,
        record: ProducerRecord<K, V>,
        callback: Option<Callback>,
    ) -> Result<RecordFuture> {
        let inner = &self.inner;
        let callback = self.intercept_callback(callback);
        let start = Instant::now();
        let max_block = inner.config.max_block();

        let cluster = match self
            .wait_on_metadata(&record.topic, record.partition, max_block)
            .await
        {
            Ok(cluster) => cluster,
            Err(err) => return self.fail_record(&record.topic, record.partition, callback, err),
        };
        let remaining = max_block.saturating_sub(start.elapsed());

        let serialized = self.serialize(&record);
        let (key, value) = match serialized {
            Ok(serialized) => serialized,
            Err(err) => return self.fail_record(&record.topic, record.partition, callback, err),
        };

        let ProducerRecord {
            topic,
            partition,
            timestamp,
            headers,
            ..
        } = record;
        let explicit_partition = partition.is_some();
        let partition = match partition {
            Some(partition) => partition,
            None => inner
                .partitioner
                .partition(&topic, key.as_deref(), value.as_deref(), &cluster),
        };

        let size = estimate_size(key.as_deref(), value.as_deref(), &headers);
        if let Err(err) = self.ensure_valid_record_size(size) {
            return self.fail_record(&topic, Some(partition), callback, err);
        }

        let timestamp = timestamp.unwrap_or_else(now_millis);
        let mut tp = TopicPartition::new(topic, partition);
        trace!(topic_partition = %tp, size, "Attempting to append record");

        let abort_on_new_batch = inner.partitioner.abort_on_new_batch() && !explicit_partition;
        let append = AppendRecord::new(timestamp, key, value, headers, callback);
        let mut outcome = inner
            .accumulator
            .append(&tp, append, remaining, abort_on_new_batch, Instant::now())
            .await;

        if let Ok(AppendOutcome::AbortForNewBatch(append)) = outcome {
            let previous = tp.partition;
            inner.partitioner.on_new_batch(&tp.topic, &cluster, previous);
            let partition = inner.partitioner.partition(
                &tp.topic,
                append.key.as_deref(),
                append.value.as_deref(),
                &cluster,
            );
            tp = TopicPartition::new(tp.topic, partition);
            trace!(
                topic_partition = %tp,
                previous_partition = previous,
                "Retrying append due to new batch creation"
            );
            let remaining = max_block.saturating_sub(start.elapsed());
            outcome = inner
                .accumulator
                .append(&tp, append, remaining, false, Instant::now())
                .await;
        }

        match outcome {
            Ok(AppendOutcome::Appended(result)) => {
                if result.batch_is_full || result.new_batch_created {
                    trace!(
                        topic_partition = %tp,
                        "Waking up the sender since the batch is full or a new batch was created"
                    );
                    inner.sender.wakeup();
                }
                Ok(result.future)
            }
            Ok(AppendOutcome::AbortForNewBatch(append)) => {
                let err = Error::illegal_state("Append aborted twice for a new batch");
                append.fail(&tp.topic, Some(tp.partition), err.clone());
                Err(err)
            }
            // The accumulator has already completed the record's callback.
            Err(err) if err.is_record_error() => Ok(RecordFuture::failed(err)),
            Err(err) => Err(err),
        }
    }

    fn serialize(
        &self,
        record: &ProducerRecord<K, V>,
    ) -> Result<(Option<bytes::Bytes>, Option<bytes::Bytes>)> {
        let inner = &self.inner;
        let key = record
            .key
            .as_ref()
            .map(|key| {
                inner
                    .key_serializer
                    .serialize(&record.topic, &record.headers, key)
            })
            .transpose()?;
        let value = record
            .value
            .as_ref()
            .map(|value| {
                inner
                    .value_serializer
                    .serialize(&record.topic, &record.headers, value)
            })
            .transpose()?;
        Ok((key, value))
    }

    /// Wraps the user callback so interceptors and the transaction see
    /// every completion first.
    fn intercept_callback(&self, callback: Option<Callback>) -> Option<Callback> {
        let interceptors = Arc::clone(&self.inner.interceptors);
        let transactions = self.inner.transactions.clone();
        if interceptors.is_empty() && transactions.is_none() {
            return callback;
        }
        Some(Box::new(
            move |metadata: &RecordMetadata, err: Option<&Error>| {
                interceptors.on_acknowledgement(metadata, err);
                if let (Some(tm), Some(err)) = (&transactions, err) {
                    tm.record_send_error(err);
                }
                if let Some(callback) = callback {
                    callback(metadata, err);
                }
            },
        ))
    }

    /// Resolves a record that never reached the accumulator.
    ///
    /// Record-level errors complete the callback and a failed future;
    /// anything else is returned to the caller after notifying the
    /// interceptors.
    fn fail_record(
        &self,
        topic: &str,
        partition: Option<i32>,
        callback: Option<Callback>,
        err: Error,
    ) -> Result<RecordFuture> {
        debug!(topic, partition, error = %err, "Exception occurred during message send");
        let failed_as = RecordMetadata::unknown(topic, partition);
        if err.is_record_error() {
            let (completion, future) = RecordCompletion::new(callback);
            completion.complete(Err(err), &failed_as);
            return Ok(future);
        }
        self.inner.interceptors.on_acknowledgement(&failed_as, Some(&err));
        if let Some(tm) = &self.inner.transactions {
            tm.record_send_error(&err);
        }
        Err(err)
    }

    fn ensure_valid_record_size(&self, size: usize) -> Result<()> {
        let config = &self.inner.config;
        if size > config.max_request_size {
            return Err(Error::RecordTooLarge {
                message: format!(
                    "The message is {} bytes when serialized which is larger than {}, \
                     which is the value of the max_request_size configuration.",
                    size, config.max_request_size
                ),
            });
        }
        if size > config.buffer_memory {
            return Err(Error::RecordTooLarge {
                message: format!(
                    "The message is {} bytes when serialized which is larger than the total \
                     memory buffer you have configured with the buffer_memory configuration.",
                    size
                ),
            });
        }
        Ok(())
    }

    /// Waits until `topic` (and `partition`, if given) is present in the
    /// cluster metadata, up to `max_wait`.
    #[instrument(skip(self, max_wait), fields(client_id = %self.inner.client_id))]
    async fn wait_on_metadata(
        &self,
        topic: &str,
        partition: Option<i32>,
        max_wait: Duration,
    ) -> Result<Arc<ClusterSnapshot>> {
        if let Some(partition) = partition.filter(|p| *p < 0) {
            return Err(Error::illegal_state(format!(
                "Invalid partition given with record: {}",
                partition
            )));
        }

        let metadata = &self.inner.metadata;
        let start = Instant::now();
        metadata.add(topic, start);
        let mut cluster = metadata.fetch();

        loop {
            if cluster.invalid_topics().contains(topic) {
                return Err(Error::InvalidTopic(topic.to_string()));
            }
            if cluster.unauthorized_topics().contains(topic) {
                return Err(Error::Authorization {
                    message: format!("Not authorized to access topics: [{}]", topic),
                });
            }
            let count = cluster.partition_count_for_topic(topic);
            if let Some(count) = count {
                if partition.map_or(true, |p| (p as usize) < count) {
                    return Ok(cluster);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                return Err(metadata_timeout(topic, partition, count, max_wait));
            }

            trace!(topic, ?partition, "Requesting metadata update");
            let version = metadata.request_update();
            self.inner.sender.wakeup();
            match metadata.await_update(version, max_wait - elapsed).await {
                Ok(()) => {}
                Err(Error::Timeout { .. }) => {
                    return Err(metadata_timeout(topic, partition, count, max_wait));
                }
                Err(_) => {
                    return Err(Error::closed(
                        "Producer closed while metadata fetch was in progress",
                    ));
                }
            }
            cluster = metadata.fetch();
        }
    }

    /// Partitions of `topic`, waiting for its metadata if needed.
    pub async fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionInfo>> {
        self.ensure_open()?;
        let cluster = self
            .wait_on_metadata(topic, None, self.inner.config.max_block())
            .await?;
        Ok(cluster.partitions_for_topic(topic).to_vec())
    }

    /// Sends every buffered record and waits until each record accepted
    /// before this call has completed.
    pub async fn flush(&self) -> Result<()> {
        if on_sender_task() {
            return Err(Error::illegal_state(
                "flush() cannot be called from a completion callback",
            ));
        }
        self.flush_accumulated().await;
        Ok(())
    }

    /// Like [`flush`](Self::flush), failing with a timeout after `timeout`.
    pub async fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.flush()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "Flush did not complete within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn flush_accumulated(&self) {
        let inner = &self.inner;
        debug!(client_id = %inner.client_id, "Flushing accumulated records");
        let token = inner.accumulator.begin_flush();
        inner.sender.wakeup();
        inner.accumulator.await_flush_completion(&token).await;
    }

    /// Starts a transaction. Fails if one is already open or still
    /// beginning.
    ///
    /// Transactional mode is not safe for concurrent use: clones of one
    /// producer driving transactions from several tasks must coordinate
    /// through external locking.
    pub async fn begin_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        self.transactions()?.begin().await
    }

    /// Flushes every record of the open transaction, then commits the
    /// external resource.
    ///
    /// [`Error::Disconnected`] means the commit outcome is unknown; the
    /// producer must be closed rather than the commit retried.
    pub async fn commit_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        if on_sender_task() {
            return Err(Error::illegal_state(
                "commit_transaction() cannot be called from a completion callback",
            ));
        }
        let tm = self.transactions()?;
        tm.begin_commit()?;
        self.flush_accumulated().await;
        tm.complete_commit().await
    }

    /// Discards unsent records of the open transaction and rolls back the
    /// external resource.
    pub async fn abort_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        self.transactions()?.abort(&self.inner.accumulator).await
    }

    fn transactions(&self) -> Result<&TransactionManager> {
        self.inner.transactions.as_deref().ok_or_else(|| {
            Error::illegal_state("Producer is not transactional; set transactional = true")
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) || !self.inner.sender.is_running() {
            return Err(Error::closed(
                "Cannot perform operation after producer has been closed",
            ));
        }
        Ok(())
    }

    /// Closes the producer, waiting up to `timeout` (forever with `None`)
    /// for buffered records to be sent. Records still pending afterwards
    /// are failed.
    ///
    /// An open transaction is aborted first. Called from a completion
    /// callback, the close does not wait.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            debug!(client_id = %inner.client_id, "Producer already closed");
            return Ok(());
        }

        let mut timeout = timeout;
        info!(
            client_id = %inner.client_id,
            timeout_ms = ?timeout.map(|t| t.as_millis()),
            "Closing the producer"
        );

        let from_callback = on_sender_task();
        if from_callback && timeout != Some(Duration::ZERO) {
            warn!(
                client_id = %inner.client_id,
                "Overriding close timeout to 0 ms in order to prevent useless blocking due to \
                 self-join. This means you have incorrectly invoked close with a non-zero \
                 timeout from the producer callback."
            );
            timeout = Some(Duration::ZERO);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut first_error = None;

        if let Some(tm) = &inner.transactions {
            if tm.state() == TransactionState::InTransaction && !from_callback {
                info!(client_id = %inner.client_id, "Aborting the open transaction before close");
                let aborted = match deadline {
                    Some(deadline) => {
                        tokio::time::timeout_at(deadline, tm.abort(&inner.accumulator))
                            .await
                            .unwrap_or_else(|_| {
                                Err(Error::timeout("Timed out aborting the open transaction"))
                            })
                    }
                    None => tm.abort(&inner.accumulator).await,
                };
                if let Err(err) = aborted {
                    warn!(error = %err, "Failed to abort the open transaction during close");
                    first_error.get_or_insert(err);
                }
            }
        }

        if timeout != Some(Duration::ZERO) {
            inner.sender.initiate_close();
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            inner.sender.await_termination(remaining).await;
        }

        if inner.sender.state() != SenderState::Stopped {
            info!(
                client_id = %inner.client_id,
                "Proceeding to force close the producer since pending requests could not be \
                 completed within the timeout"
            );
            inner.sender.force_close();
            if !from_callback {
                inner.sender.await_termination(None).await;
            }
        }

        inner.interceptors.close();
        inner.partitioner.close();
        inner.key_serializer.close();
        inner.value_serializer.close();
        inner.metadata.close();
        if let Some(tm) = &inner.transactions {
            if !from_callback {
                tm.close().await;
            }
        }

        debug!(client_id = %inner.client_id, "Producer has been closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn metadata_timeout(
    topic: &str,
    partition: Option<i32>,
    count: Option<usize>,
    max_wait: Duration,
) -> Error {
    let message = match (partition, count) {
        (Some(partition), Some(count)) => format!(
            "Partition {} of topic {} with partition count {} is not present in metadata after {} ms.",
            partition,
            topic,
            count,
            max_wait.as_millis()
        ),
        _ => format!(
            "Topic {} not present in metadata after {} ms.",
            topic,
            max_wait.as_millis()
        ),
    };
    Error::timeout(message)
}
