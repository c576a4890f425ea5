//! Per-destination batch queues.
//!
//! The [`RecordAccumulator`] is the hand-off point between callers of `send`
//! and the sender task. Callers append records to the open batch at the tail
//! of their destination's queue; the sender asks which leaders have sendable
//! data ([`ready`](RecordAccumulator::ready)) and takes the head batches of
//! their partitions ([`drain`](RecordAccumulator::drain)).
//!
//! Queues are individually locked with short, non-async critical sections.
//! Waiting for memory happens outside any queue lock.

use super::batch::{AppendRecord, ProducerBatch, RecordFuture};
use super::buffer_pool::BufferPool;
use crate::metadata::{ClusterSnapshot, NodeId};
use crate::record::TopicPartition;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

type Deque = Arc<Mutex<VecDeque<ProducerBatch>>>;

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub batch_size: usize,
    pub linger: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub delivery_timeout: Duration,
    pub max_in_flight_per_partition: usize,
    pub enable_idempotence: bool,
}

impl AccumulatorConfig {
    pub fn from_producer_config(config: &crate::config::ProducerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            linger: config.linger(),
            retry_backoff: config.retry_backoff(),
            retry_backoff_max: config.retry_backoff_max(),
            delivery_timeout: config.delivery_timeout(),
            max_in_flight_per_partition: config.max_in_flight_requests_per_connection,
            enable_idempotence: config.enable_idempotence,
        }
    }
}

/// Result of a successful append.
#[derive(Debug)]
pub struct RecordAppendResult {
    pub future: RecordFuture,
    /// The destination has a batch that can be sent without waiting for linger.
    pub batch_is_full: bool,
    pub new_batch_created: bool,
}

#[derive(Debug)]
pub enum AppendOutcome {
    Appended(RecordAppendResult),
    /// A new batch would have been needed; the record is handed back so the
    /// caller can pick another partition first.
    AbortForNewBatch(AppendRecord),
}

#[derive(Debug, Default)]
pub struct ReadyCheckResult {
    pub ready_nodes: HashSet<NodeId>,
    /// How long until some batch may become ready.
    pub next_ready_check_delay: Duration,
    /// Topics with queued data but no known leader for some partition.
    pub unknown_leader_topics: HashSet<String>,
}

/// Ids of batches that have not completed yet.
#[derive(Default)]
struct IncompleteBatches {
    ids: Mutex<BTreeSet<u64>>,
    changed: Notify,
}

impl IncompleteBatches {
    fn lock(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, id: u64) {
        self.lock().insert(id);
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
        self.changed.notify_waiters();
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn any_below(&self, bound: u64) -> bool {
        self.lock().range(..bound).next().is_some()
    }

    async fn wait_until_none_below(&self, bound: u64) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.any_below(bound) {
                return;
            }
            notified.await;
        }
    }
}

/// Marks a flush in progress until dropped.
///
/// Holds the id of the first batch created after the flush began; the flush
/// is complete when every earlier batch has completed.
pub struct FlushToken {
    batch_id_bound: u64,
    flushes_in_progress: Arc<AtomicUsize>,
}

impl Drop for FlushToken {
    fn drop(&mut self) {
        self.flushes_in_progress.fetch_sub(1, Ordering::AcqRel);
    }
}

struct AppendGuard<'a>(&'a AtomicUsize);

impl Drop for AppendGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct RecordAccumulator {
    config: AccumulatorConfig,
    free: BufferPool,
    batches: RwLock<HashMap<TopicPartition, Deque>>,
    incomplete: IncompleteBatches,
    in_flight: Mutex<HashMap<TopicPartition, usize>>,
    next_sequence: Mutex<HashMap<TopicPartition, i32>>,
    drain_index: Mutex<HashMap<NodeId, usize>>,
    next_batch_id: AtomicU64,
    flushes_in_progress: Arc<AtomicUsize>,
    appends_in_progress: AtomicUsize,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordAccumulator {
    pub fn new(config: AccumulatorConfig, total_memory: usize) -> Self {
        let free = BufferPool::new(total_memory, config.batch_size);
        Self {
            config,
            free,
            batches: RwLock::new(HashMap::new()),
            incomplete: IncompleteBatches::default(),
            in_flight: Mutex::new(HashMap::new()),
            next_sequence: Mutex::new(HashMap::new()),
            drain_index: Mutex::new(HashMap::new()),
            next_batch_id: AtomicU64::new(1),
            flushes_in_progress: Arc::new(AtomicUsize::new(0)),
            appends_in_progress: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.free
    }

    fn deque(&self, tp: &TopicPartition) -> Option<Deque> {
        let batches = self.batches.read().unwrap_or_else(|p| p.into_inner());
        batches.get(tp).cloned()
    }

    fn get_or_create_deque(&self, tp: &TopicPartition) -> Deque {
        if let Some(dq) = self.deque(tp) {
            return dq;
        }
        let mut batches = self.batches.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(batches.entry(tp.clone()).or_default())
    }

    fn all_deques(&self) -> Vec<(TopicPartition, Deque)> {
        let batches = self.batches.read().unwrap_or_else(|p| p.into_inner());
        batches
            .iter()
            .map(|(tp, dq)| (tp.clone(), Arc::clone(dq)))
            .collect()
    }

    fn closed_error() -> Error {
        Error::closed("Producer closed while send in progress")
    }

    /// Appends to the open batch at the tail of the queue, if it has room.
    fn try_append(
        dq: &mut VecDeque<ProducerBatch>,
        record: AppendRecord,
        now: Instant,
    ) -> std::result::Result<RecordAppendResult, AppendRecord> {
        let queued = dq.len();
        let Some(last) = dq.back_mut() else {
            return Err(record);
        };
        match last.try_append(record, now) {
            Ok(future) => Ok(RecordAppendResult {
                future,
                batch_is_full: queued > 1 || last.is_full(),
                new_batch_created: false,
            }),
            Err(record) => {
                last.close();
                Err(record)
            }
        }
    }

    /// Appends a record to the queue of `tp`.
    ///
    /// If no open batch has room, a new block is allocated from the buffer
    /// pool, waiting up to `max_wait`. With `abort_on_new_batch` set, the
    /// record is handed back instead of allocating.
    ///
    /// On error the record's callback has already been invoked with the
    /// error.
    pub async fn append(
        &self,
        tp: &TopicPartition,
        record: AppendRecord,
        max_wait: Duration,
        abort_on_new_batch: bool,
        now: Instant,
    ) -> Result<AppendOutcome> {
        self.appends_in_progress.fetch_add(1, Ordering::AcqRel);
        let _guard = AppendGuard(&self.appends_in_progress);

        let dq = self.get_or_create_deque(tp);
        let record = {
            let mut dq = lock(&dq);
            if self.closed.load(Ordering::Acquire) {
                drop(dq);
                let err = Self::closed_error();
                record.fail(&tp.topic, Some(tp.partition), err.clone());
                return Err(err);
            }
            match Self::try_append(&mut dq, record, now) {
                Ok(result) => return Ok(AppendOutcome::Appended(result)),
                Err(record) => record,
            }
        };

        if abort_on_new_batch {
            return Ok(AppendOutcome::AbortForNewBatch(record));
        }

        let size = self.config.batch_size.max(record.estimated_size());
        trace!(topic_partition = %tp, size, "Allocating a new batch");
        let buffer = match self.free.allocate(size, max_wait).await {
            Ok(buffer) => buffer,
            Err(err) => {
                record.fail(&tp.topic, Some(tp.partition), err.clone());
                return Err(err);
            }
        };

        let mut dq = lock(&dq);
        if self.closed.load(Ordering::Acquire) {
            drop(dq);
            self.free.deallocate(buffer, size);
            let err = Self::closed_error();
            record.fail(&tp.topic, Some(tp.partition), err.clone());
            return Err(err);
        }

        // Another caller may have opened a batch while we waited for memory.
        let record = match Self::try_append(&mut dq, record, now) {
            Ok(result) => {
                self.free.deallocate(buffer, size);
                return Ok(AppendOutcome::Appended(result));
            }
            Err(record) => record,
        };

        let id = self.next_batch_id.fetch_add(1, Ordering::AcqRel);
        let mut batch = ProducerBatch::new(id, tp.clone(), buffer, size, now);
        let future = match batch.try_append(record, now) {
            Ok(future) => future,
            Err(record) => {
                // An empty batch accepts any record.
                drop(dq);
                let (buffer, size) = batch.into_buffer();
                self.free.deallocate(buffer, size);
                let err = Error::RecordTooLarge {
                    message: format!("Record does not fit into a new batch for {}", tp),
                };
                record.fail(&tp.topic, Some(tp.partition), err.clone());
                return Err(err);
            }
        };
        let batch_is_full = batch.is_full();
        dq.push_back(batch);
        self.incomplete.add(id);
        debug!(topic_partition = %tp, batch_id = id, "Created new batch");

        Ok(AppendOutcome::Appended(RecordAppendResult {
            future,
            batch_is_full: dq.len() > 1 || batch_is_full,
            new_batch_created: true,
        }))
    }

    fn is_muted(&self, tp: &TopicPartition) -> bool {
        lock(&self.in_flight)
            .get(tp)
            .is_some_and(|n| *n >= self.config.max_in_flight_per_partition)
    }

    /// Number of drained batches of `tp` that have not been returned.
    pub fn in_flight_count(&self, tp: &TopicPartition) -> usize {
        lock(&self.in_flight).get(tp).copied().unwrap_or(0)
    }

    /// Called by the sender when a drained batch has been completed or
    /// re-enqueued, unmuting its partition if it was at the cap.
    pub fn complete_in_flight(&self, tp: &TopicPartition) {
        let mut in_flight = lock(&self.in_flight);
        if let Some(n) = in_flight.get_mut(tp) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                in_flight.remove(tp);
            }
        }
    }

    fn flush_in_progress(&self) -> bool {
        self.flushes_in_progress.load(Ordering::Acquire) > 0
    }

    /// Determines which leaders have at least one sendable batch.
    ///
    /// A head batch is sendable when it is full, has lingered long enough,
    /// or when a flush, close, or memory shortage is in progress. Batches
    /// backing off after a failure are not sendable until their backoff ends.
    pub fn ready(&self, cluster: &ClusterSnapshot, now: Instant) -> ReadyCheckResult {
        let mut result = ReadyCheckResult {
            next_ready_check_delay: Duration::MAX,
            ..Default::default()
        };
        let exhausted = self.free.queued() > 0;
        let closed = self.closed.load(Ordering::Acquire);
        let flushing = self.flush_in_progress();

        for (tp, dq) in self.all_deques() {
            let dq = lock(&dq);
            let Some(batch) = dq.front() else {
                continue;
            };

            let expires_in = self
                .config
                .delivery_timeout
                .saturating_sub(now.saturating_duration_since(batch.created()));
            result.next_ready_check_delay = result.next_ready_check_delay.min(expires_in);

            let Some(leader) = cluster.leader_for(&tp) else {
                result.unknown_leader_topics.insert(tp.topic.clone());
                continue;
            };
            if result.ready_nodes.contains(&leader.id) || self.is_muted(&tp) {
                continue;
            }

            if let Some(retry_after) = batch.retry_after().filter(|_| batch.backing_off(now)) {
                result.next_ready_check_delay = result
                    .next_ready_check_delay
                    .min(retry_after.saturating_duration_since(now));
                continue;
            }

            let waited = batch.waited_time(now);
            let full = dq.len() > 1 || batch.is_full();
            let expired = waited >= self.config.linger;
            if full || expired || exhausted || closed || flushing {
                result.ready_nodes.insert(leader.id);
            } else {
                let left = self.config.linger.saturating_sub(waited);
                result.next_ready_check_delay = result.next_ready_check_delay.min(left);
            }
        }
        result
    }

    /// Takes the head batch of each unmuted partition led by the given
    /// nodes, up to `max_size` bytes per node.
    ///
    /// Partition order rotates between calls so that no partition is
    /// starved when requests are size-limited. Drained batches count against
    /// their partition's in-flight cap until
    /// [`complete_in_flight`](Self::complete_in_flight) is called.
    pub fn drain(
        &self,
        cluster: &ClusterSnapshot,
        nodes: &HashSet<NodeId>,
        max_size: usize,
        now: Instant,
    ) -> HashMap<NodeId, Vec<ProducerBatch>> {
        let mut drained = HashMap::new();
        for &node in nodes {
            let batches = self.drain_node(cluster, node, max_size, now);
            if !batches.is_empty() {
                drained.insert(node, batches);
            }
        }
        drained
    }

    fn drain_node(
        &self,
        cluster: &ClusterSnapshot,
        node: NodeId,
        max_size: usize,
        now: Instant,
    ) -> Vec<ProducerBatch> {
        let parts = cluster.partitions_for_node(node);
        if parts.is_empty() {
            return Vec::new();
        }

        let mut drain_index = lock(&self.drain_index);
        let start = drain_index.get(&node).copied().unwrap_or(0) % parts.len();
        let mut size = 0;
        let mut ready = Vec::new();

        for i in 0..parts.len() {
            let idx = (start + i) % parts.len();
            drain_index.insert(node, (idx + 1) % parts.len());

            let tp = parts[idx].topic_partition();
            if self.is_muted(&tp) {
                continue;
            }
            let Some(dq) = self.deque(&tp) else {
                continue;
            };
            let mut dq = lock(&dq);
            let Some(first) = dq.front() else {
                continue;
            };
            if first.backing_off(now) {
                continue;
            }
            if size + first.size_in_bytes() > max_size && !ready.is_empty() {
                // Leave it for the next request; at least one batch always goes.
                break;
            }
            let Some(mut batch) = dq.pop_front() else {
                continue;
            };
            drop(dq);

            if self.config.enable_idempotence && batch.base_sequence().is_none() {
                let mut sequences = lock(&self.next_sequence);
                let next = sequences.entry(tp.clone()).or_insert(0);
                batch.set_base_sequence(*next);
                *next = next.wrapping_add(batch.record_count() as i32);
            }

            batch.mark_in_flight(now);
            size += batch.size_in_bytes();
            *lock(&self.in_flight).entry(tp).or_insert(0) += 1;
            ready.push(batch);
        }
        ready
    }

    /// Removes queued batches that have exceeded the delivery timeout.
    ///
    /// The caller fails and deallocates them.
    pub fn expired_batches(&self, now: Instant) -> Vec<ProducerBatch> {
        let mut expired = Vec::new();
        for (_, dq) in self.all_deques() {
            let mut dq = lock(&dq);
            while let Some(batch) = dq.front() {
                if !batch.has_reached_delivery_timeout(self.config.delivery_timeout, now) {
                    break;
                }
                if let Some(mut batch) = dq.pop_front() {
                    batch.close();
                    expired.push(batch);
                }
            }
        }
        expired
    }

    /// Puts a batch that failed with a retriable error back at the head of
    /// its queue. With sequencing enabled the batch is placed before any
    /// batch with a higher sequence number.
    pub fn reenqueue(&self, mut batch: ProducerBatch, now: Instant) {
        batch.reenqueued(now, self.config.retry_backoff, self.config.retry_backoff_max);
        let tp = batch.topic_partition().clone();
        self.insert_at_head(batch);
        debug!(topic_partition = %tp, "Re-enqueued batch for retry");
    }

    /// Puts a drained batch that was never sent back at the head of its
    /// queue. Its attempt count and backoff are left untouched.
    pub fn requeue_unsent(&self, mut batch: ProducerBatch) {
        batch.unsent();
        let tp = batch.topic_partition().clone();
        self.insert_at_head(batch);
        self.complete_in_flight(&tp);
        debug!(topic_partition = %tp, "Returned unsent batch to its queue");
    }

    fn insert_at_head(&self, batch: ProducerBatch) {
        let tp = batch.topic_partition().clone();
        let dq = self.get_or_create_deque(&tp);
        let mut dq = lock(&dq);
        match batch.base_sequence().filter(|_| self.config.enable_idempotence) {
            Some(sequence) => {
                let pos = dq
                    .iter()
                    .position(|b| b.base_sequence().map_or(true, |s| s > sequence))
                    .unwrap_or(dq.len());
                dq.insert(pos, batch);
            }
            None => dq.push_front(batch),
        }
    }

    /// Returns a completed batch's memory to the pool.
    pub fn deallocate(&self, batch: ProducerBatch) {
        if !batch.is_done() {
            warn!(
                topic_partition = %batch.topic_partition(),
                "Deallocating a batch that has not completed"
            );
        }
        let id = batch.id();
        let (buffer, size) = batch.into_buffer();
        self.free.deallocate(buffer, size);
        self.incomplete.remove(id);
    }

    /// Makes every queued batch immediately sendable until the returned
    /// token is dropped.
    pub fn begin_flush(&self) -> FlushToken {
        self.flushes_in_progress.fetch_add(1, Ordering::AcqRel);
        FlushToken {
            batch_id_bound: self.next_batch_id.load(Ordering::Acquire),
            flushes_in_progress: Arc::clone(&self.flushes_in_progress),
        }
    }

    /// Waits until every batch created before `token` was issued has
    /// completed.
    pub async fn await_flush_completion(&self, token: &FlushToken) {
        self.incomplete
            .wait_until_none_below(token.batch_id_bound)
            .await;
    }

    pub fn has_undrained(&self) -> bool {
        self.all_deques().iter().any(|(_, dq)| !lock(dq).is_empty())
    }

    pub fn has_incomplete(&self) -> bool {
        !self.incomplete.is_empty()
    }

    /// Number of queued (not drained) batches for `tp`.
    pub fn queued_batches(&self, tp: &TopicPartition) -> usize {
        self.deque(tp).map_or(0, |dq| lock(&dq).len())
    }

    /// Fails every queued batch with `err` without sending it.
    pub fn abort_undrained_batches(&self, err: &Error) {
        let mut aborted = 0;
        for (_, dq) in self.all_deques() {
            let batches: Vec<ProducerBatch> = lock(&dq).drain(..).collect();
            for mut batch in batches {
                batch.fail(err);
                self.deallocate(batch);
                aborted += 1;
            }
        }
        if aborted > 0 {
            debug!(aborted, error = %err, "Aborted undrained batches");
        }
    }

    /// Fails every queued batch, waiting out appends that are still in
    /// progress so none slips in afterwards.
    pub async fn abort_incomplete_batches(&self, err: &Error) {
        loop {
            self.abort_undrained_batches(err);
            if self.appends_in_progress.load(Ordering::Acquire) == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        self.abort_undrained_batches(err);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects further appends and fails pending memory allocations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.free.close();
    }
}
