//! Producer batches and per-record completion.
//!
//! A [`ProducerBatch`] owns one memory block from the
//! [`BufferPool`](super::buffer_pool::BufferPool) and writes records into it
//! in a compact length-prefixed layout:
//!
//! ```text
//! record  := timestamp:i64 key:bytes value:bytes header_count:i32 header*
//! header  := key:bytes value:bytes
//! bytes   := len:i32 (-1 for null) data[len]
//! ```
//!
//! Every appended record gets a [`RecordFuture`]; the batch resolves all of
//! them, in append order, exactly once.

use crate::record::{Header, RecordMetadata, TopicPartition, UNKNOWN};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, trace, warn};

/// Completion callback: receives the record metadata and, on failure, the
/// error. On failure the metadata carries `-1` for the offset.
pub type Callback = Box<dyn FnOnce(&RecordMetadata, Option<&Error>) + Send + 'static>;

const RECORD_OVERHEAD: usize = 8 + 4 + 4 + 4;
const HEADER_OVERHEAD: usize = 4 + 4;

/// Upper bound on the encoded size of a record.
pub fn estimate_size(key: Option<&[u8]>, value: Option<&[u8]>, headers: &[Header]) -> usize {
    RECORD_OVERHEAD
        + key.map_or(0, <[u8]>::len)
        + value.map_or(0, <[u8]>::len)
        + headers
            .iter()
            .map(|h| HEADER_OVERHEAD + h.key.len() + h.value.as_ref().map_or(0, Bytes::len))
            .sum::<usize>()
}

fn put_bytes(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
}

fn get_bytes(buf: &mut &[u8]) -> Result<Option<Bytes>> {
    if buf.remaining() < 4 {
        return Err(corrupt("truncated length prefix"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(corrupt("truncated field"));
    }
    Ok(Some(buf.copy_to_bytes(len)))
}

fn corrupt(what: &str) -> Error {
    Error::Broker {
        message: format!("Corrupt record batch: {}", what),
    }
}

/// A record as decoded from a batch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

/// Decodes a batch payload produced by [`ProducerBatch`].
pub fn decode_records(mut buf: &[u8]) -> Result<Vec<DecodedRecord>> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 8 {
            return Err(corrupt("truncated timestamp"));
        }
        let timestamp = buf.get_i64();
        let key = get_bytes(&mut buf)?;
        let value = get_bytes(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(corrupt("truncated header count"));
        }
        let header_count = buf.get_i32();
        if header_count < 0 {
            return Err(corrupt("negative header count"));
        }
        let mut headers = Vec::with_capacity(header_count as usize);
        for _ in 0..header_count {
            let key = get_bytes(&mut buf)?.ok_or_else(|| corrupt("null header key"))?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| corrupt("header key"))?;
            let value = get_bytes(&mut buf)?;
            headers.push(Header { key, value });
        }
        records.push(DecodedRecord {
            timestamp,
            key,
            value,
            headers,
        });
    }
    Ok(records)
}

/// The future returned by `send`, resolved when the record's batch completes.
#[must_use = "futures do nothing unless awaited or polled"]
pub struct RecordFuture {
    rx: oneshot::Receiver<Result<RecordMetadata>>,
    done: Arc<AtomicBool>,
}

impl RecordFuture {
    /// A future that is already resolved with `err`.
    pub(crate) fn failed(err: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            rx,
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the record has been acknowledged or failed, and its callback
    /// has run.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RecordFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFuture")
            .field("done", &self.is_done())
            .finish()
    }
}

impl Future for RecordFuture {
    type Output = Result<RecordMetadata>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Interrupted(
                "record was dropped before completion".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The producing half of a [`RecordFuture`], plus the record's callback.
pub(crate) struct RecordCompletion {
    callback: Option<Callback>,
    tx: oneshot::Sender<Result<RecordMetadata>>,
    done: Arc<AtomicBool>,
}

impl RecordCompletion {
    pub(crate) fn new(callback: Option<Callback>) -> (Self, RecordFuture) {
        let (tx, rx) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));
        (
            Self {
                callback,
                tx,
                done: Arc::clone(&done),
            },
            RecordFuture { rx, done },
        )
    }

    /// Runs the callback, then resolves the future. A panicking callback is
    /// logged and does not prevent the future from resolving.
    pub(crate) fn complete(mut self, result: Result<RecordMetadata>, failed_as: &RecordMetadata) {
        if let Some(callback) = self.callback.take() {
            let (metadata, err) = match &result {
                Ok(metadata) => (metadata, None),
                Err(e) => (failed_as, Some(e)),
            };
            if catch_unwind(AssertUnwindSafe(|| callback(metadata, err))).is_err() {
                error!(
                    topic = %failed_as.topic,
                    partition = failed_as.partition,
                    "Completion callback panicked"
                );
            }
        }
        self.done.store(true, Ordering::Release);
        let _ = self.tx.send(result);
    }
}

/// A record waiting to be appended, handed back to the caller when the
/// append could not take place.
pub struct AppendRecord {
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    pub(crate) callback: Option<Callback>,
}

impl AppendRecord {
    pub fn new(
        timestamp: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Vec<Header>,
        callback: Option<Callback>,
    ) -> Self {
        Self {
            timestamp,
            key,
            value,
            headers,
            callback,
        }
    }

    pub fn estimated_size(&self) -> usize {
        estimate_size(self.key.as_deref(), self.value.as_deref(), &self.headers)
    }

    /// Fails the record without it ever reaching a batch.
    pub(crate) fn fail(self, topic: &str, partition: Option<i32>, err: Error) {
        let (completion, _future) = RecordCompletion::new(self.callback);
        completion.complete(Err(err), &RecordMetadata::unknown(topic, partition));
    }
}

impl std::fmt::Debug for AppendRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendRecord")
            .field("timestamp", &self.timestamp)
            .field("key_len", &self.key.as_ref().map(Bytes::len))
            .field("value_len", &self.value.as_ref().map(Bytes::len))
            .field("headers", &self.headers.len())
            .finish()
    }
}

struct Thunk {
    completion: RecordCompletion,
    timestamp: i64,
    key_size: i32,
    value_size: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Closed,
    InFlight,
    Done,
    Failed,
}

pub struct ProducerBatch {
    id: u64,
    topic_partition: TopicPartition,
    buffer: BytesMut,
    capacity: usize,
    state: BatchState,
    thunks: Vec<Thunk>,
    created: Instant,
    last_append: Instant,
    last_attempt: Instant,
    attempts: u32,
    retry_after: Option<Instant>,
    base_sequence: Option<i32>,
}

impl ProducerBatch {
    pub fn new(
        id: u64,
        topic_partition: TopicPartition,
        buffer: BytesMut,
        capacity: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            topic_partition,
            buffer,
            capacity,
            state: BatchState::Open,
            thunks: Vec::new(),
            created: now,
            last_append: now,
            last_attempt: now,
            attempts: 0,
            retry_after: None,
            base_sequence: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn record_count(&self) -> usize {
        self.thunks.len()
    }

    /// Bytes written so far.
    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Size of the memory block backing this batch.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn base_sequence(&self) -> Option<i32> {
        self.base_sequence
    }

    pub(crate) fn set_base_sequence(&mut self, sequence: i32) {
        self.base_sequence = Some(sequence);
    }

    /// Appends the record if it fits, returning it untouched otherwise.
    ///
    /// The first record always fits: the block was allocated for it.
    pub(crate) fn try_append(
        &mut self,
        record: AppendRecord,
        now: Instant,
    ) -> std::result::Result<RecordFuture, AppendRecord> {
        if self.state != BatchState::Open {
            return Err(record);
        }
        let size = record.estimated_size();
        if !self.thunks.is_empty() && self.buffer.len() + size > self.capacity {
            return Err(record);
        }

        self.buffer.put_i64(record.timestamp);
        put_bytes(&mut self.buffer, record.key.as_deref());
        put_bytes(&mut self.buffer, record.value.as_deref());
        self.buffer.put_i32(record.headers.len() as i32);
        for header in &record.headers {
            put_bytes(&mut self.buffer, Some(header.key.as_bytes()));
            put_bytes(&mut self.buffer, header.value.as_deref());
        }

        let (completion, future) = RecordCompletion::new(record.callback);
        self.thunks.push(Thunk {
            completion,
            timestamp: record.timestamp,
            key_size: record.key.as_ref().map_or(UNKNOWN as i32, |k| k.len() as i32),
            value_size: record.value.as_ref().map_or(UNKNOWN as i32, |v| v.len() as i32),
        });
        self.last_append = now;
        trace!(
            topic_partition = %self.topic_partition,
            records = self.thunks.len(),
            bytes = self.buffer.len(),
            "Appended record to batch"
        );
        Ok(future)
    }

    /// Whether no further records can be appended.
    pub fn is_full(&self) -> bool {
        self.state != BatchState::Open || self.buffer.len() + RECORD_OVERHEAD > self.capacity
    }

    /// Stops accepting appends.
    pub fn close(&mut self) {
        if self.state == BatchState::Open {
            self.state = BatchState::Closed;
        }
    }

    pub(crate) fn mark_in_flight(&mut self, now: Instant) {
        self.close();
        self.state = BatchState::InFlight;
        self.last_attempt = now;
    }

    /// Prepares the batch for another attempt after a retriable failure.
    pub(crate) fn reenqueued(&mut self, now: Instant, backoff: Duration, backoff_max: Duration) {
        self.attempts += 1;
        self.state = BatchState::Closed;
        self.last_attempt = now;
        self.retry_after = Some(now + retry_backoff(self.attempts, backoff, backoff_max));
    }

    /// Returns a drained batch to the queue without counting an attempt.
    pub(crate) fn unsent(&mut self) {
        self.state = BatchState::Closed;
    }

    pub fn in_retry(&self) -> bool {
        self.attempts > 0
    }

    /// Whether the batch must wait before its next attempt.
    pub fn backing_off(&self, now: Instant) -> bool {
        self.retry_after.is_some_and(|after| now < after)
    }

    pub fn retry_after(&self) -> Option<Instant> {
        self.retry_after
    }

    /// Time the batch has waited since its last append or attempt.
    pub fn waited_time(&self, now: Instant) -> Duration {
        let since = if self.in_retry() {
            self.last_attempt
        } else {
            self.last_append.max(self.created)
        };
        now.saturating_duration_since(since)
    }

    pub fn has_reached_delivery_timeout(&self, delivery_timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= delivery_timeout
    }

    /// The encoded records, for a produce request.
    pub fn records(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, BatchState::Done | BatchState::Failed)
    }

    /// Resolves every record as written at `base_offset`.
    ///
    /// Returns `false` if the batch had already been completed.
    pub(crate) fn complete(&mut self, base_offset: i64, log_append_time: i64) -> bool {
        if self.is_done() {
            warn!(
                topic_partition = %self.topic_partition,
                "Ignoring duplicate completion of a batch"
            );
            return false;
        }
        self.state = BatchState::Done;
        let tp = &self.topic_partition;
        for (i, thunk) in self.thunks.drain(..).enumerate() {
            let offset = if base_offset < 0 {
                UNKNOWN
            } else {
                base_offset + i as i64
            };
            let timestamp = if log_append_time >= 0 {
                log_append_time
            } else {
                thunk.timestamp
            };
            let metadata = RecordMetadata {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset,
                timestamp,
                serialized_key_size: thunk.key_size,
                serialized_value_size: thunk.value_size,
            };
            let failed_as = RecordMetadata::unknown(tp.topic.clone(), Some(tp.partition));
            thunk.completion.complete(Ok(metadata), &failed_as);
        }
        true
    }

    /// Fails every record with `err`.
    ///
    /// Returns `false` if the batch had already been completed.
    pub(crate) fn fail(&mut self, err: &Error) -> bool {
        if self.is_done() {
            warn!(
                topic_partition = %self.topic_partition,
                error = %err,
                "Ignoring failure of an already completed batch"
            );
            return false;
        }
        self.state = BatchState::Failed;
        let failed_as = RecordMetadata::unknown(
            self.topic_partition.topic.clone(),
            Some(self.topic_partition.partition),
        );
        for thunk in self.thunks.drain(..) {
            thunk.completion.complete(Err(err.clone()), &failed_as);
        }
        true
    }

    /// Releases the memory block, emptied, with the size it was allocated at.
    pub(crate) fn into_buffer(mut self) -> (BytesMut, usize) {
        self.buffer.clear();
        (self.buffer, self.capacity)
    }
}

impl std::fmt::Debug for ProducerBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerBatch")
            .field("id", &self.id)
            .field("topic_partition", &self.topic_partition)
            .field("state", &self.state)
            .field("records", &self.thunks.len())
            .field("bytes", &self.buffer.len())
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Exponential backoff with 20% jitter, capped at `max`.
pub(crate) fn retry_backoff(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).min(31);
    let backoff = base.saturating_mul(1u32 << exp).min(max);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    backoff.mul_f64(jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn record(value: &str) -> AppendRecord {
        AppendRecord::new(
            1_000,
            Some(Bytes::from_static(b"key")),
            Some(Bytes::copy_from_slice(value.as_bytes())),
            vec![Header::new("h", "v")],
            None,
        )
    }

    fn batch(capacity: usize) -> ProducerBatch {
        ProducerBatch::new(
            1,
            TopicPartition::new("orders", 0),
            BytesMut::with_capacity(capacity),
            capacity,
            Instant::now(),
        )
    }

    #[test]
    fn test_append_until_full() {
        let mut batch = batch(128);
        let now = Instant::now();
        let size = record("aaaa").estimated_size();
        let fits = 128 / size;
        for _ in 0..fits {
            assert!(batch.try_append(record("aaaa"), now).is_ok());
        }
        assert!(batch.try_append(record("aaaa"), now).is_err());
        assert_eq!(batch.record_count(), fits);
    }

    #[test]
    fn test_first_record_always_fits() {
        let mut batch = batch(8);
        assert!(batch.try_append(record("larger than the block"), Instant::now()).is_ok());
        assert!(batch.try_append(record("x"), Instant::now()).is_err());
    }

    #[test]
    fn test_encoding_decodes() {
        let mut batch = batch(1024);
        let now = Instant::now();
        let _ = batch.try_append(record("first"), now);
        let _ = batch.try_append(
            AppendRecord::new(2_000, None, Some(Bytes::from_static(b"second")), vec![], None),
            now,
        );

        let decoded = decode_records(&batch.records()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].key.as_deref(), Some(&b"key"[..]));
        assert_eq!(decoded[0].headers[0].key, "h");
        assert_eq!(decoded[1].key, None);
        assert_eq!(decoded[1].timestamp, 2_000);
        assert_eq!(batch.size_in_bytes(), record("first").estimated_size() + 4 + 6 + 8 + 4 + 4);
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        assert!(decode_records(&[0, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_complete_fires_callbacks_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut batch = batch(1024);
        let now = Instant::now();
        let mut futures = Vec::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            let mut rec = record("v");
            rec.callback = Some(Box::new(move |metadata: &RecordMetadata, err: Option<&Error>| {
                assert!(err.is_none());
                order.lock().unwrap().push((i, metadata.offset));
            }));
            futures.push(batch.try_append(rec, now).unwrap());
        }

        assert!(batch.complete(100, -1));
        assert!(!batch.complete(200, -1));
        assert_eq!(*order.lock().unwrap(), vec![(0, 100), (1, 101), (2, 102)]);
        for (i, future) in futures.into_iter().enumerate() {
            assert!(future.is_done());
            assert_eq!(future.await.unwrap().offset, 100 + i as i64);
        }
    }

    #[tokio::test]
    async fn test_fail_delivers_error_and_sentinel() {
        let mut batch = batch(1024);
        let seen = Arc::new(Mutex::new(None));
        let mut rec = record("v");
        {
            let seen = Arc::clone(&seen);
            rec.callback = Some(Box::new(move |metadata: &RecordMetadata, err: Option<&Error>| {
                *seen.lock().unwrap() = Some((metadata.offset, err.cloned()));
            }));
        }
        let future = batch.try_append(rec, Instant::now()).unwrap();
        let err = Error::timeout("expired");
        assert!(batch.fail(&err));

        assert_eq!(future.await.unwrap_err(), err);
        let (offset, seen_err) = seen.lock().unwrap().take().unwrap();
        assert_eq!(offset, -1);
        assert_eq!(seen_err, Some(err));
    }

    #[tokio::test]
    async fn test_panicking_callback_is_isolated() {
        let mut batch = batch(1024);
        let mut rec = record("v");
        rec.callback = Some(Box::new(|_: &RecordMetadata, _: Option<&Error>| {
            panic!("callback failure")
        }));
        let future = batch.try_append(rec, Instant::now()).unwrap();
        batch.complete(0, -1);
        assert_eq!(future.await.unwrap().offset, 0);
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        let first = retry_backoff(1, base, max);
        assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));
        assert!(retry_backoff(10, base, max) <= max);
    }

    #[test]
    fn test_reenqueue_sets_backoff() {
        let mut batch = batch(64);
        let now = Instant::now();
        batch.mark_in_flight(now);
        batch.reenqueued(now, Duration::from_millis(100), Duration::from_millis(1_000));
        assert!(batch.in_retry());
        assert!(batch.backing_off(now));
        assert!(!batch.backing_off(now + Duration::from_millis(200)));
        assert_eq!(batch.state(), BatchState::Closed);
    }
}
