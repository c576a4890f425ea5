//! Records submitted by applications and the metadata returned for them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A destination: one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A record header. Names may repeat; order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Option<Bytes>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// A record to be sent to a topic.
///
/// The record is moved into [`Producer::send`](crate::Producer::send), so
/// its headers cannot be changed by the caller once submitted.
#[derive(Debug, Clone)]
pub struct ProducerRecord<K, V> {
    pub topic: String,
    pub partition: Option<i32>,
    pub timestamp: Option<i64>,
    pub key: Option<K>,
    pub value: Option<V>,
    pub headers: Vec<Header>,
}

impl<K, V> ProducerRecord<K, V> {
    pub fn new(topic: impl Into<String>, value: V) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            timestamp: None,
            key: None,
            value: Some(value),
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: K) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }
}

/// Where a record ended up.
///
/// `offset` is the broker-assigned offset, or `-1` when the record failed or
/// the broker did not report one (`acks = 0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub serialized_key_size: i32,
    pub serialized_value_size: i32,
}

/// Offset, partition and timestamp value used when they are not known.
pub const UNKNOWN: i64 = -1;

impl RecordMetadata {
    /// Metadata for a record that never received an offset.
    pub fn unknown(topic: impl Into<String>, partition: Option<i32>) -> Self {
        Self {
            topic: topic.into(),
            partition: partition.unwrap_or(UNKNOWN as i32),
            offset: UNKNOWN,
            timestamp: UNKNOWN,
            serialized_key_size: UNKNOWN as i32,
            serialized_value_size: UNKNOWN as i32,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn has_offset(&self) -> bool {
        self.offset != UNKNOWN
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
