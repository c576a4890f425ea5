//! The connection layer the producer sends requests through.
//!
//! The producer never opens sockets itself. It hands fully formed
//! [`Request`]s to a [`Transport`] and interprets the [`Response`]s;
//! everything below that boundary (connection setup, framing, TLS) belongs to
//! the transport implementation. [`InMemoryBroker`] is an in-process
//! implementation used by the tests and the load generator.

pub mod memory;

pub use memory::InMemoryBroker;

use crate::metadata::{ClusterSnapshot, Node, NodeId, PartitionInfo};
use crate::record::TopicPartition;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` to `node` and waits up to `timeout` for its response.
    ///
    /// Connection loss is reported as [`Error::Disconnected`]; an expired
    /// `timeout` as [`Error::Timeout`].
    async fn send(&self, node: &Node, request: Request, timeout: Duration) -> Result<Response>;

    /// Whether a request to `node` can be issued right now.
    fn is_connected(&self, node: &Node) -> bool;
}

#[derive(Debug, Clone)]
pub enum Request {
    Produce(ProduceRequest),
    Metadata(MetadataRequest),
}

#[derive(Debug, Clone)]
pub enum Response {
    Produce(ProduceResponse),
    Metadata(MetadataResponse),
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub acks: i16,
    pub timeout_ms: u64,
    pub transactional_id: Option<String>,
    pub producer_id: Option<i64>,
    pub partitions: Vec<PartitionData>,
}

/// One batch for one partition inside a produce request.
#[derive(Debug, Clone)]
pub struct PartitionData {
    pub topic_partition: TopicPartition,
    pub records: Bytes,
    pub record_count: u32,
    pub base_sequence: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ProduceResponse {
    pub partitions: Vec<PartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct PartitionResponse {
    pub topic_partition: TopicPartition,
    pub error: Option<BrokerError>,
    pub base_offset: i64,
    /// Broker timestamp when the log uses append time, otherwise `-1`.
    pub log_append_time: i64,
}

#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub topics: Vec<String>,
    pub allow_auto_topic_creation: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataResponse {
    pub nodes: Vec<Node>,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub name: String,
    pub error: Option<BrokerError>,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub partition: i32,
    pub leader: Option<NodeId>,
    pub replicas: Vec<NodeId>,
}

impl MetadataResponse {
    /// Builds the snapshot this response describes, plus the topics it
    /// reported as invalid.
    ///
    /// Topics that are unknown or have no leader yet are left out of the
    /// snapshot so that callers keep waiting for them.
    pub fn into_snapshot(self) -> (ClusterSnapshot, HashSet<String>) {
        let mut invalid = HashSet::new();
        let mut unauthorized = HashSet::new();
        let mut partitions = Vec::new();

        for topic in self.topics {
            match topic.error {
                Some(BrokerError::InvalidTopic) => {
                    invalid.insert(topic.name);
                }
                Some(BrokerError::TopicAuthorizationFailed) => {
                    unauthorized.insert(topic.name);
                }
                Some(_) => {}
                None => {
                    for p in topic.partitions {
                        partitions.push(PartitionInfo {
                            topic: topic.name.clone(),
                            partition: p.partition,
                            leader: p.leader,
                            replicas: p.replicas,
                        });
                    }
                }
            }
        }

        let snapshot =
            ClusterSnapshot::new(self.nodes, partitions, invalid.clone(), unauthorized);
        (snapshot, invalid)
    }
}

/// Error codes a broker reports per topic or partition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("NOT_LEADER_OR_FOLLOWER")]
    NotLeaderOrFollower,
    #[error("UNKNOWN_TOPIC_OR_PARTITION")]
    UnknownTopicOrPartition,
    #[error("LEADER_NOT_AVAILABLE")]
    LeaderNotAvailable,
    #[error("REQUEST_TIMED_OUT")]
    RequestTimedOut,
    #[error("NOT_ENOUGH_REPLICAS")]
    NotEnoughReplicas,
    #[error("NETWORK_EXCEPTION")]
    NetworkException,
    #[error("CORRUPT_MESSAGE")]
    CorruptMessage,
    #[error("TOPIC_AUTHORIZATION_FAILED")]
    TopicAuthorizationFailed,
    #[error("INVALID_TOPIC_EXCEPTION")]
    InvalidTopic,
    #[error("MESSAGE_TOO_LARGE")]
    RecordTooLarge,
    #[error("UNSUPPORTED_VERSION")]
    UnsupportedVersion,
    #[error("OUT_OF_ORDER_SEQUENCE_NUMBER")]
    OutOfOrderSequence,
    #[error("UNKNOWN_SERVER_ERROR: {0}")]
    Unknown(String),
}

impl BrokerError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::NotLeaderOrFollower
                | BrokerError::UnknownTopicOrPartition
                | BrokerError::LeaderNotAvailable
                | BrokerError::RequestTimedOut
                | BrokerError::NotEnoughReplicas
                | BrokerError::NetworkException
                | BrokerError::CorruptMessage
        )
    }

    /// Errors after which the cached leader for the partition is stale.
    pub fn invalidates_metadata(&self) -> bool {
        matches!(
            self,
            BrokerError::NotLeaderOrFollower
                | BrokerError::UnknownTopicOrPartition
                | BrokerError::LeaderNotAvailable
                | BrokerError::NetworkException
        )
    }

    /// Errors after which this producer cannot send to any destination.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::UnsupportedVersion | BrokerError::OutOfOrderSequence
        )
    }

    /// Converts the broker code into the error delivered to records of `tp`.
    pub fn into_error(self, tp: &TopicPartition) -> Error {
        let message = format!("{} for {}", self, tp);
        match self {
            e if e.is_retriable() => Error::Retriable { message },
            BrokerError::TopicAuthorizationFailed => Error::Authorization { message },
            BrokerError::InvalidTopic => Error::InvalidTopic(tp.topic.clone()),
            BrokerError::RecordTooLarge => Error::RecordTooLarge { message },
            BrokerError::UnsupportedVersion => Error::Unsupported(message),
            _ => Error::Broker { message },
        }
    }
}
