//! An in-process broker implementing [`Transport`].
//!
//! It keeps a log per partition, answers metadata requests, and can be told
//! to misbehave: fail the next produce requests with a broker error, drop
//! connections, delay or hold responses, or move partition leadership.
//! Integration tests and the `txq-producer` load generator run against it.

use super::{
    BrokerError, MetadataRequest, MetadataResponse, PartitionMetadata, PartitionResponse,
    ProduceRequest, ProduceResponse, Request, Response, TopicMetadata, Transport,
};
use crate::metadata::{Node, NodeId};
use crate::producer::batch::{decode_records, DecodedRecord};
use crate::record::{now_millis, TopicPartition};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// A record stored in a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub offset: i64,
    pub record: DecodedRecord,
}

/// A scripted reaction to the next produce request.
#[derive(Debug, Clone)]
pub enum ProduceFault {
    /// Every partition in the request fails with this error.
    Error(BrokerError),
    /// The connection drops before a response is sent.
    Disconnect,
    /// The response is delayed.
    Delay(Duration),
}

struct PartitionLog {
    leader: NodeId,
    records: Vec<StoredRecord>,
}

struct BrokerState {
    nodes: Vec<Node>,
    topics: HashMap<String, Vec<PartitionLog>>,
    auto_create_partitions: Option<i32>,
    unauthorized_topics: HashSet<String>,
    disconnected: HashSet<NodeId>,
    produce_faults: VecDeque<ProduceFault>,
    next_leader: usize,
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    paused: watch::Sender<bool>,
    produce_requests: AtomicUsize,
    metadata_requests: AtomicUsize,
}

fn valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 249
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl InMemoryBroker {
    /// A cluster of `node_count` brokers with ids `0..node_count`, listening
    /// on `localhost:9092` and up.
    pub fn new(node_count: usize) -> Self {
        let nodes = (0..node_count.max(1))
            .map(|id| Node::new(id as NodeId, "localhost", 9092 + id as u16))
            .collect();
        let (paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(BrokerState {
                nodes,
                topics: HashMap::new(),
                auto_create_partitions: None,
                unauthorized_topics: HashSet::new(),
                disconnected: HashSet::new(),
                produce_faults: VecDeque::new(),
                next_leader: 0,
            }),
            paused,
            produce_requests: AtomicUsize::new(0),
            metadata_requests: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed addresses for the producer configuration.
    pub fn bootstrap_servers(&self) -> Vec<String> {
        self.lock()
            .nodes
            .iter()
            .map(|n| format!("{}:{}", n.host, n.port))
            .collect()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.lock().nodes.clone()
    }

    /// Creates `topic` with leaders assigned round-robin across nodes.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.lock();
        Self::create_topic_locked(&mut state, topic, partitions);
    }

    fn create_topic_locked(state: &mut BrokerState, topic: &str, partitions: i32) {
        if state.topics.contains_key(topic) {
            return;
        }
        let mut logs = Vec::with_capacity(partitions.max(0) as usize);
        for _ in 0..partitions {
            let leader = state.nodes[state.next_leader % state.nodes.len()].id;
            state.next_leader += 1;
            logs.push(PartitionLog {
                leader,
                records: Vec::new(),
            });
        }
        debug!(topic, partitions, "Created topic");
        state.topics.insert(topic.to_string(), logs);
    }

    pub fn with_topic(self, topic: &str, partitions: i32) -> Self {
        self.create_topic(topic, partitions);
        self
    }

    /// Unknown topics requested with auto-creation allowed get
    /// `partitions` partitions.
    pub fn with_auto_create(self, partitions: i32) -> Self {
        self.lock().auto_create_partitions = Some(partitions);
        self
    }

    pub fn deny_topic(&self, topic: &str) {
        self.lock().unauthorized_topics.insert(topic.to_string());
    }

    pub fn leader_for(&self, tp: &TopicPartition) -> Option<NodeId> {
        self.lock()
            .topics
            .get(&tp.topic)
            .and_then(|logs| logs.get(tp.partition as usize))
            .map(|log| log.leader)
    }

    /// Moves leadership of `tp` to `leader`.
    pub fn set_leader(&self, tp: &TopicPartition, leader: NodeId) {
        let mut state = self.lock();
        if let Some(log) = state
            .topics
            .get_mut(&tp.topic)
            .and_then(|logs| logs.get_mut(tp.partition as usize))
        {
            log.leader = leader;
        }
    }

    pub fn disconnect(&self, node: NodeId) {
        self.lock().disconnected.insert(node);
    }

    pub fn reconnect(&self, node: NodeId) {
        self.lock().disconnected.remove(&node);
    }

    /// Queues a reaction for the next produce request.
    pub fn inject_produce_fault(&self, fault: ProduceFault) {
        self.lock().produce_faults.push_back(fault);
    }

    /// Holds produce requests until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn records(&self, tp: &TopicPartition) -> Vec<StoredRecord> {
        self.lock()
            .topics
            .get(&tp.topic)
            .and_then(|logs| logs.get(tp.partition as usize))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Values of every record in `tp`, in offset order.
    pub fn values(&self, tp: &TopicPartition) -> Vec<Vec<u8>> {
        self.records(tp)
            .into_iter()
            .filter_map(|r| r.record.value.map(|v| v.to_vec()))
            .collect()
    }

    pub fn produce_request_count(&self) -> usize {
        self.produce_requests.load(Ordering::Acquire)
    }

    pub fn metadata_request_count(&self) -> usize {
        self.metadata_requests.load(Ordering::Acquire)
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    async fn handle_produce(&self, node: &Node, request: ProduceRequest) -> Result<Response> {
        self.produce_requests.fetch_add(1, Ordering::AcqRel);
        self.wait_while_paused().await;

        let fault = self.lock().produce_faults.pop_front();
        let forced_error = match fault {
            Some(ProduceFault::Disconnect) => {
                return Err(Error::disconnected(format!(
                    "Connection to node {} was lost",
                    node.id
                )));
            }
            Some(ProduceFault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                None
            }
            Some(ProduceFault::Error(err)) => Some(err),
            None => None,
        };

        let mut state = self.lock();
        let mut response = ProduceResponse::default();
        for data in request.partitions {
            let tp = data.topic_partition;
            let result = match forced_error.clone() {
                Some(err) => Err(err),
                None => Self::append_locked(&mut state, node.id, &tp, &data.records),
            };
            let (error, base_offset) = match result {
                Ok(offset) => (None, offset),
                Err(err) => (Some(err), -1),
            };
            trace!(topic_partition = %tp, base_offset, ?error, "Handled produce");
            response.partitions.push(PartitionResponse {
                topic_partition: tp,
                error,
                base_offset,
                log_append_time: -1,
            });
        }
        Ok(Response::Produce(response))
    }

    fn append_locked(
        state: &mut BrokerState,
        node: NodeId,
        tp: &TopicPartition,
        payload: &[u8],
    ) -> std::result::Result<i64, BrokerError> {
        if state.unauthorized_topics.contains(&tp.topic) {
            return Err(BrokerError::TopicAuthorizationFailed);
        }
        let log = state
            .topics
            .get_mut(&tp.topic)
            .and_then(|logs| logs.get_mut(tp.partition as usize))
            .ok_or(BrokerError::UnknownTopicOrPartition)?;
        if log.leader != node {
            return Err(BrokerError::NotLeaderOrFollower);
        }
        let records = decode_records(payload).map_err(|_| BrokerError::CorruptMessage)?;
        let base_offset = log.records.len() as i64;
        let timestamp = now_millis();
        for (i, mut record) in records.into_iter().enumerate() {
            if record.timestamp < 0 {
                record.timestamp = timestamp;
            }
            log.records.push(StoredRecord {
                offset: base_offset + i as i64,
                record,
            });
        }
        Ok(base_offset)
    }

    fn handle_metadata(&self, request: MetadataRequest) -> Response {
        self.metadata_requests.fetch_add(1, Ordering::AcqRel);
        let mut state = self.lock();
        let mut topics = Vec::with_capacity(request.topics.len());

        for name in request.topics {
            if state.unauthorized_topics.contains(&name) {
                topics.push(TopicMetadata {
                    name,
                    error: Some(BrokerError::TopicAuthorizationFailed),
                    partitions: Vec::new(),
                });
                continue;
            }
            if !valid_topic_name(&name) {
                topics.push(TopicMetadata {
                    name,
                    error: Some(BrokerError::InvalidTopic),
                    partitions: Vec::new(),
                });
                continue;
            }
            if !state.topics.contains_key(&name) {
                match state.auto_create_partitions {
                    Some(partitions) if request.allow_auto_topic_creation => {
                        Self::create_topic_locked(&mut state, &name, partitions);
                        // Like a real broker, the new topic has no leader yet.
                        topics.push(TopicMetadata {
                            name,
                            error: Some(BrokerError::LeaderNotAvailable),
                            partitions: Vec::new(),
                        });
                    }
                    _ => topics.push(TopicMetadata {
                        name,
                        error: Some(BrokerError::UnknownTopicOrPartition),
                        partitions: Vec::new(),
                    }),
                }
                continue;
            }

            let partitions = state.topics[&name]
                .iter()
                .enumerate()
                .map(|(i, log)| PartitionMetadata {
                    partition: i as i32,
                    leader: Some(log.leader),
                    replicas: vec![log.leader],
                })
                .collect();
            topics.push(TopicMetadata {
                name,
                error: None,
                partitions,
            });
        }

        Response::Metadata(MetadataResponse {
            nodes: state.nodes.clone(),
            topics,
        })
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn send(&self, node: &Node, request: Request, timeout: Duration) -> Result<Response> {
        if !self.is_connected(node) {
            return Err(Error::disconnected(format!("Node {} is not reachable", node)));
        }
        let handle = async {
            match request {
                Request::Produce(produce) => self.handle_produce(node, produce).await,
                Request::Metadata(metadata) => Ok(self.handle_metadata(metadata)),
            }
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "Request to node {} timed out after {} ms",
                node.id,
                timeout.as_millis()
            ))),
        }
    }

    fn is_connected(&self, node: &Node) -> bool {
        !self.lock().disconnected.contains(&node.id)
    }
}
