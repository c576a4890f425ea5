use crate::record::TopicPartition;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Broker node id. Bootstrap nodes use negative ids.
pub type NodeId = i32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// Parses a `host:port` seed address.
    pub fn parse_address(id: NodeId, address: &str) -> Result<Self> {
        let (host, port) = address
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid bootstrap address '{}'", address)))?;
        if host.is_empty() {
            return Err(Error::Config(format!(
                "Invalid bootstrap address '{}': missing host",
                address
            )));
        }
        let port = port.parse::<u16>().map_err(|e| {
            Error::Config(format!("Invalid port in bootstrap address '{}': {}", address, e))
        })?;
        Ok(Self::new(id, host, port))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (id: {})", self.host, self.port, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: i32,
    /// `None` while the partition is leaderless.
    pub leader: Option<NodeId>,
    pub replicas: Vec<NodeId>,
}

impl PartitionInfo {
    pub fn new(topic: impl Into<String>, partition: i32, leader: Option<NodeId>) -> Self {
        let replicas = leader.into_iter().collect();
        Self {
            topic: topic.into(),
            partition,
            leader,
            replicas,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// An immutable view of the cluster topology.
///
/// Built once per metadata response and replaced wholesale; readers hold an
/// `Arc` to the snapshot they fetched and never observe a partial update.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    nodes: HashMap<NodeId, Node>,
    partitions_by_topic: HashMap<String, Vec<PartitionInfo>>,
    available_partitions_by_topic: HashMap<String, Vec<PartitionInfo>>,
    partitions_by_node: HashMap<NodeId, Vec<PartitionInfo>>,
    leaders: HashMap<TopicPartition, NodeId>,
    invalid_topics: HashSet<String>,
    unauthorized_topics: HashSet<String>,
    is_bootstrap: bool,
}

impl ClusterSnapshot {
    pub fn new(
        nodes: Vec<Node>,
        partitions: Vec<PartitionInfo>,
        invalid_topics: HashSet<String>,
        unauthorized_topics: HashSet<String>,
    ) -> Self {
        let nodes: HashMap<NodeId, Node> = nodes.into_iter().map(|n| (n.id, n)).collect();

        let mut partitions_by_topic: HashMap<String, Vec<PartitionInfo>> = HashMap::new();
        let mut partitions_by_node: HashMap<NodeId, Vec<PartitionInfo>> = HashMap::new();
        let mut leaders = HashMap::new();
        for info in partitions {
            if let Some(leader) = info.leader {
                leaders.insert(info.topic_partition(), leader);
                partitions_by_node
                    .entry(leader)
                    .or_default()
                    .push(info.clone());
            }
            partitions_by_topic
                .entry(info.topic.clone())
                .or_default()
                .push(info);
        }

        let mut available_partitions_by_topic = HashMap::new();
        for (topic, infos) in partitions_by_topic.iter_mut() {
            infos.sort_by_key(|p| p.partition);
            let available: Vec<PartitionInfo> = infos
                .iter()
                .filter(|p| p.leader.is_some_and(|id| nodes.contains_key(&id)))
                .cloned()
                .collect();
            available_partitions_by_topic.insert(topic.clone(), available);
        }

        Self {
            nodes,
            partitions_by_topic,
            available_partitions_by_topic,
            partitions_by_node,
            leaders,
            invalid_topics,
            unauthorized_topics,
            is_bootstrap: false,
        }
    }

    /// A snapshot holding only the seed addresses, with ids `-1, -2, ...`.
    pub fn bootstrap(addresses: &[String]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(addresses.len());
        for (i, address) in addresses.iter().enumerate() {
            nodes.push(Node::parse_address(-(i as NodeId) - 1, address)?);
        }
        let mut snapshot = Self::new(nodes, Vec::new(), HashSet::new(), HashSet::new());
        snapshot.is_bootstrap = true;
        Ok(snapshot)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.is_bootstrap
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn leader_for(&self, tp: &TopicPartition) -> Option<&Node> {
        self.leaders.get(tp).and_then(|id| self.nodes.get(id))
    }

    pub fn partition_count_for_topic(&self, topic: &str) -> Option<usize> {
        self.partitions_by_topic.get(topic).map(|p| p.len())
    }

    pub fn partitions_for_topic(&self, topic: &str) -> &[PartitionInfo] {
        self.partitions_by_topic
            .get(topic)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Partitions of `topic` whose leader is a known node.
    pub fn available_partitions_for_topic(&self, topic: &str) -> &[PartitionInfo] {
        self.available_partitions_by_topic
            .get(topic)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn partitions_for_node(&self, node: NodeId) -> &[PartitionInfo] {
        self.partitions_by_node
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn topics(&self) -> impl Iterator<Item = &String> {
        self.partitions_by_topic.keys()
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.partitions_by_topic.contains_key(topic)
    }

    pub fn invalid_topics(&self) -> &HashSet<String> {
        &self.invalid_topics
    }

    pub fn unauthorized_topics(&self) -> &HashSet<String> {
        &self.unauthorized_topics
    }

    /// A copy of this snapshot with extra invalid-topic markers merged in.
    pub(crate) fn with_invalid_topics(&self, invalid: &HashSet<String>) -> Self {
        let mut snapshot = self.clone();
        snapshot.invalid_topics.extend(invalid.iter().cloned());
        snapshot
    }
}
