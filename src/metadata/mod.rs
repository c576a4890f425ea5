pub mod cache;
pub mod cluster;

pub use cache::Metadata;
pub use cluster::{ClusterSnapshot, Node, NodeId, PartitionInfo};
