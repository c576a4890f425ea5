//! Partition selection for records without an explicit partition.
//!
//! Keyed records are hashed with murmur2 so that a key always lands on the
//! same partition for a fixed partition count. Unkeyed records stick to one
//! partition per topic until the accumulator has to open a new batch, at
//! which point [`Partitioner::on_new_batch`] moves the topic to another
//! partition. This fills batches faster than spreading every record.

use crate::config::PartitionerKind;
use crate::metadata::ClusterSnapshot;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub trait Partitioner: Send + Sync {
    /// Chooses a partition for a record of `topic`.
    ///
    /// Only called when the topic has at least one partition in `cluster`.
    fn partition(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        cluster: &ClusterSnapshot,
    ) -> i32;

    /// Notifies the partitioner that appending to `prev_partition` would
    /// have opened a new batch.
    fn on_new_batch(&self, _topic: &str, _cluster: &ClusterSnapshot, _prev_partition: i32) {}

    /// Whether the producer should re-partition a record instead of opening
    /// a new batch for it.
    fn abort_on_new_batch(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// Builds the partitioner selected in the configuration.
pub fn from_kind(kind: PartitionerKind) -> Arc<dyn Partitioner> {
    match kind {
        PartitionerKind::Default => Arc::new(DefaultPartitioner::default()),
        PartitionerKind::UniformSticky => Arc::new(UniformStickyPartitioner::default()),
        PartitionerKind::RoundRobin => Arc::new(RoundRobinPartitioner::default()),
    }
}

/// 32-bit murmur2 hash, as used for key hashing by Kafka-compatible clients.
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h = SEED ^ length as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Clears the sign bit so a hash can be used as a partition index.
pub fn to_positive(n: i32) -> i32 {
    n & 0x7fff_ffff
}

/// Per-topic sticky partition choice.
#[derive(Default)]
pub struct StickyPartitionCache {
    index: Mutex<HashMap<String, i32>>,
}

impl StickyPartitionCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, i32>> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn partition(&self, topic: &str, cluster: &ClusterSnapshot) -> i32 {
        if let Some(partition) = self.lock().get(topic) {
            return *partition;
        }
        self.next_partition(topic, cluster, -1)
    }

    /// Moves `topic` off `prev_partition`, unless another caller already did.
    pub fn next_partition(
        &self,
        topic: &str,
        cluster: &ClusterSnapshot,
        prev_partition: i32,
    ) -> i32 {
        let mut index = self.lock();
        let old = index.get(topic).copied();
        if let Some(current) = old.filter(|p| *p != prev_partition) {
            return current;
        }

        let mut rng = rand::thread_rng();
        let available = cluster.available_partitions_for_topic(topic);
        let next = match available.len() {
            0 => {
                let count = cluster.partition_count_for_topic(topic).unwrap_or(0);
                if count == 0 {
                    0
                } else {
                    rng.gen_range(0..count) as i32
                }
            }
            1 => available[0].partition,
            n => loop {
                let candidate = available[rng.gen_range(0..n)].partition;
                if Some(candidate) != old {
                    break candidate;
                }
            },
        };
        index.insert(topic.to_string(), next);
        next
    }
}

/// Murmur2 of the key for keyed records, sticky for the rest.
#[derive(Default)]
pub struct DefaultPartitioner {
    sticky: StickyPartitionCache,
}

impl Partitioner for DefaultPartitioner {
    fn partition(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        _value: Option<&[u8]>,
        cluster: &ClusterSnapshot,
    ) -> i32 {
        match key {
            Some(key) => {
                let count = cluster.partition_count_for_topic(topic).unwrap_or(1).max(1);
                to_positive(murmur2(key)) % count as i32
            }
            None => self.sticky.partition(topic, cluster),
        }
    }

    fn on_new_batch(&self, topic: &str, cluster: &ClusterSnapshot, prev_partition: i32) {
        self.sticky.next_partition(topic, cluster, prev_partition);
    }

    fn abort_on_new_batch(&self) -> bool {
        true
    }
}

/// Sticky for every record; keys are ignored.
#[derive(Default)]
pub struct UniformStickyPartitioner {
    sticky: StickyPartitionCache,
}

impl Partitioner for UniformStickyPartitioner {
    fn partition(
        &self,
        topic: &str,
        _key: Option<&[u8]>,
        _value: Option<&[u8]>,
        cluster: &ClusterSnapshot,
    ) -> i32 {
        self.sticky.partition(topic, cluster)
    }

    fn on_new_batch(&self, topic: &str, cluster: &ClusterSnapshot, prev_partition: i32) {
        self.sticky.next_partition(topic, cluster, prev_partition);
    }

    fn abort_on_new_batch(&self) -> bool {
        true
    }
}

/// Cycles through the available partitions, one record at a time.
#[derive(Default)]
pub struct RoundRobinPartitioner {
    counters: Mutex<HashMap<String, Arc<AtomicU32>>>,
}

impl RoundRobinPartitioner {
    fn next_value(&self, topic: &str) -> u32 {
        let counter = {
            let mut counters = self
                .counters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(counters.entry(topic.to_string()).or_default())
        };
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(
        &self,
        topic: &str,
        _key: Option<&[u8]>,
        _value: Option<&[u8]>,
        cluster: &ClusterSnapshot,
    ) -> i32 {
        let next = self.next_value(topic);
        let available = cluster.available_partitions_for_topic(topic);
        if !available.is_empty() {
            return available[next as usize % available.len()].partition;
        }
        let count = cluster.partition_count_for_topic(topic).unwrap_or(1).max(1);
        (next % count as u32) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Node, PartitionInfo};
    use std::collections::HashSet;

    fn cluster(partitions: i32, leaderless: &[i32]) -> ClusterSnapshot {
        ClusterSnapshot::new(
            vec![Node::new(0, "localhost", 9092)],
            (0..partitions)
                .map(|p| {
                    let leader = (!leaderless.contains(&p)).then_some(0);
                    PartitionInfo::new("events", p, leader)
                })
                .collect(),
            HashSet::new(),
            HashSet::new(),
        )
    }

    #[test]
    fn test_murmur2_matches_java_client() {
        assert_eq!(murmur2(b"21"), -973932308);
        assert_eq!(murmur2(b"foobar"), -790332482);
        assert_eq!(murmur2(b"a-little-bit-long-string"), -985981536);
        assert_eq!(murmur2(b"a-little-bit-longer-string"), -1486304829);
        assert_eq!(
            murmur2(b"lkjh234lh9fiuh90y23oiuhsafujhadof229phr9h19h89h8"),
            -58897971
        );
        assert_eq!(murmur2(b"abc"), 479470107);
        assert_eq!(murmur2(b""), 275646681);
    }

    #[test]
    fn test_to_positive() {
        assert_eq!(to_positive(-1), i32::MAX);
        assert_eq!(to_positive(i32::MIN), 0);
        assert_eq!(to_positive(42), 42);
    }

    #[test]
    fn test_keyed_records_are_hashed() {
        let partitioner = DefaultPartitioner::default();
        let cluster = cluster(10, &[]);
        let expected = to_positive(murmur2(b"foobar")) % 10;
        for _ in 0..5 {
            assert_eq!(
                partitioner.partition("events", Some(b"foobar"), None, &cluster),
                expected
            );
        }
    }

    #[test]
    fn test_sticky_until_new_batch() {
        let partitioner = DefaultPartitioner::default();
        let cluster = cluster(4, &[]);
        let first = partitioner.partition("events", None, Some(b"v"), &cluster);
        for _ in 0..10 {
            assert_eq!(partitioner.partition("events", None, None, &cluster), first);
        }

        partitioner.on_new_batch("events", &cluster, first);
        let second = partitioner.partition("events", None, None, &cluster);
        assert_ne!(first, second);

        // A stale notification does not move the partition again.
        partitioner.on_new_batch("events", &cluster, first);
        assert_eq!(partitioner.partition("events", None, None, &cluster), second);
    }

    #[test]
    fn test_sticky_prefers_available_partitions() {
        let partitioner = UniformStickyPartitioner::default();
        let cluster = cluster(3, &[0, 2]);
        for _ in 0..10 {
            let partition = partitioner.partition("events", Some(b"ignored"), None, &cluster);
            assert_eq!(partition, 1);
            partitioner.on_new_batch("events", &cluster, partition);
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let partitioner = RoundRobinPartitioner::default();
        let cluster = cluster(3, &[1]);
        let chosen: Vec<i32> = (0..4)
            .map(|_| partitioner.partition("events", None, None, &cluster))
            .collect();
        assert_eq!(chosen, vec![0, 2, 0, 2]);
    }
}
