//! Versioned, shared cluster metadata.
//!
//! [`Metadata`] is read by every caller of `send` and written only by the
//! sender task when a metadata response arrives. Each successful update
//! replaces the [`ClusterSnapshot`] wholesale and bumps a monotonic version;
//! callers waiting for a topic to appear block on that version through a
//! `tokio::sync::watch` channel.

use super::cluster::ClusterSnapshot;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VersionState {
    version: u64,
    closed: bool,
}

struct MetadataState {
    snapshot: Arc<ClusterSnapshot>,
    version: u64,
    need_update: bool,
    last_refresh: Option<Instant>,
    last_successful_refresh: Option<Instant>,
    /// Interest set: topic -> instant after which it is evicted if unused.
    topics: HashMap<String, Instant>,
    closed: bool,
}

pub struct Metadata {
    state: Mutex<MetadataState>,
    version_tx: watch::Sender<VersionState>,
    refresh_backoff: Duration,
    max_age: Duration,
    topic_idle: Duration,
}

impl Metadata {
    pub fn new(refresh_backoff: Duration, max_age: Duration, topic_idle: Duration) -> Self {
        let (version_tx, _) = watch::channel(VersionState {
            version: 0,
            closed: false,
        });
        Self {
            state: Mutex::new(MetadataState {
                snapshot: Arc::new(ClusterSnapshot::empty()),
                version: 0,
                need_update: false,
                last_refresh: None,
                last_successful_refresh: None,
                topics: HashMap::new(),
                closed: false,
            }),
            version_tx,
            refresh_backoff,
            max_age,
            topic_idle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetadataState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Installs the seed addresses as the initial snapshot and schedules a
    /// full refresh.
    pub fn bootstrap(&self, addresses: &[String], now: Instant) -> Result<()> {
        let snapshot = ClusterSnapshot::bootstrap(addresses)?;
        self.update(snapshot, HashSet::new(), now, true);
        Ok(())
    }

    /// The current snapshot. Never blocks on I/O.
    pub fn fetch(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.lock().snapshot)
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Adds `topic` to the interest set, or refreshes its idle expiry.
    ///
    /// Returns `true` if the topic was not already of interest, in which case
    /// an update is requested.
    pub fn add(&self, topic: &str, now: Instant) -> bool {
        let mut state = self.lock();
        let expiry = now + self.topic_idle;
        match state.topics.insert(topic.to_string(), expiry) {
            Some(_) => false,
            None => {
                debug!(topic = %topic, "Added topic to metadata interest set");
                state.need_update = true;
                true
            }
        }
    }

    /// Marks the metadata as stale and returns the version the caller
    /// should wait past.
    pub fn request_update(&self) -> u64 {
        let mut state = self.lock();
        state.need_update = true;
        state.version
    }

    pub fn update_requested(&self) -> bool {
        self.lock().need_update
    }

    /// Topics to include in the next metadata request.
    pub fn topics(&self) -> Vec<String> {
        self.lock().topics.keys().cloned().collect()
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.lock().topics.contains_key(topic)
    }

    /// How long until the sender should issue the next metadata request.
    ///
    /// Zero when an update was requested and the refresh backoff has
    /// elapsed; otherwise the remaining time until the snapshot exceeds its
    /// maximum age.
    pub fn time_to_next_update(&self, now: Instant) -> Duration {
        let state = self.lock();
        let backoff_remaining = match state.last_refresh {
            Some(last) => self
                .refresh_backoff
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        };
        if state.need_update {
            return backoff_remaining;
        }
        let expiry_remaining = match state.last_successful_refresh {
            Some(last) => self
                .max_age
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        };
        expiry_remaining.max(backoff_remaining)
    }

    /// Replaces the snapshot and wakes every waiter.
    ///
    /// Topics whose idle expiry has passed are dropped from the interest set.
    /// `invalid_topics` are merged into the snapshot so that `send` can fail
    /// fast for them.
    pub fn update(
        &self,
        snapshot: ClusterSnapshot,
        invalid_topics: HashSet<String>,
        now: Instant,
        is_bootstrap: bool,
    ) {
        let version = {
            let mut state = self.lock();
            if state.closed {
                warn!("Ignoring metadata update after close");
                return;
            }

            if is_bootstrap {
                state.need_update = true;
            } else {
                state.need_update = false;
                state.last_refresh = Some(now);
                state.last_successful_refresh = Some(now);
            }

            let before = state.topics.len();
            state.topics.retain(|_, expiry| *expiry > now);
            let evicted = before - state.topics.len();
            if evicted > 0 {
                debug!(evicted, "Evicted idle topics from metadata interest set");
            }

            let snapshot = if invalid_topics.is_empty() {
                snapshot
            } else {
                snapshot.with_invalid_topics(&invalid_topics)
            };
            state.snapshot = Arc::new(snapshot);
            state.version += 1;
            state.version
        };

        debug!(version, is_bootstrap, "Updated cluster metadata");
        self.version_tx.send_replace(VersionState {
            version,
            closed: false,
        });
    }

    /// Records a failed refresh attempt so the next one honors the backoff.
    pub fn failed_update(&self, now: Instant) {
        let mut state = self.lock();
        state.last_refresh = Some(now);
        state.need_update = true;
    }

    /// Waits until the version exceeds `last_version` or `max_wait` elapses.
    pub async fn await_update(&self, last_version: u64, max_wait: Duration) -> Result<()> {
        let mut rx = self.version_tx.subscribe();
        let wait = async {
            rx.wait_for(|state| state.closed || state.version > last_version)
                .await
                .map(|state| state.closed)
        };
        let result = match tokio::time::timeout(max_wait, wait).await {
            Ok(Ok(false)) => Ok(()),
            Ok(Ok(true)) | Ok(Err(_)) => Err(Error::closed("Metadata has been closed")),
            Err(_) => Err(Error::timeout(format!(
                "Metadata not updated after {} ms.",
                max_wait.as_millis()
            ))),
        };
        result
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closes the cache and wakes every waiter with a closed error.
    pub fn close(&self) {
        let version = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.version
        };
        info!("Closing metadata cache");
        self.version_tx.send_replace(VersionState {
            version,
            closed: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Node, PartitionInfo};

    fn metadata() -> Metadata {
        Metadata::new(
            Duration::from_millis(100),
            Duration::from_secs(300),
            Duration::from_secs(300),
        )
    }

    fn snapshot_with(topic: &str, partitions: i32) -> ClusterSnapshot {
        ClusterSnapshot::new(
            vec![Node::new(1, "localhost", 9092)],
            (0..partitions)
                .map(|p| PartitionInfo::new(topic, p, Some(1)))
                .collect(),
            HashSet::new(),
            HashSet::new(),
        )
    }

    #[test]
    fn test_add_requests_update_once() {
        let metadata = metadata();
        let now = Instant::now();
        assert!(metadata.add("orders", now));
        assert!(metadata.update_requested());
        assert!(!metadata.add("orders", now));
        assert_eq!(metadata.topics(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_update_bumps_version() {
        let metadata = metadata();
        let now = Instant::now();
        let version = metadata.request_update();
        metadata.update(snapshot_with("orders", 3), HashSet::new(), now, false);
        assert_eq!(metadata.version(), version + 1);
        assert!(!metadata.update_requested());
        assert_eq!(metadata.fetch().partition_count_for_topic("orders"), Some(3));
    }

    #[test]
    fn test_invalid_topics_are_merged() {
        let metadata = metadata();
        let invalid: HashSet<String> = ["bad topic".to_string()].into_iter().collect();
        metadata.update(snapshot_with("orders", 1), invalid, Instant::now(), false);
        assert!(metadata.fetch().invalid_topics().contains("bad topic"));
    }

    #[test]
    fn test_idle_topics_are_evicted() {
        let metadata = Metadata::new(
            Duration::from_millis(100),
            Duration::from_secs(300),
            Duration::from_millis(10),
        );
        let start = Instant::now();
        metadata.add("orders", start);
        metadata.update(
            snapshot_with("orders", 1),
            HashSet::new(),
            start + Duration::from_millis(50),
            false,
        );
        assert!(!metadata.contains_topic("orders"));
    }

    #[test]
    fn test_time_to_next_update() {
        let metadata = metadata();
        let now = Instant::now();
        metadata.bootstrap(&["localhost:9092".to_string()], now).unwrap();
        // Bootstrap leaves an update pending with no backoff.
        assert_eq!(metadata.time_to_next_update(now), Duration::ZERO);

        metadata.update(snapshot_with("orders", 1), HashSet::new(), now, false);
        assert_eq!(metadata.time_to_next_update(now), Duration::from_secs(300));

        // A requested update is throttled by the refresh backoff.
        metadata.request_update();
        assert_eq!(
            metadata.time_to_next_update(now + Duration::from_millis(40)),
            Duration::from_millis(60)
        );
        assert_eq!(
            metadata.time_to_next_update(now + Duration::from_millis(200)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_await_update_wakes_on_new_version() {
        let metadata = Arc::new(metadata());
        let version = metadata.request_update();

        let waiter = {
            let metadata = Arc::clone(&metadata);
            tokio::spawn(async move {
                metadata
                    .await_update(version, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        metadata.update(snapshot_with("orders", 1), HashSet::new(), Instant::now(), false);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_await_update_times_out() {
        let metadata = metadata();
        let version = metadata.request_update();
        let start = std::time::Instant::now();
        let err = metadata
            .await_update(version, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let metadata = Arc::new(metadata());
        let version = metadata.request_update();
        let waiter = {
            let metadata = Arc::clone(&metadata);
            tokio::spawn(async move {
                metadata
                    .await_update(version, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        metadata.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { .. }));
    }
}
