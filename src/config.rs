use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Upper bound on in-flight requests per destination when sequencing is on.
pub const MAX_IN_FLIGHT_WITH_IDEMPOTENCE: usize = 5;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub acks: Acks,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_buffer_memory")]
    pub buffer_memory: usize,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_max_block_ms")]
    pub max_block_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    #[serde(default = "default_metadata_max_age_ms")]
    pub metadata_max_age_ms: u64,
    #[serde(default = "default_metadata_max_idle_ms")]
    pub metadata_max_idle_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests_per_connection: usize,
    #[serde(default)]
    pub enable_idempotence: bool,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default)]
    pub transactional_id: Option<String>,
    #[serde(default)]
    pub partitioner: PartitionerKind,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_allow_auto_topic_creation")]
    pub allow_auto_topic_creation: bool,
}

/// Acknowledgement level requested from the broker.
///
/// Accepts `"all"`, `"-1"`, `"1"`, `"0"` or the equivalent integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(try_from = "AcksRepr", into = "String")]
pub enum Acks {
    None,
    Leader,
    #[default]
    All,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AcksRepr {
    Number(i64),
    Text(String),
}

impl TryFrom<AcksRepr> for Acks {
    type Error = String;

    fn try_from(repr: AcksRepr) -> std::result::Result<Self, Self::Error> {
        let text = match repr {
            AcksRepr::Number(n) => n.to_string(),
            AcksRepr::Text(s) => s,
        };
        match text.trim().to_lowercase().as_str() {
            "all" | "-1" => Ok(Acks::All),
            "1" => Ok(Acks::Leader),
            "0" => Ok(Acks::None),
            other => Err(format!("invalid acks value '{}'", other)),
        }
    }
}

impl From<Acks> for String {
    fn from(acks: Acks) -> Self {
        match acks {
            Acks::All => "all".to_string(),
            Acks::Leader => "1".to_string(),
            Acks::None => "0".to_string(),
        }
    }
}

impl Acks {
    /// Wire value carried in produce requests.
    pub fn as_i16(self) -> i16 {
        match self {
            Acks::All => -1,
            Acks::Leader => 1,
            Acks::None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionerKind {
    /// Key hash when a key is present, sticky otherwise.
    #[default]
    Default,
    /// Sticky for every record, keys ignored.
    UniformSticky,
    /// Next available partition for every record.
    RoundRobin,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: None,
            acks: Acks::default(),
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            buffer_memory: default_buffer_memory(),
            max_request_size: default_max_request_size(),
            max_block_ms: default_max_block_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            metadata_max_age_ms: default_metadata_max_age_ms(),
            metadata_max_idle_ms: default_metadata_max_idle_ms(),
            max_in_flight_requests_per_connection: default_max_in_flight(),
            enable_idempotence: false,
            transactional: false,
            transactional_id: None,
            partitioner: PartitionerKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
            allow_auto_topic_creation: default_allow_auto_topic_creation(),
        }
    }
}

impl ProducerConfig {
    /// Starts from the defaults, for programmatic construction.
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::default()
    }

    /// Loads the configuration from a file, with `TXQ_PRODUCER_*`
    /// environment variables taking precedence.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("TXQ_PRODUCER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bootstrap_servers"),
            )
            .build()?;

        let mut config: ProducerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for contradictory settings.
    ///
    /// A delivery timeout shorter than `linger_ms + request_timeout_ms` is
    /// raised to that sum.
    pub fn validate(&mut self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(Error::Config("bootstrap_servers must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if self.buffer_memory < self.batch_size {
            return Err(Error::Config(format!(
                "buffer_memory ({}) must be at least batch_size ({})",
                self.buffer_memory, self.batch_size
            )));
        }
        if self.max_in_flight_requests_per_connection == 0 {
            return Err(Error::Config(
                "max_in_flight_requests_per_connection must be at least 1".into(),
            ));
        }
        if self.max_in_flight_requests_per_connection > 1 && !self.enable_idempotence {
            return Err(Error::Config(format!(
                "max_in_flight_requests_per_connection={} requires enable_idempotence, \
                 otherwise retries may reorder records",
                self.max_in_flight_requests_per_connection
            )));
        }
        if self.enable_idempotence {
            if self.max_in_flight_requests_per_connection > MAX_IN_FLIGHT_WITH_IDEMPOTENCE {
                return Err(Error::Config(format!(
                    "max_in_flight_requests_per_connection must be at most {} with enable_idempotence",
                    MAX_IN_FLIGHT_WITH_IDEMPOTENCE
                )));
            }
            if self.acks != Acks::All {
                return Err(Error::Config(
                    "acks must be 'all' with enable_idempotence".into(),
                ));
            }
            if self.retries == 0 {
                return Err(Error::Config(
                    "retries must be greater than 0 with enable_idempotence".into(),
                ));
            }
        }
        if self.transactional_id.is_some() && !self.transactional {
            return Err(Error::Config(
                "transactional_id is set but transactional is false".into(),
            ));
        }

        let minimum = self.linger_ms.saturating_add(self.request_timeout_ms);
        if self.delivery_timeout_ms < minimum {
            warn!(
                delivery_timeout_ms = self.delivery_timeout_ms,
                linger_ms = self.linger_ms,
                request_timeout_ms = self.request_timeout_ms,
                "delivery_timeout_ms should be at least linger_ms + request_timeout_ms, raising it to {}",
                minimum
            );
            self.delivery_timeout_ms = minimum;
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn max_block(&self) -> Duration {
        Duration::from_millis(self.max_block_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms.max(self.retry_backoff_ms))
    }

    pub fn metadata_max_age(&self) -> Duration {
        Duration::from_millis(self.metadata_max_age_ms)
    }

    pub fn metadata_max_idle(&self) -> Duration {
        Duration::from_millis(self.metadata_max_idle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Chainable construction of a validated [`ProducerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn bootstrap_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.bootstrap_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn acks(mut self, acks: Acks) -> Self {
        self.config.acks = acks;
        self
    }

    pub fn batch_size(mut self, bytes: usize) -> Self {
        self.config.batch_size = bytes;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger_ms = linger.as_millis() as u64;
        self
    }

    pub fn buffer_memory(mut self, bytes: usize) -> Self {
        self.config.buffer_memory = bytes;
        self
    }

    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.config.max_request_size = bytes;
        self
    }

    pub fn max_block(mut self, max_block: Duration) -> Self {
        self.config.max_block_ms = max_block.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.config.delivery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration, backoff_max: Duration) -> Self {
        self.config.retry_backoff_ms = backoff.as_millis() as u64;
        self.config.retry_backoff_max_ms = backoff_max.as_millis() as u64;
        self
    }

    pub fn max_in_flight_requests_per_connection(mut self, max: usize) -> Self {
        self.config.max_in_flight_requests_per_connection = max;
        self
    }

    pub fn enable_idempotence(mut self, enable: bool) -> Self {
        self.config.enable_idempotence = enable;
        self
    }

    pub fn transactional(mut self, transactional_id: Option<String>) -> Self {
        self.config.transactional = true;
        self.config.transactional_id = transactional_id;
        self
    }

    pub fn partitioner(mut self, kind: PartitionerKind) -> Self {
        self.config.partitioner = kind;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn allow_auto_topic_creation(mut self, allow: bool) -> Self {
        self.config.allow_auto_topic_creation = allow;
        self
    }

    pub fn build(mut self) -> Result<ProducerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_batch_size() -> usize {
    16384
}

fn default_linger_ms() -> u64 {
    5
}

fn default_buffer_memory() -> usize {
    33_554_432 // 32MB
}

fn default_max_request_size() -> usize {
    1_048_576 // 1MB
}

fn default_max_block_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_delivery_timeout_ms() -> u64 {
    120_000
}

fn default_retries() -> u32 {
    i32::MAX as u32
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    1_000
}

fn default_metadata_max_age_ms() -> u64 {
    300_000
}

fn default_metadata_max_idle_ms() -> u64 {
    300_000
}

fn default_max_in_flight() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_allow_auto_topic_creation() -> bool {
    true
}
