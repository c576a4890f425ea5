pub mod config;
pub mod error;
pub mod metadata;
pub mod producer;
pub mod record;
pub mod serializer;
pub mod transport;

pub use config::{Acks, PartitionerKind, ProducerConfig, ProducerConfigBuilder};
pub use error::{Error, Result};
pub use producer::{
    Callback, ExternalResource, Producer, ProducerBuilder, ProducerInterceptor, RecordFuture,
    TransactionState,
};
pub use record::{Header, ProducerRecord, RecordMetadata, TopicPartition};
pub use serializer::{BytesSerializer, JsonSerializer, Serializer, StringSerializer};
pub use transport::{InMemoryBroker, Transport};
