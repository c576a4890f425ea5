//! Hooks that observe or rewrite records on their way through the producer.
//!
//! A failing interceptor never fails a send: panics are caught and logged,
//! and `on_send` falls back to the record it was given.

use crate::record::{ProducerRecord, RecordMetadata};
use crate::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

pub trait ProducerInterceptor<K, V>: Send + Sync {
    /// Called before the record is partitioned and serialized. The returned
    /// record is the one sent.
    fn on_send(&self, record: ProducerRecord<K, V>) -> ProducerRecord<K, V> {
        record
    }

    /// Called when the record is acknowledged or fails, before the user
    /// callback.
    fn on_acknowledgement(&self, _metadata: &RecordMetadata, _error: Option<&Error>) {}

    fn close(&self) {}
}

/// The interceptors of one producer, applied in order.
pub struct ProducerInterceptors<K, V> {
    interceptors: Vec<Arc<dyn ProducerInterceptor<K, V>>>,
}

impl<K, V> Default for ProducerInterceptors<K, V> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<K: Clone, V: Clone> ProducerInterceptors<K, V> {
    pub fn new(interceptors: Vec<Arc<dyn ProducerInterceptor<K, V>>>) -> Self {
        Self { interceptors }
    }

    pub fn on_send(&self, mut record: ProducerRecord<K, V>) -> ProducerRecord<K, V> {
        for interceptor in &self.interceptors {
            let fallback = record.clone();
            record = match catch_unwind(AssertUnwindSafe(|| interceptor.on_send(record))) {
                Ok(intercepted) => intercepted,
                Err(_) => {
                    error!(topic = %fallback.topic, "Interceptor on_send panicked");
                    fallback
                }
            };
        }
        record
    }
}

impl<K, V> ProducerInterceptors<K, V> {
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn on_acknowledgement(&self, metadata: &RecordMetadata, err: Option<&Error>) {
        for interceptor in &self.interceptors {
            if catch_unwind(AssertUnwindSafe(|| interceptor.on_acknowledgement(metadata, err)))
                .is_err()
            {
                error!(
                    topic = %metadata.topic,
                    partition = metadata.partition,
                    "Interceptor on_acknowledgement panicked"
                );
            }
        }
    }

    pub fn close(&self) {
        for interceptor in &self.interceptors {
            if catch_unwind(AssertUnwindSafe(|| interceptor.close())).is_err() {
                error!("Interceptor close panicked");
            }
        }
    }
}
