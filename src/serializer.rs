//! Key and value serializers.
//!
//! The producer turns keys and values into bytes before partitioning, so
//! partitioners and batches only ever see serialized data.

use crate::record::Header;
use crate::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use std::marker::PhantomData;

pub trait Serializer<T: ?Sized>: Send + Sync {
    /// Serializes `data` for `topic`. Headers are passed for serializers
    /// that record schema information in them.
    fn serialize(&self, topic: &str, headers: &[Header], data: &T) -> Result<Bytes>;

    /// Called once when the producer closes.
    fn close(&self) {}
}

/// Passes bytes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Bytes> for BytesSerializer {
    fn serialize(&self, _topic: &str, _headers: &[Header], data: &Bytes) -> Result<Bytes> {
        Ok(data.clone())
    }
}

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, _topic: &str, _headers: &[Header], data: &Vec<u8>) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// UTF-8 encoding of strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, _topic: &str, _headers: &[Header], data: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data.as_bytes()))
    }
}

impl Serializer<str> for StringSerializer {
    fn serialize(&self, _topic: &str, _headers: &[Header], data: &str) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data.as_bytes()))
    }
}

/// Serializes any `serde::Serialize` value as JSON.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn(&T)>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serializer<T> for JsonSerializer<T> {
    fn serialize(&self, topic: &str, _headers: &[Header], data: &T) -> Result<Bytes> {
        serde_json::to_vec(data)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization {
                message: format!("Can't serialize data for topic {}: {}", topic, e),
            })
    }
}
