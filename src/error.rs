//! Error types and result handling for txq-producer.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! A single failure (a broker rejecting a batch, a forced close) is usually
//! delivered to many record futures at once, so [`Error`] is `Clone` and
//! carries rendered messages rather than boxed sources.
//!
//! # Example
//!
//! ```rust
//! use txq_producer::{Error, Result};
//!
//! fn reserve_buffer() -> Result<()> {
//!     Err(Error::Timeout {
//!         message: "Failed to allocate memory within the configured max blocking time 50 ms."
//!             .to_string(),
//!     })
//! }
//!
//! match reserve_buffer() {
//!     Ok(()) => println!("Reserved"),
//!     Err(e) if e.is_retriable() => eprintln!("Try again later: {}", e),
//!     Err(e) => eprintln!("Giving up: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for producer operations.
///
/// Variants fall into three groups: per-record errors delivered through a
/// record's future or callback, pipeline errors surfaced to the next public
/// API call, and configuration errors raised at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid producer configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded wait was exceeded: buffer allocation, metadata wait,
    /// flush, or the delivery timeout of a batch.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The transport or external resource lost its connection. The outcome
    /// of the interrupted operation is unknown.
    #[error("Disconnected: {message}")]
    Disconnected {
        /// Description of the lost connection
        message: String,
    },

    /// Key or value could not be serialized. Fatal for that record only.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure
        message: String,
    },

    /// The serialized record exceeds the request size or total buffer size.
    #[error("Record too large: {message}")]
    RecordTooLarge {
        /// Description including the offending and allowed sizes
        message: String,
    },

    /// A transient broker-side error. Retried by the sender while the retry
    /// budget and delivery timeout allow.
    #[error("Retriable error: {message}")]
    Retriable {
        /// Broker error description
        message: String,
    },

    /// The client is not authorized to write to the topic.
    #[error("Authorization failed: {message}")]
    Authorization {
        /// Description of the denied operation
        message: String,
    },

    /// The topic name is invalid or has been reported invalid by the broker.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// The broker does not support the requested feature.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The operation is not legal in the current producer state.
    #[error("Illegal state: {message}")]
    IllegalState {
        /// Description of the state violation
        message: String,
    },

    /// The producer has been closed.
    #[error("Producer closed: {message}")]
    Closed {
        /// Description of the close that rejected the operation
        message: String,
    },

    /// A non-retriable broker error.
    #[error("Broker error: {message}")]
    Broker {
        /// Broker error description
        message: String,
    },

    /// The record was discarded because its transaction was aborted.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// A blocking wait was interrupted before it could complete.
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl Error {
    /// Shorthand for [`Error::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Closed`].
    pub fn closed(message: impl Into<String>) -> Self {
        Error::Closed {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Disconnected`].
    pub fn disconnected(message: impl Into<String>) -> Self {
        Error::Disconnected {
            message: message.into(),
        }
    }

    /// Returns `true` if the sender may retry a batch that failed with this
    /// error.
    ///
    /// Disconnects and timeouts on a produce request are retried by the
    /// sender; whether the batch was written is unknown either way.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Retriable { .. } | Error::Disconnected { .. } | Error::Timeout { .. }
        )
    }

    /// Returns `true` for errors that concern a single record and are
    /// delivered through its future rather than returned from `send`.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::RecordTooLarge { .. }
                | Error::InvalidTopic(_)
                | Error::Authorization { .. }
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization {
            message: err.to_string(),
        }
    }
}

/// A convenient Result type alias for producer operations.
///
/// This is equivalent to `std::result::Result<T, txq_producer::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(Error::Retriable {
            message: "NOT_LEADER_OR_FOLLOWER".into()
        }
        .is_retriable());
        assert!(Error::disconnected("node 1").is_retriable());
        assert!(!Error::Authorization {
            message: "topic orders".into()
        }
        .is_retriable());
        assert!(!Error::illegal_state("no transaction").is_retriable());
    }

    #[test]
    fn test_record_errors() {
        assert!(Error::timeout("metadata").is_record_error());
        assert!(Error::InvalidTopic("bad topic".into()).is_record_error());
        assert!(!Error::closed("closing").is_record_error());
        assert!(!Error::Serialization {
            message: "x".into()
        }
        .is_record_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::Serialization { .. }));
    }
}
