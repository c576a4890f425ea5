//! Transaction state for producers in transactional mode.
//!
//! A transaction ties every record sent between `begin` and `commit` to one
//! atomic commit of an [`ExternalResource`]. Only one transaction is open at
//! a time, and records are only accepted while one is.
//!
//! The manager serializes its own state, but a transaction as a whole is not
//! safe to drive from several tasks at once: sends racing a commit or abort
//! may land on either side of it. Callers sharing a transactional producer
//! need their own locking around each begin/send/commit sequence.

use super::accumulator::RecordAccumulator;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

/// The atomic-commit boundary records are written under.
#[async_trait]
pub trait ExternalResource: Send + Sync {
    async fn begin(&self) -> Result<()>;

    /// Atomically persists everything sent since `begin`.
    ///
    /// [`Error::Disconnected`] means the outcome is unknown.
    async fn commit(&self) -> Result<()>;

    async fn abort(&self) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    /// The external resource is starting a transaction.
    Beginning,
    InTransaction,
    Committing,
    Aborting,
}

struct TransactionInner {
    state: TransactionState,
    /// Set when a commit or abort lost its connection midway.
    indeterminate: bool,
    /// First record failure inside the open transaction.
    send_error: Option<Error>,
}

pub struct TransactionManager {
    inner: Mutex<TransactionInner>,
    resource: Option<Arc<dyn ExternalResource>>,
}

impl TransactionManager {
    pub fn new(resource: Option<Arc<dyn ExternalResource>>) -> Self {
        Self {
            inner: Mutex::new(TransactionInner {
                state: TransactionState::None,
                indeterminate: false,
                send_error: None,
            }),
            resource,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransactionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    /// Whether a commit or abort ended without a known outcome. The
    /// producer must be closed.
    pub fn is_indeterminate(&self) -> bool {
        self.lock().indeterminate
    }

    fn check_determinate(inner: &TransactionInner) -> Result<()> {
        if inner.indeterminate {
            return Err(Error::illegal_state(
                "The outcome of the last transaction is unknown; the producer must be closed",
            ));
        }
        Ok(())
    }

    fn transition(&self, from: &[TransactionState], to: TransactionState) -> Result<()> {
        let mut inner = self.lock();
        Self::check_determinate(&inner)?;
        if !from.contains(&inner.state) {
            return Err(Error::illegal_state(format!(
                "Invalid transition attempted from state {:?} to state {:?}",
                inner.state, to
            )));
        }
        debug!(from = ?inner.state, to = ?to, "Transaction state transition");
        inner.state = to;
        Ok(())
    }

    /// Fails unless a transaction is open.
    pub fn ensure_can_send(&self) -> Result<()> {
        let inner = self.lock();
        Self::check_determinate(&inner)?;
        if inner.state != TransactionState::InTransaction {
            return Err(Error::illegal_state(
                "Cannot send records outside of a transaction; call begin_transaction() first",
            ));
        }
        Ok(())
    }

    /// Remembers the first failed record of the open transaction; the
    /// transaction can then only be aborted.
    pub fn record_send_error(&self, err: &Error) {
        let mut inner = self.lock();
        if matches!(
            inner.state,
            TransactionState::InTransaction | TransactionState::Committing
        ) && inner.send_error.is_none()
        {
            inner.send_error = Some(err.clone());
        }
    }

    pub async fn begin(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            Self::check_determinate(&inner)?;
            if inner.state != TransactionState::None {
                return Err(Error::illegal_state(format!(
                    "Cannot begin a transaction in state {:?}",
                    inner.state
                )));
            }
            inner.state = TransactionState::Beginning;
            inner.send_error = None;
        }

        let result = match &self.resource {
            Some(resource) => resource.begin().await,
            None => Ok(()),
        };
        let mut inner = self.lock();
        match result {
            Ok(()) => {
                inner.state = TransactionState::InTransaction;
                debug!("Began transaction");
                Ok(())
            }
            Err(err) => {
                inner.state = TransactionState::None;
                warn!(error = %err, "External resource failed to begin a transaction");
                Err(err)
            }
        }
    }

    /// Moves an open transaction to committing. Records are flushed
    /// between this call and [`complete_commit`](Self::complete_commit).
    pub fn begin_commit(&self) -> Result<()> {
        self.transition(&[TransactionState::InTransaction], TransactionState::Committing)
    }

    /// Commits the external resource once every record has been flushed.
    ///
    /// Fails, leaving the transaction open for an abort, if any record of
    /// the transaction failed. A disconnect during the commit marks the
    /// outcome indeterminate.
    #[instrument(skip(self))]
    pub async fn complete_commit(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state != TransactionState::Committing {
                return Err(Error::illegal_state(format!(
                    "Cannot complete a commit in state {:?}",
                    inner.state
                )));
            }
            if let Some(err) = inner.send_error.clone() {
                inner.state = TransactionState::InTransaction;
                return Err(Error::illegal_state(format!(
                    "Cannot commit a transaction with a failed send, abort it instead: {}",
                    err
                )));
            }
        }

        let result = match &self.resource {
            Some(resource) => resource.commit().await,
            None => Ok(()),
        };

        let mut inner = self.lock();
        match result {
            Ok(()) => {
                inner.state = TransactionState::None;
                info!("Committed transaction");
                Ok(())
            }
            Err(err @ Error::Disconnected { .. }) => {
                inner.state = TransactionState::None;
                inner.indeterminate = true;
                warn!(error = %err, "Connection lost during commit, outcome unknown");
                Err(err)
            }
            Err(err) => {
                inner.state = TransactionState::InTransaction;
                warn!(error = %err, "Commit failed");
                Err(err)
            }
        }
    }

    /// Aborts the open transaction: queued records are failed without being
    /// sent, in-flight ones are awaited, then the external resource rolls
    /// back.
    #[instrument(skip(self, accumulator))]
    pub async fn abort(&self, accumulator: &RecordAccumulator) -> Result<()> {
        self.transition(
            &[TransactionState::InTransaction, TransactionState::Committing],
            TransactionState::Aborting,
        )?;

        accumulator.abort_undrained_batches(&Error::TransactionAborted(
            "Failing batch since transaction was aborted".to_string(),
        ));
        let token = accumulator.begin_flush();
        accumulator.await_flush_completion(&token).await;
        drop(token);

        let result = match &self.resource {
            Some(resource) => resource.abort().await,
            None => Ok(()),
        };

        let mut inner = self.lock();
        inner.state = TransactionState::None;
        inner.send_error = None;
        match result {
            Ok(()) => {
                info!("Aborted transaction");
                Ok(())
            }
            Err(err) => {
                if matches!(err, Error::Disconnected { .. }) {
                    inner.indeterminate = true;
                }
                warn!(error = %err, "External resource failed to abort");
                Err(err)
            }
        }
    }

    pub async fn close(&self) {
        if let Some(resource) = &self.resource {
            if let Err(err) = resource.close().await {
                warn!(error = %err, "Failed to close external resource");
            }
        }
    }
}
