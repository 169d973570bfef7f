//! Two-phase commit participants.

use std::sync::Arc;

use crate::core::{Timestamp, TxnId};

use super::{TransactionCoordinator, TxnError};

/// A shard taking part in a distributed commit. Every call is idempotent.
pub trait Participant: Send + Sync {
    fn name(&self) -> &str;
    /// Durably promise to honor a later decision; returns the prepare timestamp.
    fn prepare(&self, txn: &TxnId) -> Result<Timestamp, TxnError>;
    fn commit_with_timestamp(&self, txn: &TxnId, commit_ts: Timestamp) -> Result<(), TxnError>;
    fn abort(&self, txn: &TxnId) -> Result<(), TxnError>;
}

/// Participant backed by a `TransactionCoordinator` in this process.
pub struct LocalParticipant {
    name: String,
    coordinator: Arc<TransactionCoordinator>,
}

impl LocalParticipant {
    pub fn new(name: impl Into<String>, coordinator: Arc<TransactionCoordinator>) -> Self {
        Self {
            name: name.into(),
            coordinator,
        }
    }
}

impl Participant for LocalParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, txn: &TxnId) -> Result<Timestamp, TxnError> {
        self.coordinator.prepare(txn)
    }

    fn commit_with_timestamp(&self, txn: &TxnId, commit_ts: Timestamp) -> Result<(), TxnError> {
        self.coordinator.commit(txn, Some(commit_ts)).map(|_| ())
    }

    fn abort(&self, txn: &TxnId) -> Result<(), TxnError> {
        match self.coordinator.abort(txn) {
            // Never prepared here, or already aborted.
            Err(TxnError::NoSuchTransaction { .. }) => Ok(()),
            other => other,
        }
    }
}
