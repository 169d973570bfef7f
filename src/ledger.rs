//! Per-session transaction number ordering.
//!
//! The durable high-water mark lives in the store's `session_ledger` table
//! and every admission reads it. The in-memory map only records what this
//! instance has published after commit; it never admits a number on its own.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::coordinator::TxnError;
use crate::core::{SessionId, SessionIdentity, TxnNumber};
use crate::store::{SessionStoreTxn, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("txn number {requested} for session {session_id} is older than {highest}")]
    TooOld {
        session_id: SessionId,
        requested: TxnNumber,
        highest: TxnNumber,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LedgerError> for TxnError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::TooOld {
                session_id,
                requested,
                highest,
            } => TxnError::TransactionTooOld {
                session_id,
                requested,
                highest,
            },
            LedgerError::Store(err) => TxnError::Store(err),
        }
    }
}

/// What `validate_and_advance` did. Hand it to `publish` once the store txn
/// has committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerDecision {
    /// Request carries no session-level number.
    Exempt,
    Continued {
        session_id: SessionId,
        txn_number: TxnNumber,
    },
    Advanced {
        session_id: SessionId,
        previous: Option<TxnNumber>,
        txn_number: TxnNumber,
    },
}

#[derive(Debug, Default)]
pub struct TransactionNumberLedger {
    cache: Mutex<BTreeMap<SessionId, TxnNumber>>,
}

impl TransactionNumberLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `own` (the number the request itself carries) for `identity`,
    /// advancing the session high-water mark inside `txn` when it grows.
    pub fn validate_and_advance(
        &self,
        txn: &mut dyn SessionStoreTxn,
        identity: &SessionIdentity,
        own: Option<TxnNumber>,
    ) -> Result<LedgerDecision, LedgerError> {
        let Some(requested) = identity.effective_txn_number(own) else {
            return Ok(LedgerDecision::Exempt);
        };
        let session_id = identity.session_id;
        let highest = self.highest(&*txn, &session_id)?;
        match highest {
            Some(highest) if requested < highest => {
                tracing::debug!(
                    session = %session_id,
                    identity = %identity,
                    requested = requested.get(),
                    highest = highest.get(),
                    "txn number rejected"
                );
                Err(LedgerError::TooOld {
                    session_id,
                    requested,
                    highest,
                })
            }
            Some(highest) if requested == highest => Ok(LedgerDecision::Continued {
                session_id,
                txn_number: requested,
            }),
            previous => {
                txn.set_ledger_high(&session_id, requested)?;
                tracing::trace!(
                    session = %session_id,
                    previous = previous.map(TxnNumber::get),
                    txn_number = requested.get(),
                    "session ledger advanced"
                );
                Ok(LedgerDecision::Advanced {
                    session_id,
                    previous,
                    txn_number: requested,
                })
            }
        }
    }

    /// Same ordering check without advancing.
    pub fn check(
        &self,
        txn: &dyn SessionStoreTxn,
        identity: &SessionIdentity,
        own: Option<TxnNumber>,
    ) -> Result<(), LedgerError> {
        let Some(requested) = identity.effective_txn_number(own) else {
            return Ok(());
        };
        let session_id = identity.session_id;
        match self.highest(txn, &session_id)? {
            Some(highest) if requested < highest => Err(LedgerError::TooOld {
                session_id,
                requested,
                highest,
            }),
            _ => Ok(()),
        }
    }

    pub fn publish(&self, decision: &LedgerDecision) {
        let (session_id, txn_number) = match *decision {
            LedgerDecision::Exempt => return,
            LedgerDecision::Continued {
                session_id,
                txn_number,
            }
            | LedgerDecision::Advanced {
                session_id,
                txn_number,
                ..
            } => (session_id, txn_number),
        };
        let mut cache = self.cache.lock().expect("ledger cache lock poisoned");
        let entry = cache.entry(session_id).or_insert(txn_number);
        if *entry < txn_number {
            *entry = txn_number;
        }
    }

    pub fn forget(&self, session_id: &SessionId) {
        self.cache
            .lock()
            .expect("ledger cache lock poisoned")
            .remove(session_id);
    }

    /// Drop every cached mark, e.g. when stepping up.
    pub fn clear(&self) {
        self.cache.lock().expect("ledger cache lock poisoned").clear();
    }

    pub fn cached(&self, session_id: &SessionId) -> Option<TxnNumber> {
        self.cache
            .lock()
            .expect("ledger cache lock poisoned")
            .get(session_id)
            .copied()
    }

    fn highest(
        &self,
        txn: &dyn SessionStoreTxn,
        session_id: &SessionId,
    ) -> Result<Option<TxnNumber>, StoreError> {
        let durable = txn.ledger_high(session_id)?;
        let cached = self.cached(session_id);
        if let (Some(cached), Some(durable)) = (cached, durable)
            && cached > durable
        {
            tracing::warn!(
                session = %session_id,
                cached = cached.get(),
                durable = durable.get(),
                "cached txn number ahead of the store"
            );
        }
        Ok(durable.max(cached))
    }
}
