//! At-most-once statement records.
//!
//! Every executed statement leaves one row keyed by
//! `(identity, txn_number, stmt_id)`, written in the same store txn as the
//! document writes it produced. Retries are answered from these rows.

use thiserror::Error;

use crate::coordinator::TxnError;
use crate::core::{OpTime, OperationOutcome, SessionIdentity, StmtId, TxnId, TxnNumber, hex32};
use crate::store::{SessionStoreTxn, StatementInsert, StatementKey, StatementRow, StoreError};

#[derive(Debug, Error)]
pub enum LogError {
    #[error(
        "statement {} of {} replayed with a different payload ({} != {})",
        .key.stmt_id,
        .key.txn,
        hex32(.expected_sha256),
        hex32(.got_sha256)
    )]
    PayloadMismatch {
        key: StatementKey,
        expected_sha256: [u8; 32],
        got_sha256: [u8; 32],
    },
    #[error("statement {stmt_id} is still being executed by {owner}")]
    InProgressElsewhere { owner: TxnId, stmt_id: StmtId },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LogError> for TxnError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::PayloadMismatch {
                key,
                expected_sha256,
                got_sha256,
            } => TxnError::ConflictingOperationReplay {
                txn: key.txn,
                stmt_id: key.stmt_id,
                expected_sha256,
                got_sha256,
            },
            LogError::InProgressElsewhere { owner, stmt_id } => TxnError::conflicting(
                owner,
                format!("statement {stmt_id} is part of an uncommitted internal transaction"),
            ),
            LogError::Store(err) => TxnError::Store(err),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplaySource {
    /// The requesting identity's own record.
    Exact,
    /// Another identity of the session ran the statement for the same
    /// session-level txn number.
    History { owner: SessionIdentity },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Replayed {
    pub outcome: OperationOutcome,
    pub op_time: OpTime,
    pub source: ReplaySource,
}

/// Retry probe: the statement key, the session-level number it counts
/// toward, and the payload fingerprint of the incoming request.
#[derive(Clone, Copy, Debug)]
pub struct RetryProbe {
    pub key: StatementKey,
    pub history_txn_number: Option<TxnNumber>,
    pub request_sha256: [u8; 32],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StatementExecutionLog;

impl StatementExecutionLog {
    pub fn new() -> Self {
        Self
    }

    pub fn record_if_absent(
        &self,
        txn: &mut dyn SessionStoreTxn,
        row: &StatementRow,
    ) -> Result<StatementInsert, LogError> {
        Ok(txn.insert_statement_if_absent(row)?)
    }

    pub fn lookup(
        &self,
        txn: &dyn SessionStoreTxn,
        key: &StatementKey,
    ) -> Result<Option<OperationOutcome>, LogError> {
        Ok(txn.lookup_statement(key)?.map(|row| row.outcome))
    }

    /// Exact key first, then the session's retryable history.
    pub fn lookup_for_retry(
        &self,
        txn: &dyn SessionStoreTxn,
        probe: &RetryProbe,
    ) -> Result<Option<Replayed>, LogError> {
        if let Some(row) = txn.lookup_statement(&probe.key)? {
            ensure_same_payload(&row, probe)?;
            return Ok(Some(Replayed {
                outcome: row.outcome,
                op_time: row.op_time,
                source: ReplaySource::Exact,
            }));
        }

        let Some(history_txn_number) = probe.history_txn_number else {
            return Ok(None);
        };
        let session_id = probe.key.txn.identity.session_id;
        let rows = txn.lookup_history(&session_id, history_txn_number, probe.key.stmt_id)?;
        let mut pending = None;
        for row in rows.into_iter().filter(|row| row.key != probe.key) {
            if !row.committed {
                pending.get_or_insert(row.key.txn);
                continue;
            }
            ensure_same_payload(&row, probe)?;
            return Ok(Some(Replayed {
                outcome: row.outcome.as_history_replay(),
                op_time: row.op_time,
                source: ReplaySource::History {
                    owner: row.key.txn.identity,
                },
            }));
        }
        match pending {
            Some(owner) => Err(LogError::InProgressElsewhere {
                owner,
                stmt_id: probe.key.stmt_id,
            }),
            None => Ok(None),
        }
    }

    /// Make a committed transaction's records visible to history replay.
    pub fn seal(&self, txn: &mut dyn SessionStoreTxn, id: &TxnId) -> Result<usize, LogError> {
        Ok(txn.mark_statements_committed(id)?)
    }

    /// Drop an aborted transaction's records.
    pub fn discard(&self, txn: &mut dyn SessionStoreTxn, id: &TxnId) -> Result<usize, LogError> {
        Ok(txn.delete_statements(id)?)
    }
}

fn ensure_same_payload(row: &StatementRow, probe: &RetryProbe) -> Result<(), LogError> {
    if row.request_sha256 == probe.request_sha256 {
        return Ok(());
    }
    tracing::error!(
        txn = %row.key.txn,
        stmt_id = row.key.stmt_id.get(),
        recorded = %hex32(&row.request_sha256),
        incoming = %hex32(&probe.request_sha256),
        "statement replayed with a different payload"
    );
    Err(LogError::PayloadMismatch {
        key: row.key,
        expected_sha256: row.request_sha256,
        got_sha256: probe.request_sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SessionId, Timestamp, TxnUuid, WriteResult};
    use crate::store::{MemorySessionStore, SessionStore};
    use uuid::Uuid;

    fn session() -> SessionId {
        SessionId::new(Uuid::from_bytes([4; 16]))
    }

    fn n(value: u64) -> TxnNumber {
        TxnNumber::new(value).unwrap()
    }

    fn row(txn: TxnId, history: Option<TxnNumber>, sha: u8, committed: bool) -> StatementRow {
        StatementRow {
            key: StatementKey::new(txn, StmtId::new(0)),
            history_txn_number: history,
            request_sha256: [sha; 32],
            outcome: OperationOutcome::Applied(WriteResult {
                n: 1,
                n_modified: 1,
                upserted_id: None,
            }),
            op_time: OpTime::new(1, Timestamp::new(10, 0)),
            committed,
            created_at_ms: 1,
        }
    }

    fn probe(txn: TxnId, history: Option<TxnNumber>, sha: u8) -> RetryProbe {
        RetryProbe {
            key: StatementKey::new(txn, StmtId::new(0)),
            history_txn_number: history,
            request_sha256: [sha; 32],
        }
    }

    fn child(seed: u8, parent: TxnNumber) -> SessionIdentity {
        SessionIdentity::retryable_child(session(), parent, TxnUuid::new(Uuid::from_bytes([seed; 16])))
    }

    #[test]
    fn second_record_returns_existing_row() {
        let store = MemorySessionStore::new();
        let log = StatementExecutionLog::new();
        let txn = TxnId::new(SessionIdentity::parent(session()), n(1));
        let mut tx = store.writer().begin_txn().unwrap();
        let first = row(txn, Some(n(1)), 1, true);
        assert_eq!(
            log.record_if_absent(&mut *tx, &first).unwrap(),
            StatementInsert::Inserted
        );
        let mut second = first.clone();
        second.request_sha256 = [2; 32];
        assert_eq!(
            log.record_if_absent(&mut *tx, &second).unwrap(),
            StatementInsert::AlreadyPresent(first.clone())
        );
        assert_eq!(
            log.lookup(&*tx, &first.key).unwrap(),
            Some(first.outcome.clone())
        );
        tx.commit().unwrap();
    }

    #[test]
    fn exact_hit_with_other_payload_conflicts() {
        let store = MemorySessionStore::new();
        let log = StatementExecutionLog::new();
        let txn = TxnId::new(SessionIdentity::parent(session()), n(1));
        let mut tx = store.writer().begin_txn().unwrap();
        log.record_if_absent(&mut *tx, &row(txn, Some(n(1)), 1, true))
            .unwrap();
        let err = log
            .lookup_for_retry(&*tx, &probe(txn, Some(n(1)), 9))
            .unwrap_err();
        assert!(matches!(err, LogError::PayloadMismatch { .. }));
        assert!(matches!(
            TxnError::from(err),
            TxnError::ConflictingOperationReplay { .. }
        ));
    }

    #[test]
    fn parent_retry_replays_committed_child_statement() {
        let store = MemorySessionStore::new();
        let log = StatementExecutionLog::new();
        let child_txn = TxnId::new(child(1, n(5)), n(0));
        let mut tx = store.writer().begin_txn().unwrap();
        log.record_if_absent(&mut *tx, &row(child_txn, Some(n(5)), 3, true))
            .unwrap();

        let parent_txn = TxnId::new(SessionIdentity::parent(session()), n(5));
        let replayed = log
            .lookup_for_retry(&*tx, &probe(parent_txn, Some(n(5)), 3))
            .unwrap()
            .unwrap();
        assert_eq!(
            replayed.source,
            ReplaySource::History {
                owner: child_txn.identity
            }
        );
        assert_eq!(
            replayed.outcome,
            OperationOutcome::Applied(WriteResult {
                n: 1,
                n_modified: 0,
                upserted_id: None,
            })
        );
    }

    #[test]
    fn uncommitted_history_is_in_progress_elsewhere() {
        let store = MemorySessionStore::new();
        let log = StatementExecutionLog::new();
        let first = TxnId::new(child(1, n(5)), n(0));
        let mut tx = store.writer().begin_txn().unwrap();
        log.record_if_absent(&mut *tx, &row(first, Some(n(5)), 3, false))
            .unwrap();

        let second = TxnId::new(child(2, n(5)), n(0));
        let err = log
            .lookup_for_retry(&*tx, &probe(second, Some(n(5)), 3))
            .unwrap_err();
        assert!(matches!(err, LogError::InProgressElsewhere { owner, .. } if owner == first));

        log.discard(&mut *tx, &first).unwrap();
        assert_eq!(
            log.lookup_for_retry(&*tx, &probe(second, Some(n(5)), 3))
                .unwrap(),
            None
        );
    }

    #[test]
    fn sealing_exposes_rows_to_history() {
        let store = MemorySessionStore::new();
        let log = StatementExecutionLog::new();
        let first = TxnId::new(child(1, n(2)), n(0));
        let mut tx = store.writer().begin_txn().unwrap();
        log.record_if_absent(&mut *tx, &row(first, Some(n(2)), 3, false))
            .unwrap();
        assert_eq!(log.seal(&mut *tx, &first).unwrap(), 1);

        let parent = TxnId::new(SessionIdentity::parent(session()), n(2));
        assert!(
            log.lookup_for_retry(&*tx, &probe(parent, Some(n(2)), 3))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn non_retryable_rows_never_enter_history() {
        let store = MemorySessionStore::new();
        let log = StatementExecutionLog::new();
        let plain = SessionIdentity::non_retryable_child(
            session(),
            TxnUuid::new(Uuid::from_bytes([8; 16])),
        );
        let mut tx = store.writer().begin_txn().unwrap();
        log.record_if_absent(&mut *tx, &row(TxnId::new(plain, n(0)), None, 3, true))
            .unwrap();

        let parent = TxnId::new(SessionIdentity::parent(session()), n(0));
        assert_eq!(
            log.lookup_for_retry(&*tx, &probe(parent, Some(n(0)), 3))
                .unwrap(),
            None
        );
    }
}
