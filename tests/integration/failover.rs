//! Restart against the same sqlite store stands in for failover.

use serde_json::json;

use rtxn::api::WriteRequest;
use rtxn::coordinator::TxnError;
use rtxn::core::{ErrorCode, SessionIdentity, StmtId};
use std::sync::Arc;

use rtxn::store::{MemorySessionStore, TxnState};

use crate::fixtures::ops::{child, insert, n, parent, session, txn_id, txn_uuid, upsert_inc};
use crate::fixtures::rig::Rig;

#[test]
fn prepared_transaction_commits_once_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = session(1);
    let id = txn_id(SessionIdentity::parent(s), 1);

    let prepare_ts = {
        let rig = Rig::sqlite(dir.path());
        rig.retry
            .execute(&WriteRequest::in_transaction(
                parent(s, 1),
                true,
                [insert(json!({ "_id": 1, "v": 1 }))],
            ))
            .unwrap();
        rig.retry.prepare_transaction(&id).unwrap()
    };

    let rig = Rig::sqlite(dir.path());
    let report = rig.retry.recover().unwrap();
    assert_eq!(report.prepared, vec![id]);
    assert!(report.aborted.is_empty());
    assert!(report.clock_seed >= prepare_ts);
    assert!(rig.doc(1).is_none());

    // Prepare is idempotent and keeps its timestamp.
    assert_eq!(rig.retry.prepare_transaction(&id).unwrap(), prepare_ts);

    let commit_ts = rig.retry.commit_transaction(&id, Some(prepare_ts)).unwrap();
    assert_eq!(commit_ts, prepare_ts);
    assert_eq!(rig.retry.commit_transaction(&id, Some(prepare_ts)).unwrap(), commit_ts);
    assert!(matches!(
        rig.retry.abort_transaction(&id),
        Err(TxnError::TransactionCommitted { .. })
    ));
    drop(rig);

    let rig = Rig::sqlite(dir.path());
    rig.retry.recover().unwrap();
    assert_eq!(rig.doc_count(), 1);
    assert_eq!(rig.field(1, "v"), Some(1));
}

#[test]
fn prepared_transaction_can_be_aborted_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = session(2);
    let id = txn_id(SessionIdentity::parent(s), 1);
    {
        let rig = Rig::sqlite(dir.path());
        rig.retry
            .execute(&WriteRequest::in_transaction(
                parent(s, 1),
                true,
                [insert(json!({ "_id": 1 }))],
            ))
            .unwrap();
        rig.retry.prepare_transaction(&id).unwrap();
    }

    let rig = Rig::sqlite(dir.path());
    rig.retry.recover().unwrap();
    rig.retry.abort_transaction(&id).unwrap();

    assert!(rig.doc(1).is_none());
    let err = rig.retry.commit_transaction(&id, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchTransaction);
}

#[test]
fn prepared_commit_rejects_timestamp_before_prepare() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rig = Rig::sqlite(dir.path());
    let s = session(3);
    let id = txn_id(SessionIdentity::parent(s), 1);
    rig.retry
        .execute(&WriteRequest::in_transaction(parent(s, 1), true, [insert(json!({ "_id": 1 }))]))
        .unwrap();
    let prepare_ts = rig.retry.prepare_transaction(&id).unwrap();

    let early = rtxn::core::Timestamp::new(prepare_ts.wall_ms.saturating_sub(1), 0);
    let err = rig.retry.commit_transaction(&id, Some(early)).unwrap_err();
    assert!(matches!(err, TxnError::InvalidOptions { .. }));
    let err = rig.retry.commit_transaction(&id, None).unwrap_err();
    assert!(matches!(err, TxnError::InvalidOptions { .. }));
    assert!(rig.doc(1).is_none());

    // Statements against a prepared transaction are refused.
    let err = rig
        .retry
        .execute(
            &WriteRequest::in_transaction(parent(s, 1), false, [insert(json!({ "_id": 2 }))])
                .with_stmt_ids([1]),
        )
        .unwrap_err();
    assert!(matches!(err, TxnError::PreparedTransactionInProgress { .. }));
}

#[test]
fn in_progress_transaction_is_aborted_by_recovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = session(4);
    let identity = SessionIdentity::parent(s);
    {
        let rig = Rig::sqlite(dir.path());
        rig.retry
            .execute(&WriteRequest::in_transaction(
                parent(s, 1),
                true,
                [insert(json!({ "_id": 1 }))],
            ))
            .unwrap();
    }

    let rig = Rig::sqlite(dir.path());
    let report = rig.retry.recover().unwrap();
    assert_eq!(report.aborted, vec![txn_id(identity, 1)]);

    let record = rig.retry.coordinator().load_record(&identity).unwrap().unwrap();
    assert_eq!(record.state, TxnState::Aborted);
    assert!(rig.commit(identity, 1).is_err());
    assert!(rig.doc(1).is_none());
}

#[test]
fn retryable_history_and_ordering_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = session(5);
    let request = WriteRequest::retryable(parent(s, 3), [upsert_inc(1, "c")]);
    let first = {
        let rig = Rig::sqlite(dir.path());
        rig.retry.execute(&request).unwrap()
    };

    let rig = Rig::sqlite(dir.path());
    rig.retry.recover().unwrap();
    let replay = rig.retry.execute(&request).unwrap();
    assert_eq!(replay.without_retry_info(), first);
    assert_eq!(replay.retried_stmt_ids, vec![StmtId::new(0)]);
    assert_eq!(rig.field(1, "c"), Some(1));

    let err = rig
        .retry
        .execute(&WriteRequest::retryable(parent(s, 2), [upsert_inc(1, "c")]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransactionTooOld);
}

#[test]
fn clock_does_not_run_backward_across_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = session(6);
    let identity = SessionIdentity::parent(s);
    let before = {
        let rig = Rig::sqlite(dir.path());
        rig.retry
            .execute(&WriteRequest::in_transaction(parent(s, 1), true, [insert(json!({ "_id": 1 }))]))
            .unwrap();
        rig.commit(identity, 1).unwrap()
    };

    let rig = Rig::sqlite(dir.path());
    let report = rig.retry.recover().unwrap();
    assert!(report.clock_seed >= before);
    rig.retry
        .execute(&WriteRequest::in_transaction(parent(s, 2), true, [insert(json!({ "_id": 2 }))]))
        .unwrap();
    assert!(rig.commit(identity, 2).unwrap() > before);
}

#[test]
fn stale_primary_defers_to_durable_session_number() {
    let store = Arc::new(MemorySessionStore::new());
    let old_primary = Rig::over(store.clone());
    let new_primary = Rig::over(store);
    let s = session(9);

    old_primary
        .retry
        .execute(&WriteRequest::retryable(
            parent(s, 5),
            [insert(json!({ "_id": 1 }))],
        ))
        .unwrap();

    let newer = SessionIdentity::retryable_child(s, n(6), txn_uuid(0x61));
    new_primary
        .retry
        .execute(&WriteRequest::retryable(
            child(newer, 0),
            [insert(json!({ "_id": 2 }))],
        ))
        .unwrap();

    let err = old_primary
        .retry
        .execute(&WriteRequest::retryable(
            parent(s, 5),
            [insert(json!({ "_id": 3 }))],
        ))
        .unwrap_err();
    assert!(
        matches!(err, TxnError::TransactionTooOld { requested, highest, .. } if requested == n(5) && highest == n(6)),
        "got {err:?}"
    );
    assert!(old_primary.doc(3).is_none());

    old_primary.retry.recover().unwrap();
    assert_eq!(old_primary.retry.coordinator().ledger().cached(&s), None);
}
