//! Parent/child session interplay.

use serde_json::json;

use rtxn::api::WriteRequest;
use rtxn::coordinator::TxnError;
use rtxn::core::{SessionIdentity, StmtId};
use rtxn::store::TxnState;

use crate::fixtures::ops::{child, inc, insert, n, parent, session, txn_id, txn_uuid};
use crate::fixtures::rig::Rig;

#[test]
fn parent_retry_replays_statement_committed_by_child() {
    let rig = Rig::memory();
    let s = session(1);
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 4),
            [insert(json!({ "_id": 1, "x": 1, "y": 0 }))],
        ))
        .unwrap();

    let child_identity = SessionIdentity::retryable_child(s, n(5), txn_uuid(0xa1));
    let in_child =
        WriteRequest::in_transaction(child(child_identity, 0), true, [inc(1, "y")]).with_stmt_ids([1]);
    let executed = rig.retry.execute(&in_child).unwrap();
    assert_eq!((executed.n, executed.n_modified), (1, 1));
    rig.commit(child_identity, 0).unwrap();
    assert_eq!(rig.field(1, "y"), Some(1));

    let retry = WriteRequest::retryable(parent(s, 5), [inc(1, "y")]).with_stmt_ids([1]);
    let replayed = rig.retry.execute(&retry).unwrap();

    assert_eq!((replayed.n, replayed.n_modified), (1, 0));
    assert_eq!(replayed.retried_stmt_ids, vec![StmtId::new(1)]);
    assert_eq!(rig.field(1, "y"), Some(1));
}

#[test]
fn child_of_an_older_parent_number_is_too_old() {
    let rig = Rig::memory();
    let s = session(2);
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 6),
            [insert(json!({ "_id": 1 }))],
        ))
        .unwrap();

    let stale = SessionIdentity::retryable_child(s, n(5), txn_uuid(0xb2));
    let err = rig
        .retry
        .execute(&WriteRequest::in_transaction(
            child(stale, 0),
            true,
            [insert(json!({ "_id": 2 }))],
        ))
        .unwrap_err();

    match err {
        TxnError::TransactionTooOld {
            requested, highest, ..
        } => {
            assert_eq!(requested, n(5));
            assert_eq!(highest, n(6));
        }
        other => panic!("expected TransactionTooOld, got {other:?}"),
    }
    assert!(rig.doc(2).is_none());
}

#[test]
fn non_retryable_children_ignore_session_ordering() {
    let rig = Rig::memory();
    let s = session(3);
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 3),
            [insert(json!({ "_id": 1, "a": 0 }))],
        ))
        .unwrap();

    let first = SessionIdentity::non_retryable_child(s, txn_uuid(0xd1));
    let second = SessionIdentity::non_retryable_child(s, txn_uuid(0xd2));

    // Interleaved: `first` stays open while `second` runs a lower number.
    rig.retry
        .execute(&WriteRequest::in_transaction(child(first, 7), true, [inc(1, "a")]))
        .unwrap();
    rig.retry
        .execute(&WriteRequest::in_transaction(
            child(second, 2),
            true,
            [insert(json!({ "_id": 2 }))],
        ))
        .unwrap();
    rig.commit(second, 2).unwrap();
    rig.commit(first, 7).unwrap();

    assert_eq!(rig.field(1, "a"), Some(1));
    assert!(rig.doc(2).is_some());

    // The parent ordering was never advanced past 3.
    assert_eq!(rig.retry.coordinator().ledger().cached(&s), Some(n(3)));
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 4),
            [insert(json!({ "_id": 3 }))],
        ))
        .unwrap();
}

#[test]
fn sibling_children_do_not_replay_each_other_unless_committed() {
    let rig = Rig::memory();
    let s = session(4);
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 1),
            [insert(json!({ "_id": 1, "y": 0 }))],
        ))
        .unwrap();

    let open_child = SessionIdentity::retryable_child(s, n(2), txn_uuid(0xc1));
    rig.retry
        .execute(&WriteRequest::in_transaction(child(open_child, 0), true, [inc(1, "y")]))
        .unwrap();

    let err = rig
        .retry
        .execute(&WriteRequest::retryable(parent(s, 2), [inc(1, "y")]))
        .unwrap_err();
    assert!(
        matches!(err, TxnError::ConflictingOperationInProgress { .. }),
        "got {err:?}"
    );

    rig.retry
        .abort_transaction(&txn_id(open_child, 0))
        .unwrap();
    let executed = rig
        .retry
        .execute(&WriteRequest::retryable(parent(s, 2), [inc(1, "y")]))
        .unwrap();
    assert!(executed.retried_stmt_ids.is_empty());
    assert_eq!(rig.field(1, "y"), Some(1));
}

#[test]
fn prepared_child_blocks_newer_parent_number_until_resolved() {
    let rig = Rig::memory();
    let s = session(5);
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 4),
            [insert(json!({ "_id": 1, "y": 0 }))],
        ))
        .unwrap();

    let prepared = SessionIdentity::retryable_child(s, n(5), txn_uuid(0xe1));
    rig.retry
        .execute(&WriteRequest::in_transaction(child(prepared, 0), true, [inc(1, "y")]))
        .unwrap();
    let prepare_ts = rig.retry.prepare_transaction(&txn_id(prepared, 0)).unwrap();

    let newer = WriteRequest::retryable(parent(s, 6), [insert(json!({ "_id": 2 }))]);
    let err = rig.retry.execute(&newer).unwrap_err();
    assert!(
        matches!(err, TxnError::PreparedTransactionInProgress { txn } if txn == txn_id(prepared, 0)),
        "got {err:?}"
    );
    assert!(rig.doc(2).is_none());

    let committed = rig
        .retry
        .commit_transaction(&txn_id(prepared, 0), Some(prepare_ts))
        .unwrap();
    assert_eq!(committed, prepare_ts);
    assert_eq!(rig.field(1, "y"), Some(1));

    rig.retry.execute(&newer).unwrap();
    assert!(rig.doc(2).is_some());
}

#[test]
fn newer_parent_number_aborts_open_child() {
    let rig = Rig::memory();
    let s = session(6);
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 1),
            [insert(json!({ "_id": 1, "y": 0 }))],
        ))
        .unwrap();

    let open_child = SessionIdentity::retryable_child(s, n(2), txn_uuid(0xf1));
    rig.retry
        .execute(&WriteRequest::in_transaction(child(open_child, 0), true, [inc(1, "y")]))
        .unwrap();

    rig.retry
        .execute(&WriteRequest::retryable(parent(s, 3), [inc(1, "z")]))
        .unwrap();

    let record = rig
        .retry
        .coordinator()
        .load_record(&open_child)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, TxnState::Aborted);
    let err = rig.commit(open_child, 0).unwrap_err();
    assert!(
        matches!(err, TxnError::TransactionTooOld { requested, highest, .. } if requested == n(2) && highest == n(3)),
        "got {err:?}"
    );
    assert_eq!(rig.field(1, "y"), Some(0));
}
