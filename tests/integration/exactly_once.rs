use serde_json::json;

use rtxn::api::WriteRequest;
use rtxn::coordinator::TxnError;
use rtxn::core::{ErrorCode, ErrorLabel, SessionIdentity, StmtId};

use crate::fixtures::ops::{inc, insert, parent, session, txn_id, upsert_inc};
use crate::fixtures::rig::Rig;

#[test]
fn retried_insert_is_applied_once() {
    let rig = Rig::memory();
    let request = WriteRequest::retryable(parent(session(1), 1), [insert(json!({ "_id": 1 }))]);

    let first = rig.retry.execute(&request).unwrap();
    let second = rig.retry.execute(&request).unwrap();

    assert_eq!(first.n, 1);
    assert_eq!(second.without_retry_info(), first);
    assert_eq!(second.retried_stmt_ids, vec![StmtId::new(0)]);
    assert_eq!(rig.doc_count(), 1);
}

#[test]
fn recorded_error_replays_without_reexecuting() {
    let rig = Rig::memory();
    let s = session(2);
    rig.retry
        .execute(&WriteRequest::retryable(parent(s, 1), [insert(json!({ "_id": 1 }))]))
        .unwrap();

    let dup = WriteRequest::retryable(parent(s, 2), [insert(json!({ "_id": 1, "v": 2 }))]);
    let first = rig.retry.execute(&dup).unwrap();
    assert_eq!(first.write_errors.len(), 1);
    assert_eq!(first.write_errors[0].code_name, ErrorCode::DuplicateKey);

    // The conflicting document is gone now, but the recorded outcome stands.
    rig.retry
        .execute(&WriteRequest::retryable(
            parent(s, 2),
            [rtxn::core::WriteOp::Delete {
                ns: crate::fixtures::ops::ns(),
                filter: json!({ "_id": 1 }),
                multi: false,
            }],
        )
        .with_stmt_ids([1]))
        .unwrap();
    let replay = rig.retry.execute(&dup).unwrap();
    assert_eq!(replay.without_retry_info(), first);
    assert!(rig.doc(1).is_none());
}

#[test]
fn same_statement_with_different_payload_conflicts() {
    let rig = Rig::memory();
    let s = session(3);
    rig.retry
        .execute(&WriteRequest::retryable(parent(s, 1), [upsert_inc(1, "a")]))
        .unwrap();

    let err = rig
        .retry
        .execute(&WriteRequest::retryable(parent(s, 1), [upsert_inc(1, "b")]))
        .unwrap_err();

    assert!(matches!(err, TxnError::ConflictingOperationReplay { .. }), "got {err:?}");
    assert_eq!(rig.field(1, "a"), Some(1));
    assert_eq!(rig.field(1, "b"), None);
}

#[test]
fn lower_txn_number_is_rejected() {
    let rig = Rig::memory();
    let s = session(4);
    rig.retry
        .execute(&WriteRequest::retryable(parent(s, 5), [upsert_inc(1, "a")]))
        .unwrap();

    let err = rig
        .retry
        .execute(&WriteRequest::retryable(parent(s, 4), [upsert_inc(1, "a")]))
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::TransactionTooOld);
    assert_eq!(rig.field(1, "a"), Some(1));
}

#[test]
fn concurrent_retries_apply_once() {
    let rig = Rig::memory();
    let s = session(5);
    rig.retry
        .execute(&WriteRequest::retryable(parent(s, 1), [insert(json!({ "_id": 1, "c": 0 }))]))
        .unwrap();
    let request = WriteRequest::retryable(parent(s, 2), [inc(1, "c")]);

    let replays: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| rig.retry.execute(&request).unwrap()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().retried_stmt_ids.len())
            .sum()
    });

    assert_eq!(replays, 7);
    assert_eq!(rig.field(1, "c"), Some(1));
}

#[test]
fn transaction_writes_appear_only_at_commit() {
    let rig = Rig::memory();
    let s = session(6);
    let identity = SessionIdentity::parent(s);

    rig.retry
        .execute(&WriteRequest::in_transaction(parent(s, 1), true, [insert(json!({ "_id": 1 }))]))
        .unwrap();
    rig.retry
        .execute(
            &WriteRequest::in_transaction(parent(s, 1), false, [insert(json!({ "_id": 2 }))])
                .with_stmt_ids([1]),
        )
        .unwrap();
    assert_eq!(rig.doc_count(), 0);

    let commit_ts = rig.commit(identity, 1).unwrap();
    assert_eq!(rig.doc_count(), 2);

    assert_eq!(rig.commit(identity, 1).unwrap(), commit_ts);
    let err = rig.retry.abort_transaction(&txn_id(identity, 1)).unwrap_err();
    assert!(matches!(err, TxnError::TransactionCommitted { .. }));

    let err = rig
        .retry
        .execute(
            &WriteRequest::in_transaction(parent(s, 1), false, [insert(json!({ "_id": 3 }))])
                .with_stmt_ids([2]),
        )
        .unwrap_err();
    assert!(matches!(err, TxnError::TransactionCommitted { .. }));
}

#[test]
fn aborted_transaction_stays_aborted() {
    let rig = Rig::memory();
    let s = session(7);
    let identity = SessionIdentity::parent(s);
    rig.retry
        .execute(&WriteRequest::in_transaction(parent(s, 1), true, [insert(json!({ "_id": 1 }))]))
        .unwrap();
    rig.retry.abort_transaction(&txn_id(identity, 1)).unwrap();

    let err = rig.commit(identity, 1).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchTransaction);
    assert!(err.has_label(ErrorLabel::TransientTransactionError));

    let err = rig
        .retry
        .execute(
            &WriteRequest::in_transaction(parent(s, 1), false, [insert(json!({ "_id": 2 }))])
                .with_stmt_ids([1]),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchTransaction);
    assert_eq!(rig.doc_count(), 0);

    // A new number starts cleanly.
    rig.retry
        .execute(&WriteRequest::in_transaction(parent(s, 2), true, [insert(json!({ "_id": 1 }))]))
        .unwrap();
    rig.commit(identity, 2).unwrap();
    assert_eq!(rig.doc_count(), 1);
}

#[test]
fn failed_statement_aborts_the_transaction() {
    let rig = Rig::memory();
    let s = session(8);
    rig.retry
        .execute(&WriteRequest::retryable(parent(s, 1), [insert(json!({ "_id": 1 }))]))
        .unwrap();

    let response = rig
        .retry
        .execute(&WriteRequest::in_transaction(
            parent(s, 2),
            true,
            [insert(json!({ "_id": 2 })), insert(json!({ "_id": 1 })), insert(json!({ "_id": 3 }))],
        ))
        .unwrap();
    assert_eq!(response.write_errors.len(), 1);
    assert_eq!(response.write_errors[0].index, 1);

    let err = rig.commit(SessionIdentity::parent(s), 2).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchTransaction);
    assert!(rig.doc(2).is_none());
    assert!(rig.doc(3).is_none());
}
