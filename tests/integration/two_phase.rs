//! Distributed commit over in-process shards.

use std::sync::Arc;

use serde_json::json;

use rtxn::api::WriteRequest;
use rtxn::coordinator::{CancelToken, CommitCoordinator, CommitOptions, LocalParticipant, TxnError};
use rtxn::core::{SessionIdentity, TxnId};
use rtxn::store::{CommitDecision, DecisionPhase, MemorySessionStore, TxnState};

use crate::fixtures::ops::{insert, parent, session, txn_id};
use crate::fixtures::rig::Rig;

struct Cluster {
    names: Vec<String>,
    shards: Vec<Rig>,
    coordinator: CommitCoordinator,
}

impl Cluster {
    fn new(names: &[&str]) -> Self {
        let shards: Vec<Rig> = names.iter().map(|_| Rig::memory()).collect();
        let mut coordinator = CommitCoordinator::new(
            Arc::new(MemorySessionStore::new()),
            CommitOptions::default(),
        );
        for (name, shard) in names.iter().zip(&shards) {
            coordinator.register(Arc::new(LocalParticipant::new(
                *name,
                shard.retry.coordinator().clone(),
            )));
        }
        Self {
            names: names.iter().map(|name| name.to_string()).collect(),
            shards,
            coordinator,
        }
    }

    fn write_on(&self, shard: usize, s: rtxn::core::SessionId, doc_id: i64) {
        self.shards[shard]
            .retry
            .execute(&WriteRequest::in_transaction(
                parent(s, 1),
                true,
                [insert(json!({ "_id": doc_id }))],
            ))
            .unwrap();
    }

    fn commit(&self, txn: &TxnId) -> Result<rtxn::core::Timestamp, TxnError> {
        self.coordinator
            .commit_transaction(txn, &self.names, &CancelToken::new())
    }
}

#[test]
fn commit_applies_on_every_shard_at_the_max_prepare_timestamp() {
    let cluster = Cluster::new(&["shard-0", "shard-1"]);
    let s = session(1);
    let identity = SessionIdentity::parent(s);
    let txn = txn_id(identity, 1);
    cluster.write_on(0, s, 1);
    cluster.write_on(1, s, 2);

    let commit_ts = cluster.commit(&txn).unwrap();

    let mut max_prepare = None;
    for (shard, doc_id) in cluster.shards.iter().zip([1, 2]) {
        assert!(shard.doc(doc_id).is_some());
        let record = shard
            .retry
            .coordinator()
            .load_record(&identity)
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TxnState::Committed);
        assert_eq!(record.commit_ts, Some(commit_ts));
        max_prepare = max_prepare.max(record.prepare_ts);
    }
    assert_eq!(max_prepare, Some(commit_ts));

    let decision = cluster.coordinator.decision(&txn).unwrap().unwrap();
    assert_eq!(decision.phase, DecisionPhase::Completed);
    assert_eq!(decision.decision, Some(CommitDecision::Commit { commit_ts }));
}

#[test]
fn recommit_returns_the_decided_timestamp_and_abort_is_refused() {
    let cluster = Cluster::new(&["shard-0", "shard-1"]);
    let s = session(2);
    let txn = txn_id(SessionIdentity::parent(s), 1);
    cluster.write_on(0, s, 1);
    cluster.write_on(1, s, 2);

    let commit_ts = cluster.commit(&txn).unwrap();
    assert_eq!(cluster.commit(&txn).unwrap(), commit_ts);

    let err = cluster
        .coordinator
        .abort_transaction(&txn, &cluster.names)
        .unwrap_err();
    assert!(matches!(err, TxnError::TransactionCommitted { .. }));
}

#[test]
fn shard_that_cannot_prepare_aborts_everyone() {
    let cluster = Cluster::new(&["shard-0", "shard-1"]);
    let s = session(3);
    let identity = SessionIdentity::parent(s);
    let txn = txn_id(identity, 1);
    // shard-1 never ran the transaction.
    cluster.write_on(0, s, 1);

    let err = cluster.commit(&txn).unwrap_err();
    assert!(matches!(err, TxnError::NoSuchTransaction { .. }), "got {err:?}");

    let shard = &cluster.shards[0];
    assert!(shard.doc(1).is_none());
    let record = shard
        .retry
        .coordinator()
        .load_record(&identity)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, TxnState::Aborted);

    let decision = cluster.coordinator.decision(&txn).unwrap().unwrap();
    assert_eq!(decision.decision, Some(CommitDecision::Abort));
}

#[test]
fn explicit_abort_before_commit_wins() {
    let cluster = Cluster::new(&["shard-0", "shard-1"]);
    let s = session(4);
    let txn = txn_id(SessionIdentity::parent(s), 1);
    cluster.write_on(0, s, 1);
    cluster.write_on(1, s, 2);

    cluster
        .coordinator
        .abort_transaction(&txn, &cluster.names)
        .unwrap();
    let err = cluster.commit(&txn).unwrap_err();
    assert!(matches!(err, TxnError::NoSuchTransaction { .. }));
    assert!(cluster.shards.iter().all(|shard| shard.doc_count() == 0));
}
