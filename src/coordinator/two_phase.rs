//! Distributed commit across participants.
//!
//! The decision record moves `Preparing -> Decided -> Completed` in the
//! store. Once a decision is durable it never changes: a restart resumes
//! delivery from the record, and a record still `Preparing` resolves to
//! abort.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::{Timestamp, TxnId, now_ms};
use crate::store::{CommitDecision, DecisionPhase, DecisionRecord, SessionStore};

use super::{Participant, TxnError};

const CANCEL_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug)]
pub struct CommitOptions {
    /// Bound on one `commit_transaction` / `abort_transaction` call.
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionRecovery {
    pub txn: TxnId,
    pub decision: CommitDecision,
    /// Every participant acknowledged the decision.
    pub completed: bool,
}

enum Vote {
    Commit(Timestamp),
    Abort(String),
    Cancelled,
}

pub struct CommitCoordinator {
    store: Arc<dyn SessionStore>,
    participants: BTreeMap<String, Arc<dyn Participant>>,
    options: CommitOptions,
}

impl CommitCoordinator {
    pub fn new(store: Arc<dyn SessionStore>, options: CommitOptions) -> Self {
        Self {
            store,
            participants: BTreeMap::new(),
            options,
        }
    }

    pub fn register(&mut self, participant: Arc<dyn Participant>) {
        self.participants
            .insert(participant.name().to_string(), participant);
    }

    pub fn with_participant(mut self, participant: Arc<dyn Participant>) -> Self {
        self.register(participant);
        self
    }

    pub fn decision(&self, txn: &TxnId) -> Result<Option<DecisionRecord>, TxnError> {
        Ok(self.store.reader().load_decision(txn)?)
    }

    /// Run two-phase commit of `txn` over the named participants.
    ///
    /// Returns the commit timestamp. An abort decision surfaces as
    /// `NoSuchTransaction`. Calling again after any outcome re-delivers the
    /// durable decision without preparing again.
    pub fn commit_transaction(
        &self,
        txn: &TxnId,
        participants: &[String],
        cancel: &CancelToken,
    ) -> Result<Timestamp, TxnError> {
        let deadline = Instant::now() + self.options.timeout;
        let names = normalize(participants)?;
        let resolved = self.resolve(&names)?;

        if let Some(existing) = self.begin_preparing(txn, &names)? {
            tracing::debug!(txn = %txn, phase = existing.phase.as_str(), "resuming commit decision");
            return self.finish(existing, deadline, cancel);
        }

        let decision = match self.prepare_all(txn, &resolved, deadline, cancel) {
            Vote::Commit(commit_ts) => CommitDecision::Commit { commit_ts },
            Vote::Abort(reason) => {
                tracing::info!(txn = %txn, reason = %reason, "prepare failed; deciding abort");
                CommitDecision::Abort
            }
            Vote::Cancelled => {
                let record = self.decide(txn, &names, CommitDecision::Abort)?;
                if record.decision != Some(CommitDecision::Abort) {
                    return self.finish(record, deadline, cancel);
                }
                tracing::info!(txn = %txn, "commit interrupted before a decision");
                return Err(TxnError::Interrupted {
                    txn: *txn,
                    phase: "prepare",
                    decided: false,
                });
            }
        };
        let record = self.decide(txn, &names, decision)?;
        self.finish(record, deadline, cancel)
    }

    pub fn abort_transaction(&self, txn: &TxnId, participants: &[String]) -> Result<(), TxnError> {
        let deadline = Instant::now() + self.options.timeout;
        let names = normalize(participants)?;
        let record = self.decide(txn, &names, CommitDecision::Abort)?;
        match self.finish(record, deadline, &CancelToken::new()) {
            Ok(_) => Err(TxnError::TransactionCommitted { txn: *txn }),
            Err(TxnError::NoSuchTransaction { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Resume every decision left unfinished by a previous run.
    pub fn recover(&self) -> Result<Vec<DecisionRecovery>, TxnError> {
        let mut out = Vec::new();
        for pending in self.store.reader().list_pending_decisions()? {
            let record = if pending.decision.is_none() {
                tracing::warn!(txn = %pending.txn, "no decision before restart; aborting");
                self.decide(&pending.txn, &pending.participants, CommitDecision::Abort)?
            } else {
                pending
            };
            let Some(decision) = record.decision else {
                continue;
            };
            let txn = record.txn;
            let deadline = Instant::now() + self.options.timeout;
            let completed = match self.finish(record, deadline, &CancelToken::new()) {
                Ok(_) | Err(TxnError::NoSuchTransaction { .. }) => true,
                Err(err) => {
                    tracing::warn!(txn = %txn, error = %err, "decision delivery incomplete");
                    false
                }
            };
            out.push(DecisionRecovery {
                txn,
                decision,
                completed,
            });
        }
        tracing::info!(resumed = out.len(), "commit decision recovery finished");
        Ok(out)
    }

    fn prepare_all(
        &self,
        txn: &TxnId,
        participants: &[Arc<dyn Participant>],
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Vote {
        let (tx, rx) = crossbeam::channel::unbounded::<(String, Result<Timestamp, TxnError>)>();
        for participant in participants {
            let participant = Arc::clone(participant);
            let tx = tx.clone();
            let txn = *txn;
            thread::spawn(move || {
                let result = participant.prepare(&txn);
                let _ = tx.send((participant.name().to_string(), result));
            });
        }
        drop(tx);

        let mut pending = participants.len();
        let mut commit_ts = Timestamp::ZERO;
        while pending > 0 {
            if cancel.is_cancelled() {
                return Vote::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Vote::Abort(format!(
                    "{pending} participant(s) did not prepare before the deadline"
                ));
            }
            let tick = crossbeam::channel::after((deadline - now).min(CANCEL_POLL));
            crossbeam::select! {
                recv(rx) -> msg => match msg {
                    Ok((name, Ok(prepare_ts))) => {
                        tracing::debug!(txn = %txn, participant = %name, prepare_ts = %prepare_ts, "participant prepared");
                        commit_ts = commit_ts.max(prepare_ts);
                        pending -= 1;
                    }
                    Ok((name, Err(err))) => {
                        return Vote::Abort(format!("participant {name} failed to prepare: {err}"));
                    }
                    Err(_) => return Vote::Abort("prepare workers exited early".into()),
                },
                recv(tick) -> _ => {}
            }
        }
        Vote::Commit(commit_ts)
    }

    /// Deliver the decision and mark the record completed.
    fn finish(
        &self,
        mut record: DecisionRecord,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Timestamp, TxnError> {
        let Some(decision) = record.decision else {
            return Err(TxnError::no_such_transaction(record.txn, "no commit decision"));
        };
        if record.phase != DecisionPhase::Completed {
            let resolved = self.resolve(&record.participants)?;
            for participant in &resolved {
                self.deliver(&record.txn, participant.as_ref(), decision, deadline, cancel)?;
            }
            record.phase = DecisionPhase::Completed;
            record.updated_at_ms = now_ms();
            self.mark_completed(&record)?;
        }
        match decision {
            CommitDecision::Commit { commit_ts } => {
                tracing::info!(txn = %record.txn, commit_ts = %commit_ts, "distributed commit completed");
                Ok(commit_ts)
            }
            CommitDecision::Abort => Err(TxnError::no_such_transaction(
                record.txn,
                "transaction was aborted by the commit coordinator",
            )),
        }
    }

    fn deliver(
        &self,
        txn: &TxnId,
        participant: &dyn Participant,
        decision: CommitDecision,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<(), TxnError> {
        let phase = match decision {
            CommitDecision::Commit { .. } => "commit",
            CommitDecision::Abort => "abort",
        };
        let mut backoff = self.options.backoff_base;
        loop {
            if cancel.is_cancelled() {
                return Err(TxnError::Interrupted {
                    txn: *txn,
                    phase,
                    decided: true,
                });
            }
            let result = match decision {
                CommitDecision::Commit { commit_ts } => {
                    participant.commit_with_timestamp(txn, commit_ts)
                }
                CommitDecision::Abort => participant.abort(txn),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.transience().is_retryable() => {
                    if Instant::now() + backoff >= deadline {
                        tracing::warn!(
                            txn = %txn,
                            participant = participant.name(),
                            error = %err,
                            "decision delivery timed out"
                        );
                        return Err(TxnError::ExceededTimeLimit { txn: *txn, phase });
                    }
                    tracing::debug!(
                        txn = %txn,
                        participant = participant.name(),
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying decision delivery"
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.options.backoff_max);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Persist `decision` unless one is already durable; returns the winner.
    fn decide(
        &self,
        txn: &TxnId,
        participants: &[String],
        decision: CommitDecision,
    ) -> Result<DecisionRecord, TxnError> {
        let mut store_txn = self.store.writer().begin_txn()?;
        if let Some(existing) = store_txn.load_decision(txn)?
            && existing.decision.is_some()
        {
            store_txn.rollback()?;
            return Ok(existing);
        }
        let record = DecisionRecord {
            txn: *txn,
            participants: participants.to_vec(),
            phase: DecisionPhase::Decided,
            decision: Some(decision),
            updated_at_ms: now_ms(),
        };
        store_txn.put_decision(&record)?;
        store_txn.commit()?;
        tracing::info!(txn = %txn, decision = ?decision, "commit decision durable");
        Ok(record)
    }

    /// Write a `Preparing` record unless a decision is already durable, in
    /// which case that decision is returned.
    fn begin_preparing(
        &self,
        txn: &TxnId,
        participants: &[String],
    ) -> Result<Option<DecisionRecord>, TxnError> {
        let mut store_txn = self.store.writer().begin_txn()?;
        if let Some(existing) = store_txn.load_decision(txn)?
            && existing.decision.is_some()
        {
            store_txn.rollback()?;
            return Ok(Some(existing));
        }
        store_txn.put_decision(&DecisionRecord {
            txn: *txn,
            participants: participants.to_vec(),
            phase: DecisionPhase::Preparing,
            decision: None,
            updated_at_ms: now_ms(),
        })?;
        store_txn.commit()?;
        Ok(None)
    }

    /// Mark `record` completed if the durable record still carries the same
    /// decision and has not completed yet.
    fn mark_completed(&self, record: &DecisionRecord) -> Result<(), TxnError> {
        let mut store_txn = self.store.writer().begin_txn()?;
        let current = store_txn.load_decision(&record.txn)?;
        let writable = current.as_ref().is_some_and(|current| {
            current.decision == record.decision && current.phase == DecisionPhase::Decided
        });
        if !writable {
            store_txn.rollback()?;
            return Ok(());
        }
        store_txn.put_decision(record)?;
        store_txn.commit()?;
        Ok(())
    }

    fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Participant>>, TxnError> {
        names
            .iter()
            .map(|name| {
                self.participants
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TxnError::UnknownParticipant {
                        participant: name.clone(),
                    })
            })
            .collect()
    }
}

fn normalize(participants: &[String]) -> Result<Vec<String>, TxnError> {
    let mut names = participants.to_vec();
    names.sort();
    names.dedup();
    if names.is_empty() {
        return Err(TxnError::invalid_request(
            "distributed commit needs at least one participant",
        ));
    }
    Ok(names)
}
