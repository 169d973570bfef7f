//! Transaction lifecycle: in-progress, prepared, committed, aborted.
//!
//! `TransactionCoordinator` owns the per-identity `TxnRecord` state machine.
//! Statement execution runs inside a store txn opened by the caller (see
//! `retry`); prepare, commit, abort and recovery open their own.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::{
    Clock, OpTime, OperationOutcome, SessionId, SessionIdentity, StmtId, Timestamp, TxnId,
    TxnNumber, WriteOp, now_ms,
};
use crate::engine::{ExecutionEngine, StagedDocuments};
use crate::ledger::TransactionNumberLedger;
use crate::statement_log::StatementExecutionLog;
use crate::store::{
    SessionStore, SessionStoreTxn, StatementInsert, StatementKey, StatementRow, TxnKind,
    TxnRecord, TxnState,
};

mod error;
pub mod participant;
pub mod two_phase;

pub use error::TxnError;
pub use participant::{LocalParticipant, Participant};
pub use two_phase::{CancelToken, CommitCoordinator, CommitOptions, DecisionRecovery};

/// Per-session critical sections. Different sessions never share a lock.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<BTreeMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("session lock table poisoned");
        Arc::clone(locks.entry(*session_id).or_default())
    }

    pub fn with_session<T>(&self, session_id: &SessionId, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().expect("session lock poisoned");
        f()
    }

    /// Drop the entry for an idle session.
    pub fn release(&self, session_id: &SessionId) {
        let mut locks = self.locks.lock().expect("session lock table poisoned");
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().expect("session lock table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transaction-level fields of one incoming statement.
#[derive(Clone, Copy, Debug)]
pub struct BeginRequest {
    pub identity: SessionIdentity,
    pub txn_number: TxnNumber,
    pub start_transaction: bool,
    pub autocommit: Option<bool>,
}

impl BeginRequest {
    pub fn txn_id(&self) -> TxnId {
        TxnId::new(self.identity, self.txn_number)
    }

    fn kind(&self) -> TxnKind {
        if self.autocommit.is_some() {
            TxnKind::MultiStatement
        } else {
            TxnKind::RetryableWrite
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StatementInput<'a> {
    pub stmt_id: StmtId,
    pub op: &'a WriteOp,
    pub request_sha256: [u8; 32],
}

#[derive(Clone, Debug, PartialEq)]
pub struct Executed {
    pub outcome: OperationOutcome,
    pub op_time: OpTime,
    /// The statement failed inside a multi-statement transaction, which is
    /// now aborted.
    pub aborted_txn: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecoveryReport {
    pub clock_seed: Timestamp,
    pub aborted: Vec<TxnId>,
    pub prepared: Vec<TxnId>,
}

#[derive(Clone, Copy, Debug)]
pub struct CoordinatorOptions {
    /// Election term stamped on op-times.
    pub term: u64,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self { term: 1 }
    }
}

pub struct TransactionCoordinator {
    store: Arc<dyn SessionStore>,
    engine: Arc<dyn ExecutionEngine>,
    clock: Arc<Clock>,
    ledger: Arc<TransactionNumberLedger>,
    log: StatementExecutionLog,
    locks: SessionLocks,
    options: CoordinatorOptions,
}

impl TransactionCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn ExecutionEngine>,
        clock: Arc<Clock>,
        ledger: Arc<TransactionNumberLedger>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            engine,
            clock,
            ledger,
            log: StatementExecutionLog::new(),
            locks: SessionLocks::new(),
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn ledger(&self) -> &Arc<TransactionNumberLedger> {
        &self.ledger
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn load_record(&self, identity: &SessionIdentity) -> Result<Option<TxnRecord>, TxnError> {
        Ok(self.store.reader().load_txn_record(identity)?)
    }

    /// Resolve the record a statement runs under.
    ///
    /// Returns the existing record when the number matches, or a fresh
    /// in-progress record when the request starts a new transaction. A
    /// fresh record is only persisted once a statement executes.
    pub fn begin_or_continue(
        &self,
        txn: &mut dyn SessionStoreTxn,
        request: &BeginRequest,
    ) -> Result<TxnRecord, TxnError> {
        validate_options(request)?;
        self.retire_stale_siblings(txn, request)?;
        let id = request.txn_id();
        let kind = request.kind();
        let existing = txn.load_txn_record(&request.identity)?;

        let Some(record) = existing else {
            return fresh_record(request, kind);
        };

        if record.txn_number > request.txn_number {
            return Err(TxnError::TransactionTooOld {
                session_id: request.identity.session_id,
                requested: request.txn_number,
                highest: record.txn_number,
            });
        }

        if record.txn_number < request.txn_number {
            match record.state {
                TxnState::Prepared => {
                    return Err(TxnError::PreparedTransactionInProgress {
                        txn: record.txn_id(),
                    });
                }
                TxnState::InProgress => {
                    tracing::info!(
                        txn = %record.txn_id(),
                        next = request.txn_number.get(),
                        "implicitly aborting transaction superseded by a newer txn number"
                    );
                    let mut superseded = record;
                    self.abort_record(txn, &mut superseded)?;
                }
                TxnState::Committed | TxnState::Aborted => {
                    self.log.discard(txn, &record.txn_id())?;
                }
            }
            return fresh_record(request, kind);
        }

        if record.kind != kind {
            return Err(TxnError::conflicting(
                id,
                format!(
                    "txn number already used for a {} txn",
                    kind_str(record.kind)
                ),
            ));
        }

        if kind == TxnKind::MultiStatement {
            match (request.start_transaction, record.state) {
                (_, TxnState::Committed) => {}
                (true, state) => {
                    return Err(TxnError::conflicting(
                        id,
                        format!("cannot start a transaction that is {}", state.as_str()),
                    ));
                }
                (false, TxnState::Aborted) => {
                    return Err(TxnError::no_such_transaction(id, "transaction was aborted"));
                }
                (false, TxnState::Prepared) => {
                    return Err(TxnError::PreparedTransactionInProgress { txn: id });
                }
                (false, TxnState::InProgress) => {}
            }
        }
        Ok(record)
    }

    /// Run one statement through the engine and record it in `txn`.
    ///
    /// The caller has already ruled out a replay. `record` is updated and
    /// written back.
    pub fn execute_statement(
        &self,
        txn: &mut dyn SessionStoreTxn,
        record: &mut TxnRecord,
        input: &StatementInput<'_>,
    ) -> Result<Executed, TxnError> {
        let id = record.txn_id();
        if record.kind == TxnKind::MultiStatement {
            match record.state {
                TxnState::InProgress => {}
                TxnState::Committed => return Err(TxnError::TransactionCommitted { txn: id }),
                TxnState::Prepared => return Err(TxnError::PreparedTransactionInProgress { txn: id }),
                TxnState::Aborted => {
                    return Err(TxnError::no_such_transaction(id, "transaction was aborted"));
                }
            }
        }

        let applied = {
            let view = StagedDocuments::new(&*txn, &record.pending_writes);
            self.engine.apply(&view, input.op)?
        };
        let op_time = OpTime::new(self.options.term, self.clock.tick());
        let now = now_ms();

        if record.kind == TxnKind::MultiStatement && applied.outcome.is_failed() {
            self.log.discard(txn, &id)?;
            record.pending_writes.clear();
            record.state = TxnState::Aborted;
            record.updated_at_ms = now;
            txn.put_txn_record(record)?;
            tracing::info!(
                txn = %id,
                stmt_id = input.stmt_id.get(),
                "statement failed; transaction aborted"
            );
            return Ok(Executed {
                outcome: applied.outcome,
                op_time,
                aborted_txn: true,
            });
        }

        let committed = record.kind == TxnKind::RetryableWrite;
        let row = StatementRow {
            key: StatementKey::new(id, input.stmt_id),
            history_txn_number: record.identity.effective_txn_number(Some(record.txn_number)),
            request_sha256: input.request_sha256,
            outcome: applied.outcome.clone(),
            op_time,
            committed,
            created_at_ms: now,
        };
        if let StatementInsert::AlreadyPresent(existing) = self.log.record_if_absent(txn, &row)? {
            return Ok(Executed {
                outcome: existing.outcome,
                op_time: existing.op_time,
                aborted_txn: false,
            });
        }

        if committed {
            for write in &applied.writes {
                txn.apply_document_write(write)?;
            }
            record.state = TxnState::Committed;
        } else {
            record.pending_writes.extend(applied.writes);
        }
        record.last_write_op_time = Some(op_time);
        record.updated_at_ms = now;
        txn.put_txn_record(record)?;
        tracing::trace!(
            txn = %id,
            stmt_id = input.stmt_id.get(),
            op_time = %op_time,
            "statement executed"
        );
        Ok(Executed {
            outcome: applied.outcome,
            op_time,
            aborted_txn: false,
        })
    }

    pub fn prepare(&self, id: &TxnId) -> Result<Timestamp, TxnError> {
        self.locks.with_session(&id.identity.session_id, || -> Result<Timestamp, TxnError> {
            let mut txn = self.store.writer().begin_txn()?;
            let mut record = self.load_for_decision(&*txn, id)?;
            match record.state {
                TxnState::Prepared => {
                    return record.prepare_ts.ok_or_else(|| {
                        TxnError::no_such_transaction(*id, "prepared record has no timestamp")
                    });
                }
                TxnState::Committed => return Err(TxnError::TransactionCommitted { txn: *id }),
                TxnState::Aborted => {
                    return Err(TxnError::no_such_transaction(*id, "transaction was aborted"));
                }
                TxnState::InProgress => {}
            }
            let prepare_ts = self.clock.tick();
            record.state = TxnState::Prepared;
            record.prepare_ts = Some(prepare_ts);
            record.updated_at_ms = now_ms();
            txn.put_txn_record(&record)?;
            txn.commit()?;
            tracing::info!(txn = %id, prepare_ts = %prepare_ts, "transaction prepared");
            Ok(prepare_ts)
        })
    }

    /// Commit `id`, returning its commit timestamp.
    ///
    /// Re-committing returns the original timestamp without touching state.
    pub fn commit(&self, id: &TxnId, commit_ts: Option<Timestamp>) -> Result<Timestamp, TxnError> {
        self.locks.with_session(&id.identity.session_id, || -> Result<Timestamp, TxnError> {
            let mut txn = self.store.writer().begin_txn()?;
            let mut record = self.load_for_decision(&*txn, id)?;
            let commit_ts = match record.state {
                TxnState::Committed => {
                    let original = record.commit_ts.unwrap_or(Timestamp::ZERO);
                    tracing::debug!(txn = %id, commit_ts = %original, "commit replayed");
                    return Ok(original);
                }
                TxnState::Aborted => {
                    return Err(TxnError::no_such_transaction(*id, "transaction was aborted"));
                }
                TxnState::Prepared => {
                    let prepare_ts = record.prepare_ts.unwrap_or(Timestamp::ZERO);
                    let Some(commit_ts) = commit_ts else {
                        return Err(TxnError::invalid_options(
                            "commit of a prepared transaction requires a commit timestamp",
                        ));
                    };
                    if commit_ts < prepare_ts {
                        return Err(TxnError::invalid_options(format!(
                            "commit timestamp {commit_ts} is before prepare timestamp {prepare_ts}"
                        )));
                    }
                    self.clock.observe(commit_ts);
                    commit_ts
                }
                TxnState::InProgress => {
                    if commit_ts.is_some() {
                        return Err(TxnError::invalid_options(
                            "commit timestamp is only valid for a prepared transaction",
                        ));
                    }
                    self.clock.tick()
                }
            };

            for write in &record.pending_writes {
                txn.apply_document_write(write)?;
            }
            let sealed = self.log.seal(&mut *txn, id)?;
            record.pending_writes.clear();
            record.state = TxnState::Committed;
            record.commit_ts = Some(commit_ts);
            record.updated_at_ms = now_ms();
            txn.put_txn_record(&record)?;
            txn.commit()?;
            tracing::info!(
                txn = %id,
                commit_ts = %commit_ts,
                statements = sealed,
                "transaction committed"
            );
            Ok(commit_ts)
        })
    }

    pub fn abort(&self, id: &TxnId) -> Result<(), TxnError> {
        self.locks.with_session(&id.identity.session_id, || -> Result<(), TxnError> {
            let mut txn = self.store.writer().begin_txn()?;
            let mut record = self.load_for_decision(&*txn, id)?;
            match record.state {
                TxnState::Committed => return Err(TxnError::TransactionCommitted { txn: *id }),
                TxnState::Aborted => {
                    return Err(TxnError::no_such_transaction(*id, "transaction was aborted"));
                }
                TxnState::InProgress | TxnState::Prepared => {}
            }
            let was = record.state;
            self.abort_record(&mut *txn, &mut record)?;
            txn.commit()?;
            tracing::info!(txn = %id, was = was.as_str(), "transaction aborted");
            Ok(())
        })
    }

    /// Step-up / restart: reseed the clock, abort unprepared transactions
    /// and report the prepared ones that still await a decision.
    pub fn recover(&self) -> Result<RecoveryReport, TxnError> {
        self.ledger.clear();
        let reader = self.store.reader();
        let clock_seed = reader.max_timestamp()?;
        self.clock.observe(clock_seed);

        let mut report = RecoveryReport {
            clock_seed,
            ..RecoveryReport::default()
        };
        for unresolved in reader.list_unresolved_txn_records()? {
            let id = unresolved.txn_id();
            if unresolved.state == TxnState::Prepared {
                tracing::info!(txn = %id, "prepared transaction awaiting decision");
                report.prepared.push(id);
                continue;
            }
            self.locks.with_session(&id.identity.session_id, || -> Result<(), TxnError> {
                let mut txn = self.store.writer().begin_txn()?;
                let Some(mut record) = txn.load_txn_record(&id.identity)? else {
                    return Ok(());
                };
                if record.txn_id() != id || record.state != TxnState::InProgress {
                    return Ok(());
                }
                self.abort_record(&mut *txn, &mut record)?;
                txn.commit()?;
                Ok(())
            })?;
            tracing::warn!(txn = %id, "aborted in-progress transaction during recovery");
            report.aborted.push(id);
        }
        tracing::info!(
            clock_seed = %clock_seed,
            aborted = report.aborted.len(),
            prepared = report.prepared.len(),
            "transaction recovery finished"
        );
        Ok(report)
    }

    /// Other identities of the session whose effective number falls below
    /// the one `request` runs under. A prepared one blocks the request; an
    /// in-progress one can never commit again and is aborted.
    fn retire_stale_siblings(
        &self,
        txn: &mut dyn SessionStoreTxn,
        request: &BeginRequest,
    ) -> Result<(), TxnError> {
        let Some(requested) = request
            .identity
            .effective_txn_number(Some(request.txn_number))
        else {
            return Ok(());
        };
        for mut sibling in txn.list_session_txn_records(&request.identity.session_id)? {
            if sibling.identity == request.identity {
                continue;
            }
            let stale = sibling
                .identity
                .effective_txn_number(Some(sibling.txn_number))
                .is_some_and(|number| number < requested);
            if !stale {
                continue;
            }
            match sibling.state {
                TxnState::Prepared => {
                    return Err(TxnError::PreparedTransactionInProgress {
                        txn: sibling.txn_id(),
                    });
                }
                TxnState::InProgress => {
                    tracing::info!(
                        txn = %sibling.txn_id(),
                        next = requested.get(),
                        "implicitly aborting sibling superseded by a newer session txn number"
                    );
                    self.abort_record(txn, &mut sibling)?;
                }
                TxnState::Committed | TxnState::Aborted => {}
            }
        }
        Ok(())
    }

    fn abort_record(
        &self,
        txn: &mut dyn SessionStoreTxn,
        record: &mut TxnRecord,
    ) -> Result<(), TxnError> {
        self.log.discard(txn, &record.txn_id())?;
        record.pending_writes.clear();
        record.state = TxnState::Aborted;
        record.updated_at_ms = now_ms();
        txn.put_txn_record(record)?;
        Ok(())
    }

    /// Record targeted by prepare / commit / abort.
    fn load_for_decision(
        &self,
        txn: &dyn SessionStoreTxn,
        id: &TxnId,
    ) -> Result<TxnRecord, TxnError> {
        let record = txn.load_txn_record(&id.identity)?;
        // A prepared transaction must stay resolvable whatever the session
        // has moved on to.
        let prepared = record.as_ref().is_some_and(|record| {
            record.txn_number == id.txn_number && record.state == TxnState::Prepared
        });
        if !prepared {
            self.ledger
                .check(txn, &id.identity, Some(id.txn_number))?;
        }
        let Some(record) = record else {
            return Err(TxnError::no_such_transaction(*id, "no transaction record"));
        };
        if record.txn_number > id.txn_number {
            return Err(TxnError::TransactionTooOld {
                session_id: id.identity.session_id,
                requested: id.txn_number,
                highest: record.txn_number,
            });
        }
        if record.txn_number < id.txn_number {
            return Err(TxnError::no_such_transaction(
                *id,
                format!("latest transaction is {}", record.txn_number),
            ));
        }
        if record.kind != TxnKind::MultiStatement {
            return Err(TxnError::no_such_transaction(
                *id,
                "txn number belongs to a retryable write",
            ));
        }
        Ok(record)
    }
}

fn validate_options(request: &BeginRequest) -> Result<(), TxnError> {
    match (request.start_transaction, request.autocommit) {
        (_, Some(true)) => Err(TxnError::invalid_options("autocommit must be false")),
        (true, None) => Err(TxnError::invalid_options(
            "startTransaction requires autocommit: false",
        )),
        _ => Ok(()),
    }
}

fn fresh_record(request: &BeginRequest, kind: TxnKind) -> Result<TxnRecord, TxnError> {
    if kind == TxnKind::MultiStatement && !request.start_transaction {
        return Err(TxnError::no_such_transaction(
            request.txn_id(),
            "transaction was never started",
        ));
    }
    Ok(TxnRecord::new(
        request.identity,
        request.txn_number,
        kind,
        now_ms(),
    ))
}

fn kind_str(kind: TxnKind) -> &'static str {
    match kind {
        TxnKind::RetryableWrite => "retryable write",
        TxnKind::MultiStatement => "multi-statement",
    }
}
