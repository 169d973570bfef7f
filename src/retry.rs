//! Client-facing entry point: execute, replay or reject.
//!
//! Each statement of a request runs in its own store txn under the session
//! lock: ledger admission, record resolution, replay lookup, execution and
//! the statement record all commit together or not at all.

use std::sync::Arc;
use std::time::Duration;

use crate::api::{Upserted, WriteError, WriteRequest, WriteResponse};
use crate::coordinator::{
    BeginRequest, CoordinatorOptions, RecoveryReport, StatementInput, TransactionCoordinator,
    TxnError,
};
use crate::core::{
    Clock, OperationOutcome, SessionIdentity, StmtId, Timestamp, TxnId, WriteOp, fingerprint,
    now_ms, to_canon_json_bytes,
};
use crate::engine::ExecutionEngine;
use crate::ledger::TransactionNumberLedger;
use crate::statement_log::{ReplaySource, RetryProbe, StatementExecutionLog};
use crate::store::{SessionStore, StatementKey, TxnKind, TxnState};

#[derive(Clone, Copy, Debug)]
pub struct RetryOptions {
    pub max_statements_per_request: usize,
    pub max_operation_bytes: usize,
    pub session_history_retention: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_statements_per_request: 1_000,
            max_operation_bytes: 16 * 1024 * 1024,
            session_history_retention: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub records: usize,
    pub statements: usize,
    pub sessions_forgotten: usize,
}

/// Result of one statement.
enum StatementResult {
    Replayed(OperationOutcome),
    Executed {
        outcome: OperationOutcome,
        aborted_txn: bool,
    },
}

pub struct RetryCoordinator {
    coordinator: Arc<TransactionCoordinator>,
    log: StatementExecutionLog,
    options: RetryOptions,
}

impl RetryCoordinator {
    pub fn new(coordinator: Arc<TransactionCoordinator>, options: RetryOptions) -> Self {
        Self {
            coordinator,
            log: StatementExecutionLog::new(),
            options,
        }
    }

    /// Wire a coordinator stack over `store` with a fresh ledger and clock.
    pub fn open(
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn ExecutionEngine>,
        coordinator_options: CoordinatorOptions,
        options: RetryOptions,
    ) -> Self {
        let coordinator = TransactionCoordinator::new(
            store,
            engine,
            Arc::new(Clock::new()),
            Arc::new(TransactionNumberLedger::new()),
            coordinator_options,
        );
        Self::new(Arc::new(coordinator), options)
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn execute(&self, request: &WriteRequest) -> Result<WriteResponse, TxnError> {
        let identity = request.session.identity()?;
        self.validate(request, &identity)?;

        let Some(txn_number) = request.session.txn_number else {
            return self.execute_direct(request);
        };

        let span = tracing::debug_span!(
            "write",
            identity = %identity,
            txn_number = txn_number.get(),
            statements = request.statements.len()
        );
        let _guard = span.enter();

        self.coordinator
            .locks()
            .with_session(&identity.session_id, || -> Result<WriteResponse, TxnError> {
                let mut response = WriteResponse::default();
                for (index, statement) in request.statements.iter().enumerate() {
                    let stmt_id = match statement.stmt_id {
                        Some(stmt_id) => stmt_id,
                        None => positional_stmt_id(index)?,
                    };
                    let begin = BeginRequest {
                        identity,
                        txn_number,
                        start_transaction: request.start_transaction && index == 0,
                        autocommit: request.autocommit,
                    };
                    let result = self.run_statement(&begin, stmt_id, &statement.op)?;
                    let (outcome, stop) = match result {
                        StatementResult::Replayed(outcome) => {
                            response.retried_stmt_ids.push(stmt_id);
                            (outcome, false)
                        }
                        StatementResult::Executed {
                            outcome,
                            aborted_txn,
                        } => (outcome, aborted_txn),
                    };
                    let failed = outcome.is_failed();
                    accumulate(&mut response, index, outcome);
                    if stop || (failed && request.ordered) {
                        break;
                    }
                }
                Ok(response)
            })
    }

    pub fn prepare_transaction(&self, txn: &TxnId) -> Result<Timestamp, TxnError> {
        self.coordinator.prepare(txn)
    }

    pub fn commit_transaction(
        &self,
        txn: &TxnId,
        commit_ts: Option<Timestamp>,
    ) -> Result<Timestamp, TxnError> {
        self.coordinator.commit(txn, commit_ts)
    }

    pub fn abort_transaction(&self, txn: &TxnId) -> Result<(), TxnError> {
        self.coordinator.abort(txn)
    }

    pub fn recover(&self) -> Result<RecoveryReport, TxnError> {
        self.coordinator.recover()
    }

    /// Drop terminal history older than the retention window.
    pub fn reap_expired_sessions(&self) -> Result<ReapReport, TxnError> {
        let retention = self.options.session_history_retention.as_millis() as u64;
        let cutoff = now_ms().saturating_sub(retention);
        self.reap_before(cutoff)
    }

    /// Drop terminal history last touched before `cutoff_ms`.
    pub fn reap_before(&self, cutoff_ms: u64) -> Result<ReapReport, TxnError> {
        let expired = self
            .coordinator
            .store()
            .reader()
            .list_expired_txn_records(cutoff_ms)?;
        let mut report = ReapReport::default();
        for candidate in expired {
            let session_id = candidate.identity.session_id;
            let locks = self.coordinator.locks();
            locks.with_session(&session_id, || -> Result<(), TxnError> {
                let mut txn = self.coordinator.store().writer().begin_txn()?;
                let Some(record) = txn.load_txn_record(&candidate.identity)? else {
                    return Ok(());
                };
                if !record.state.is_terminal() || record.updated_at_ms >= cutoff_ms {
                    return Ok(());
                }
                report.statements += txn.delete_identity_statements(&record.identity)?;
                txn.delete_txn_record(&record.identity)?;
                let idle = txn.delete_ledger_if_idle(&session_id)?;
                txn.commit()?;
                report.records += 1;
                if idle {
                    self.coordinator.ledger().forget(&session_id);
                    report.sessions_forgotten += 1;
                }
                Ok(())
            })?;
            locks.release(&session_id);
        }
        if report.records > 0 {
            tracing::info!(
                records = report.records,
                statements = report.statements,
                sessions = report.sessions_forgotten,
                "reaped expired session history"
            );
        }
        Ok(report)
    }

    fn validate(&self, request: &WriteRequest, identity: &SessionIdentity) -> Result<(), TxnError> {
        if request.statements.is_empty() {
            return Err(TxnError::invalid_request("request has no statements"));
        }
        if request.statements.len() > self.options.max_statements_per_request {
            return Err(TxnError::invalid_request(format!(
                "{} statements exceed the limit of {}",
                request.statements.len(),
                self.options.max_statements_per_request
            )));
        }
        if identity.is_child() && request.session.txn_number.is_none() {
            return Err(TxnError::invalid_request(
                "child session requests must carry txnNumber",
            ));
        }
        if request.session.txn_number.is_none()
            && (request.start_transaction || request.autocommit.is_some())
        {
            return Err(TxnError::invalid_options(
                "transaction options require txnNumber",
            ));
        }
        for statement in &request.statements {
            statement.op.validate()?;
            let bytes = to_canon_json_bytes(&statement.op)?.len();
            if bytes > self.options.max_operation_bytes {
                return Err(TxnError::invalid_request(format!(
                    "operation of {bytes} bytes exceeds the limit of {}",
                    self.options.max_operation_bytes
                )));
            }
        }
        Ok(())
    }

    fn run_statement(
        &self,
        begin: &BeginRequest,
        stmt_id: StmtId,
        op: &WriteOp,
    ) -> Result<StatementResult, TxnError> {
        let coordinator = &self.coordinator;
        let ledger = coordinator.ledger();
        let mut txn = coordinator.store().writer().begin_txn()?;

        let decision = ledger.validate_and_advance(&mut *txn, &begin.identity, Some(begin.txn_number))?;
        let mut record = coordinator.begin_or_continue(&mut *txn, begin)?;

        let request_sha256 = fingerprint(op)?;
        let probe = RetryProbe {
            key: StatementKey::new(begin.txn_id(), stmt_id),
            history_txn_number: begin.identity.effective_txn_number(Some(begin.txn_number)),
            request_sha256,
        };
        if let Some(replayed) = self.log.lookup_for_retry(&*txn, &probe)? {
            txn.commit()?;
            ledger.publish(&decision);
            match replayed.source {
                ReplaySource::Exact => {
                    tracing::debug!(stmt_id = stmt_id.get(), "statement replayed")
                }
                ReplaySource::History { owner } => tracing::debug!(
                    stmt_id = stmt_id.get(),
                    owner = %owner,
                    "statement replayed from session history"
                ),
            }
            return Ok(StatementResult::Replayed(replayed.outcome));
        }

        if record.kind == TxnKind::MultiStatement && record.state == TxnState::Committed {
            return Err(TxnError::TransactionCommitted {
                txn: record.txn_id(),
            });
        }

        let executed = coordinator.execute_statement(
            &mut *txn,
            &mut record,
            &StatementInput {
                stmt_id,
                op,
                request_sha256,
            },
        )?;
        txn.commit()?;
        ledger.publish(&decision);
        Ok(StatementResult::Executed {
            outcome: executed.outcome,
            aborted_txn: executed.aborted_txn,
        })
    }

    /// No txn number at any level: apply without ledger or statement log.
    fn execute_direct(&self, request: &WriteRequest) -> Result<WriteResponse, TxnError> {
        let mut response = WriteResponse::default();
        for (index, statement) in request.statements.iter().enumerate() {
            let mut txn = self.coordinator.store().writer().begin_txn()?;
            let applied = self.coordinator.engine().apply(&*txn, &statement.op)?;
            for write in &applied.writes {
                txn.apply_document_write(write)?;
            }
            txn.commit()?;
            let failed = applied.outcome.is_failed();
            accumulate(&mut response, index, applied.outcome);
            if failed && request.ordered {
                break;
            }
        }
        Ok(response)
    }
}

fn positional_stmt_id(index: usize) -> Result<StmtId, TxnError> {
    u32::try_from(index).map(StmtId::new).map_err(|_| {
        TxnError::invalid_request(format!("statement index {index} exceeds the stmt id range"))
    })
}

fn accumulate(response: &mut WriteResponse, index: usize, outcome: OperationOutcome) {
    match outcome {
        OperationOutcome::Applied(result) => {
            response.n += result.n;
            response.n_modified += result.n_modified;
            if let Some(id) = result.upserted_id {
                response.upserted.push(Upserted { index, id });
            }
        }
        OperationOutcome::Failed(recorded) => {
            response
                .write_errors
                .push(WriteError::from_recorded(index, &recorded));
        }
    }
}
