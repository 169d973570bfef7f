#![forbid(unsafe_code)]

//! Exactly-once retryable writes and multi-statement transactions keyed by
//! logical session.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod engine;
pub mod error;
pub mod ledger;
mod paths;
pub mod retry;
pub mod statement_log;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

pub use error::{Effect, Error, Result, Transience};

pub use crate::api::{TxnControlRequest, TxnControlResponse, WriteRequest, WriteResponse};
pub use crate::coordinator::{
    CommitCoordinator, LocalParticipant, Participant, TransactionCoordinator, TxnError,
};
pub use crate::core::{
    Clock, ErrorCode, ErrorLabel, Namespace, SessionId, SessionIdentity, StmtId, Timestamp,
    TxnId, TxnNumber, WriteOp,
};
pub use crate::engine::{DocumentEngine, ExecutionEngine};
pub use crate::ledger::TransactionNumberLedger;
pub use crate::retry::{RetryCoordinator, RetryOptions};
pub use crate::statement_log::StatementExecutionLog;
pub use crate::store::{MemorySessionStore, SessionStore, SqliteSessionStore};

/// Opens the store named by `config`, runs crash recovery, and returns a
/// coordinator stack backed by `DocumentEngine`.
pub fn open(config: &config::Config) -> Result<RetryCoordinator> {
    let store: Arc<dyn SessionStore> = if config.store.in_memory {
        Arc::new(MemorySessionStore::new())
    } else {
        let dir = config.store.path.clone().unwrap_or_else(paths::store_dir);
        Arc::new(SqliteSessionStore::open(&dir, config.store.durability)?)
    };
    let retry = RetryCoordinator::open(
        store,
        Arc::new(DocumentEngine::new()),
        config.coordinator_options(),
        config.retry_options(),
    );
    let report = retry.recover()?;
    tracing::info!(
        aborted = report.aborted.len(),
        prepared = report.prepared.len(),
        "session store opened"
    );
    Ok(retry)
}
