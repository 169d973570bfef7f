//! Session state store: transactional traits + row types.
//!
//! Everything the protocol persists goes through one `SessionStoreTxn`:
//! the per-session ledger, transaction records, statement records, commit
//! decisions and the documents written by the execution engine. A statement
//! record and the write it describes always land in the same commit.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::{
    Namespace, OpTime, OperationOutcome, SessionId, SessionIdentity, StmtId, Timestamp, TxnId,
    TxnNumber, canon_key,
};
use crate::error::{Effect, Transience};

pub mod memory;
pub mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

pub const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("store schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
    #[error("missing meta key: {key}")]
    MetaMissing { key: &'static str },
    #[error("{table} row decode failed: {reason}")]
    RowDecode { table: &'static str, reason: String },
    #[error("row payload encode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store txn already finished")]
    TxnFinished,
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Transience::Retryable
            }
            StoreError::Sqlite(_) | StoreError::Io { .. } => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    /// Store txns roll back on error, so only a failed commit leaves the
    /// outcome in doubt.
    pub fn effect(&self) -> Effect {
        match self {
            StoreError::Sqlite(_) | StoreError::Io { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreDurability {
    Cache,
    #[default]
    Durable,
}

impl StoreDurability {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreDurability::Cache => "cache",
            StoreDurability::Durable => "durable",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cache" => Some(StoreDurability::Cache),
            "durable" => Some(StoreDurability::Durable),
            _ => None,
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnKind {
    /// Retryable write outside a multi-statement transaction.
    RetryableWrite,
    /// `startTransaction` / `commitTransaction` bracketed transaction.
    MultiStatement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    InProgress,
    Prepared,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxnState::InProgress => "in_progress",
            TxnState::Prepared => "prepared",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        }
    }
}

/// Document mutation produced by the execution engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentWrite {
    Put { ns: Namespace, id: Value, body: Value },
    Delete { ns: Namespace, id: Value },
}

impl DocumentWrite {
    pub fn ns(&self) -> &Namespace {
        match self {
            DocumentWrite::Put { ns, .. } | DocumentWrite::Delete { ns, .. } => ns,
        }
    }

    /// Storage key derived from the document `_id`.
    pub fn key(&self) -> String {
        match self {
            DocumentWrite::Put { id, .. } | DocumentWrite::Delete { id, .. } => canon_key(id),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredDocument {
    pub key: String,
    pub body: Value,
}

/// Latest transaction of one session identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub identity: SessionIdentity,
    pub txn_number: TxnNumber,
    pub kind: TxnKind,
    pub state: TxnState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_op_time: Option<OpTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_ts: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ts: Option<Timestamp>,
    /// Staged by an in-progress multi-statement transaction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_writes: Vec<DocumentWrite>,
    pub updated_at_ms: u64,
}

impl TxnRecord {
    pub fn new(
        identity: SessionIdentity,
        txn_number: TxnNumber,
        kind: TxnKind,
        now_ms: u64,
    ) -> Self {
        Self {
            identity,
            txn_number,
            kind,
            state: TxnState::InProgress,
            last_write_op_time: None,
            prepare_ts: None,
            commit_ts: None,
            pending_writes: Vec::new(),
            updated_at_ms: now_ms,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        TxnId::new(self.identity, self.txn_number)
    }

    /// Highest timestamp this record carries; reseeds the clock on restart.
    pub fn high_timestamp(&self) -> Timestamp {
        [
            self.last_write_op_time.map(|op| op.ts),
            self.prepare_ts,
            self.commit_ts,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(Timestamp::ZERO)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatementKey {
    pub txn: TxnId,
    pub stmt_id: StmtId,
}

impl StatementKey {
    pub fn new(txn: TxnId, stmt_id: StmtId) -> Self {
        Self { txn, stmt_id }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatementRow {
    pub key: StatementKey,
    /// Session-level txn number the statement counts toward in retryable
    /// history. `None` for non-retryable internal transactions.
    pub history_txn_number: Option<TxnNumber>,
    pub request_sha256: [u8; 32],
    pub outcome: OperationOutcome,
    pub op_time: OpTime,
    /// Multi-statement records stay uncommitted until the transaction commits.
    pub committed: bool,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatementInsert {
    Inserted,
    AlreadyPresent(StatementRow),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CommitDecision {
    Commit { commit_ts: Timestamp },
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPhase {
    /// Prepare fan-out started, no decision yet.
    Preparing,
    /// Decision durable, participants not all acknowledged.
    Decided,
    /// Every participant acknowledged the decision.
    Completed,
}

impl DecisionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionPhase::Preparing => "preparing",
            DecisionPhase::Decided => "decided",
            DecisionPhase::Completed => "completed",
        }
    }
}

/// Two-phase commit state kept by the commit coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub txn: TxnId,
    pub participants: Vec<String>,
    pub phase: DecisionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<CommitDecision>,
    pub updated_at_ms: u64,
}

// =============================================================================
// Traits
// =============================================================================

pub trait DocumentRead {
    fn get_document(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError>;
    /// All documents of a namespace, ordered by key.
    fn scan_documents(&self, ns: &Namespace) -> Result<Vec<StoredDocument>, StoreError>;
}

pub trait SessionStore: Send + Sync {
    fn writer(&self) -> Box<dyn SessionStoreWriter>;
    fn reader(&self) -> Box<dyn SessionStoreReader>;
    fn durability(&self) -> StoreDurability;
}

pub trait SessionStoreWriter {
    fn begin_txn(&self) -> Result<Box<dyn SessionStoreTxn>, StoreError>;
}

pub trait SessionStoreTxn: DocumentRead {
    fn ledger_high(&self, session: &SessionId) -> Result<Option<TxnNumber>, StoreError>;
    fn set_ledger_high(&mut self, session: &SessionId, high: TxnNumber)
    -> Result<(), StoreError>;
    /// Drop the ledger row once no transaction record of the session remains.
    fn delete_ledger_if_idle(&mut self, session: &SessionId) -> Result<bool, StoreError>;

    fn load_txn_record(&self, identity: &SessionIdentity)
    -> Result<Option<TxnRecord>, StoreError>;
    fn put_txn_record(&mut self, record: &TxnRecord) -> Result<(), StoreError>;
    fn delete_txn_record(&mut self, identity: &SessionIdentity) -> Result<(), StoreError>;
    /// Every identity's record for `session`, ordered by identity key.
    fn list_session_txn_records(&self, session: &SessionId)
    -> Result<Vec<TxnRecord>, StoreError>;

    fn lookup_statement(&self, key: &StatementKey) -> Result<Option<StatementRow>, StoreError>;
    /// Statements of `(session, txn_number, stmt_id)` across every identity
    /// of the session that participates in retryable history.
    fn lookup_history(
        &self,
        session: &SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Vec<StatementRow>, StoreError>;
    fn insert_statement_if_absent(
        &mut self,
        row: &StatementRow,
    ) -> Result<StatementInsert, StoreError>;
    fn mark_statements_committed(&mut self, txn: &TxnId) -> Result<usize, StoreError>;
    fn delete_statements(&mut self, txn: &TxnId) -> Result<usize, StoreError>;
    fn delete_identity_statements(&mut self, identity: &SessionIdentity)
    -> Result<usize, StoreError>;

    fn apply_document_write(&mut self, write: &DocumentWrite) -> Result<(), StoreError>;

    fn load_decision(&self, txn: &TxnId) -> Result<Option<DecisionRecord>, StoreError>;
    fn put_decision(&mut self, record: &DecisionRecord) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub trait SessionStoreReader: DocumentRead {
    fn ledger_high(&self, session: &SessionId) -> Result<Option<TxnNumber>, StoreError>;
    fn load_txn_record(&self, identity: &SessionIdentity)
    -> Result<Option<TxnRecord>, StoreError>;
    fn lookup_statement(&self, key: &StatementKey) -> Result<Option<StatementRow>, StoreError>;
    /// Records still `InProgress` or `Prepared`.
    fn list_unresolved_txn_records(&self) -> Result<Vec<TxnRecord>, StoreError>;
    /// Terminal records last touched before `updated_before_ms`.
    fn list_expired_txn_records(&self, updated_before_ms: u64)
    -> Result<Vec<TxnRecord>, StoreError>;
    /// Decisions not yet `Completed`.
    fn list_pending_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError>;
    fn load_decision(&self, txn: &TxnId) -> Result<Option<DecisionRecord>, StoreError>;
    /// Highest timestamp persisted anywhere in the store.
    fn max_timestamp(&self) -> Result<Timestamp, StoreError>;
}
