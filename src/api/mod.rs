//! Wire schemas for write and transaction-control requests.
//!
//! Field names follow the client protocol (`camelCase`). Everything here is
//! plain data; the coordinators in `retry` and `coordinator` interpret it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{
    CoreError, ErrorCode, ErrorLabel, SessionId, SessionIdentity, StmtId, Timestamp, TxnId,
    TxnNumber, TxnUuid, WriteOp,
};

mod convert;

// =============================================================================
// Session fields
// =============================================================================

/// Session fields shared by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFields {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<TxnNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_txn_number: Option<TxnNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_txn_uuid: Option<TxnUuid>,
}

impl SessionFields {
    pub fn parent(session_id: SessionId, txn_number: Option<TxnNumber>) -> Self {
        Self {
            session_id,
            txn_number,
            parent_txn_number: None,
            child_txn_uuid: None,
        }
    }

    pub fn for_identity(identity: SessionIdentity, txn_number: Option<TxnNumber>) -> Self {
        Self {
            session_id: identity.session_id,
            txn_number,
            parent_txn_number: identity.parent_txn_number(),
            child_txn_uuid: identity.txn_uuid(),
        }
    }

    pub fn identity(&self) -> Result<SessionIdentity, CoreError> {
        SessionIdentity::from_parts(self.session_id, self.parent_txn_number, self.child_txn_uuid)
    }
}

// =============================================================================
// Writes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    #[serde(flatten)]
    pub session: SessionFields,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub start_transaction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocommit: Option<bool>,
    /// Stop at the first failed statement.
    #[serde(default = "default_ordered")]
    pub ordered: bool,
    pub statements: Vec<Statement>,
}

fn default_ordered() -> bool {
    true
}

impl WriteRequest {
    /// Retryable write of `statements` with ids `0..n`.
    pub fn retryable(session: SessionFields, ops: impl IntoIterator<Item = WriteOp>) -> Self {
        Self {
            session,
            start_transaction: false,
            autocommit: None,
            ordered: true,
            statements: ops.into_iter().map(Statement::new).collect(),
        }
    }

    /// Statement of a multi-statement transaction; `start` marks the first.
    pub fn in_transaction(
        session: SessionFields,
        start: bool,
        ops: impl IntoIterator<Item = WriteOp>,
    ) -> Self {
        Self {
            session,
            start_transaction: start,
            autocommit: Some(false),
            ordered: true,
            statements: ops.into_iter().map(Statement::new).collect(),
        }
    }

    pub fn with_stmt_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        for (statement, id) in self.statements.iter_mut().zip(ids) {
            statement.stmt_id = Some(StmtId::new(id));
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    /// Defaults to the statement's index in the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stmt_id: Option<StmtId>,
    #[serde(flatten)]
    pub op: WriteOp,
}

impl Statement {
    pub fn new(op: WriteOp) -> Self {
        Self { stmt_id: None, op }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    pub n: u64,
    pub n_modified: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upserted: Vec<Upserted>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_errors: Vec<WriteError>,
    /// Statements answered from recorded outcomes instead of executing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retried_stmt_ids: Vec<StmtId>,
}

impl WriteResponse {
    pub fn is_ok(&self) -> bool {
        self.write_errors.is_empty()
    }

    /// Response fields a client compares across retries.
    pub fn without_retry_info(&self) -> WriteResponse {
        WriteResponse {
            retried_stmt_ids: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upserted {
    pub index: usize,
    #[serde(rename = "_id")]
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteError {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub code_name: ErrorCode,
    pub errmsg: String,
}

// =============================================================================
// Transaction control
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxnControlRequest {
    #[serde(flatten)]
    pub session: SessionFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<Timestamp>,
}

impl TxnControlRequest {
    pub fn new(session: SessionFields) -> Self {
        Self {
            session,
            commit_timestamp: None,
        }
    }

    pub fn txn_id(&self) -> Result<TxnId, CoreError> {
        let identity = self.session.identity()?;
        let txn_number = self.session.txn_number.ok_or_else(|| {
            crate::core::InvalidOperation {
                reason: "transaction control requires txnNumber".into(),
            }
        })?;
        Ok(TxnId::new(identity, txn_number))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxnControlResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

// =============================================================================
// Errors
// =============================================================================

/// Command-level error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub code_name: ErrorCode,
    pub errmsg: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_labels: Vec<ErrorLabel>,
}
