//! Protocol errors surfaced to clients.

use thiserror::Error;

use crate::core::{
    CanonJsonError, CoreError, ErrorCode, ErrorLabel, SessionId, StmtId, TxnId, TxnNumber, hex32,
};
use crate::error::{Effect, Transience};
use crate::store::StoreError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TxnError {
    #[error(
        "txn number {requested} for session {session_id} is older than the highest seen ({highest})"
    )]
    TransactionTooOld {
        session_id: SessionId,
        requested: TxnNumber,
        highest: TxnNumber,
    },
    #[error("no such transaction {txn}: {reason}")]
    NoSuchTransaction { txn: TxnId, reason: String },
    #[error("transaction {txn} has already been committed")]
    TransactionCommitted { txn: TxnId },
    #[error("transaction {txn} is prepared")]
    PreparedTransactionInProgress { txn: TxnId },
    #[error("conflicting operation on {txn}: {reason}")]
    ConflictingOperationInProgress { txn: TxnId, reason: String },
    #[error(
        "statement {stmt_id} of {txn} was replayed with a different payload (recorded {}, got {})",
        hex32(.expected_sha256),
        hex32(.got_sha256)
    )]
    ConflictingOperationReplay {
        txn: TxnId,
        stmt_id: StmtId,
        expected_sha256: [u8; 32],
        got_sha256: [u8; 32],
    },
    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("{phase} of {txn} exceeded its time limit")]
    ExceededTimeLimit { txn: TxnId, phase: &'static str },
    #[error("{phase} of {txn} was interrupted")]
    Interrupted {
        txn: TxnId,
        phase: &'static str,
        decided: bool,
    },
    #[error("participant {participant} unavailable: {reason}")]
    ParticipantUnavailable { participant: String, reason: String },
    #[error("unknown participant {participant}")]
    UnknownParticipant { participant: String },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("statement fingerprint failed: {0}")]
    Fingerprint(#[from] CanonJsonError),
}

impl TxnError {
    pub fn no_such_transaction(txn: TxnId, reason: impl Into<String>) -> Self {
        TxnError::NoSuchTransaction {
            txn,
            reason: reason.into(),
        }
    }

    pub fn conflicting(txn: TxnId, reason: impl Into<String>) -> Self {
        TxnError::ConflictingOperationInProgress {
            txn,
            reason: reason.into(),
        }
    }

    pub fn invalid_options(reason: impl Into<String>) -> Self {
        TxnError::InvalidOptions {
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        TxnError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            TxnError::TransactionTooOld { .. } => ErrorCode::TransactionTooOld,
            TxnError::NoSuchTransaction { .. } => ErrorCode::NoSuchTransaction,
            TxnError::TransactionCommitted { .. } => ErrorCode::TransactionCommitted,
            TxnError::PreparedTransactionInProgress { .. } => {
                ErrorCode::PreparedTransactionInProgress
            }
            TxnError::ConflictingOperationInProgress { .. } => {
                ErrorCode::ConflictingOperationInProgress
            }
            TxnError::ConflictingOperationReplay { .. } => ErrorCode::ConflictingOperationReplay,
            TxnError::InvalidOptions { .. } => ErrorCode::InvalidOptions,
            TxnError::InvalidRequest { .. } | TxnError::Core(_) => ErrorCode::InvalidRequest,
            TxnError::ExceededTimeLimit { .. } => ErrorCode::ExceededTimeLimit,
            TxnError::Interrupted { .. } => ErrorCode::Interrupted,
            TxnError::ParticipantUnavailable { .. } | TxnError::UnknownParticipant { .. } => {
                ErrorCode::ParticipantUnavailable
            }
            TxnError::Store(_) => ErrorCode::StorageError,
            TxnError::Fingerprint(_) => ErrorCode::Internal,
        }
    }

    /// Retry guidance for the client.
    pub fn labels(&self) -> Vec<ErrorLabel> {
        match self {
            TxnError::NoSuchTransaction { .. } => vec![ErrorLabel::TransientTransactionError],
            TxnError::ExceededTimeLimit { .. } => {
                vec![ErrorLabel::UnknownTransactionCommitResult]
            }
            TxnError::Interrupted { decided: true, .. } => {
                vec![ErrorLabel::UnknownTransactionCommitResult]
            }
            TxnError::Store(err) if err.transience().is_retryable() => {
                vec![ErrorLabel::TransientTransactionError]
            }
            _ => Vec::new(),
        }
    }

    pub fn has_label(&self, label: ErrorLabel) -> bool {
        self.labels().contains(&label)
    }

    pub fn transience(&self) -> Transience {
        match self {
            TxnError::ParticipantUnavailable { .. } => Transience::Retryable,
            TxnError::ExceededTimeLimit { .. } | TxnError::Interrupted { .. } => {
                Transience::Unknown
            }
            TxnError::Store(err) => err.transience(),
            TxnError::Core(err) => err.transience(),
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            TxnError::ExceededTimeLimit { .. } => Effect::Unknown,
            TxnError::Interrupted { decided, .. } => {
                if *decided {
                    Effect::Unknown
                } else {
                    Effect::None
                }
            }
            TxnError::ParticipantUnavailable { .. } => Effect::Unknown,
            TxnError::Store(err) => err.effect(),
            _ => Effect::None,
        }
    }
}
