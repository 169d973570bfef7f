//! Core capability errors and protocol error codes.
//!
//! Core errors are input/validation refusals. `ErrorCode` is the stable set of
//! codes surfaced to callers, including the codes recorded inside replayable
//! operation outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("session id `{raw}` is invalid: {reason}")]
    Session { raw: String, reason: String },
    #[error("txn uuid `{raw}` is invalid: {reason}")]
    TxnUuid { raw: String, reason: String },
    #[error("txn number `{raw}` is invalid: {reason}")]
    TxnNumber { raw: String, reason: String },
    #[error("session identity `{raw}` is invalid: {reason}")]
    SessionIdentity { raw: String, reason: String },
    #[error("namespace `{raw}` is invalid: {reason}")]
    Namespace { raw: String, reason: String },
}

/// Malformed operation payload.
#[derive(Debug, Error, Clone)]
#[error("invalid operation: {reason}")]
pub struct InvalidOperation {
    pub reason: String,
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    InvalidOperation(#[from] InvalidOperation),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

// =============================================================================
// Protocol error codes + labels
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorCode {
    // Session / transaction protocol
    TransactionTooOld,
    NoSuchTransaction,
    TransactionCommitted,
    PreparedTransactionInProgress,
    ConflictingOperationInProgress,
    ConflictingOperationReplay,
    InvalidOptions,
    ExceededTimeLimit,
    Interrupted,

    // Operation outcomes recorded and replayed verbatim
    DuplicateKey,
    ImmutableField,
    BadValue,
    FailedToParse,

    // Request / infrastructure
    InvalidRequest,
    StorageError,
    ParticipantUnavailable,
    Internal,
}

impl ErrorCode {
    /// Numeric code on the wire. Protocol-internal codes have none.
    pub fn wire_code(self) -> Option<i32> {
        match self {
            ErrorCode::TransactionTooOld => Some(225),
            ErrorCode::NoSuchTransaction => Some(251),
            ErrorCode::TransactionCommitted => Some(256),
            ErrorCode::PreparedTransactionInProgress => Some(267),
            ErrorCode::ConflictingOperationInProgress => Some(117),
            ErrorCode::InvalidOptions => Some(72),
            ErrorCode::ExceededTimeLimit => Some(262),
            ErrorCode::Interrupted => Some(11601),
            ErrorCode::DuplicateKey => Some(11000),
            ErrorCode::ImmutableField => Some(66),
            ErrorCode::BadValue => Some(2),
            ErrorCode::FailedToParse => Some(9),
            ErrorCode::ConflictingOperationReplay
            | ErrorCode::InvalidRequest
            | ErrorCode::StorageError
            | ErrorCode::ParticipantUnavailable
            | ErrorCode::Internal => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TransactionTooOld => "TransactionTooOld",
            ErrorCode::NoSuchTransaction => "NoSuchTransaction",
            ErrorCode::TransactionCommitted => "TransactionCommitted",
            ErrorCode::PreparedTransactionInProgress => "PreparedTransactionInProgress",
            ErrorCode::ConflictingOperationInProgress => "ConflictingOperationInProgress",
            ErrorCode::ConflictingOperationReplay => "ConflictingOperationReplay",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::ExceededTimeLimit => "ExceededTimeLimit",
            ErrorCode::Interrupted => "Interrupted",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::ImmutableField => "ImmutableField",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::StorageError => "StorageError",
            ErrorCode::ParticipantUnavailable => "ParticipantUnavailable",
            ErrorCode::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels attached to errors telling the client how to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorLabel {
    /// The whole transaction may be retried from the start.
    TransientTransactionError,
    /// The commit may or may not have happened; retry the commit itself.
    UnknownTransactionCommitResult,
}

impl ErrorLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorLabel::TransientTransactionError => "TransientTransactionError",
            ErrorLabel::UnknownTransactionCommitResult => "UnknownTransactionCommitResult",
        }
    }
}
