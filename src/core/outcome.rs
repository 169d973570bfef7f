//! Replayable operation outcomes.
//!
//! An outcome is plain data: replay is a lookup, never a re-evaluation.
//! Operation errors (duplicate key, immutable field) are outcomes too.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ErrorCode;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub n: u64,
    pub n_modified: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<Value>,
}

impl WriteResult {
    pub fn inserted() -> Self {
        Self {
            n: 1,
            n_modified: 0,
            upserted_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied(WriteResult),
    Failed(RecordedError),
}

impl OperationOutcome {
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        OperationOutcome::Failed(RecordedError {
            code,
            message: message.into(),
        })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OperationOutcome::Failed(_))
    }

    /// Outcome as reconstructed from another identity's retryable history.
    ///
    /// History keeps which documents a statement matched, not whether the
    /// statement changed them, so a replayed update reports `n_modified: 0`.
    pub fn as_history_replay(&self) -> OperationOutcome {
        match self {
            OperationOutcome::Applied(result) => OperationOutcome::Applied(WriteResult {
                n: result.n,
                n_modified: 0,
                upserted_id: result.upserted_id.clone(),
            }),
            failed => failed.clone(),
        }
    }
}
