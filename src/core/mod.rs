//! Core domain types: identities, operations, outcomes, clock.

pub mod error;
pub mod identity;
pub mod json_canon;
pub mod op;
pub mod outcome;
pub mod time;

pub use error::{CoreError, ErrorCode, ErrorLabel, InvalidId, InvalidOperation};
pub use identity::{ChildLink, SessionId, SessionIdentity, StmtId, TxnId, TxnNumber, TxnUuid};
pub use json_canon::{CanonJsonError, canon_key, fingerprint, hex32, to_canon_json_bytes};
pub use op::{Namespace, WriteOp};
pub use outcome::{OperationOutcome, RecordedError, WriteResult};
pub use time::{Clock, OpTime, Timestamp, now_ms};
