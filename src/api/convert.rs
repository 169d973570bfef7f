use crate::api::{ErrorReply, WriteError};
use crate::coordinator::TxnError;
use crate::core::RecordedError;

impl From<&TxnError> for ErrorReply {
    fn from(err: &TxnError) -> Self {
        let code = err.code();
        Self {
            code: code.wire_code(),
            code_name: code,
            errmsg: err.to_string(),
            error_labels: err.labels(),
        }
    }
}

impl From<TxnError> for ErrorReply {
    fn from(err: TxnError) -> Self {
        ErrorReply::from(&err)
    }
}

impl WriteError {
    pub fn from_recorded(index: usize, recorded: &RecordedError) -> Self {
        Self {
            index,
            code: recorded.code.wire_code(),
            code_name: recorded.code,
            errmsg: recorded.message.clone(),
        }
    }
}
