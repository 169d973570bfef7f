//! Write builders and identity helpers.

use serde_json::{Value, json};
use uuid::Uuid;

use rtxn::api::SessionFields;
use rtxn::core::{Namespace, SessionId, SessionIdentity, TxnId, TxnNumber, TxnUuid, WriteOp};

pub fn session(byte: u8) -> SessionId {
    SessionId::new(Uuid::from_bytes([byte; 16]))
}

pub fn txn_uuid(byte: u8) -> TxnUuid {
    TxnUuid::new(Uuid::from_bytes([byte; 16]))
}

pub fn n(value: u64) -> TxnNumber {
    TxnNumber::new(value).expect("txn number")
}

pub fn ns() -> Namespace {
    Namespace::parse("app.items").expect("namespace")
}

pub fn parent(session_id: SessionId, txn_number: u64) -> SessionFields {
    SessionFields::parent(session_id, Some(n(txn_number)))
}

pub fn child(identity: SessionIdentity, txn_number: u64) -> SessionFields {
    SessionFields::for_identity(identity, Some(n(txn_number)))
}

pub fn txn_id(identity: SessionIdentity, txn_number: u64) -> TxnId {
    TxnId::new(identity, n(txn_number))
}

pub fn insert(document: Value) -> WriteOp {
    WriteOp::Insert {
        ns: ns(),
        document,
    }
}

pub fn inc(id: i64, field: &str) -> WriteOp {
    WriteOp::Update {
        ns: ns(),
        filter: json!({ "_id": id }),
        update: json!({ "$inc": { field: 1 } }),
        upsert: false,
        multi: false,
    }
}

pub fn upsert_inc(id: i64, field: &str) -> WriteOp {
    WriteOp::Update {
        ns: ns(),
        filter: json!({ "_id": id }),
        update: json!({ "$inc": { field: 1 } }),
        upsert: true,
        multi: false,
    }
}
