//! A coordinator stack over a memory or sqlite session store.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};

use rtxn::coordinator::{CoordinatorOptions, TxnError};
use rtxn::core::{SessionIdentity, Timestamp, canon_key};
use rtxn::engine::DocumentEngine;
use rtxn::retry::{RetryCoordinator, RetryOptions};
use rtxn::store::{
    DocumentRead, MemorySessionStore, SessionStore, SqliteSessionStore, StoreDurability,
};

use super::ops::{ns, txn_id};

pub struct Rig {
    pub retry: RetryCoordinator,
    pub store: Arc<dyn SessionStore>,
}

impl Rig {
    pub fn memory() -> Self {
        Self::over(Arc::new(MemorySessionStore::new()))
    }

    /// Opens (or reopens) a durable store in `dir`. Recovery is left to the caller.
    pub fn sqlite(dir: &Path) -> Self {
        let store = SqliteSessionStore::open(dir, StoreDurability::Durable).expect("open store");
        Self::over(Arc::new(store))
    }

    pub fn over(store: Arc<dyn SessionStore>) -> Self {
        let retry = RetryCoordinator::open(
            store.clone(),
            Arc::new(DocumentEngine::new()),
            CoordinatorOptions::default(),
            RetryOptions::default(),
        );
        Self { retry, store }
    }

    pub fn doc(&self, id: i64) -> Option<Value> {
        self.store
            .reader()
            .get_document(&ns(), &canon_key(&json!(id)))
            .expect("read document")
    }

    pub fn field(&self, id: i64, field: &str) -> Option<i64> {
        self.doc(id)
            .and_then(|doc| doc.get(field).and_then(Value::as_i64))
    }

    pub fn doc_count(&self) -> usize {
        self.store
            .reader()
            .scan_documents(&ns())
            .expect("scan documents")
            .len()
    }

    pub fn commit(&self, identity: SessionIdentity, txn_number: u64) -> Result<Timestamp, TxnError> {
        self.retry
            .commit_transaction(&txn_id(identity, txn_number), None)
    }
}
