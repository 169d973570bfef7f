//! Execution engine boundary.
//!
//! The engine turns one `WriteOp` into an `OperationOutcome` plus the
//! document writes that realize it. It never writes to storage itself: the
//! caller applies `writes` in the same store txn that records the statement.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::{Namespace, OperationOutcome, WriteOp};
use crate::store::{DocumentRead, DocumentWrite, StoreError, StoredDocument};

mod document;

pub use document::DocumentEngine;

#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    pub outcome: OperationOutcome,
    /// Empty when the outcome is `Failed`.
    pub writes: Vec<DocumentWrite>,
}

impl Applied {
    pub fn failed(outcome: OperationOutcome) -> Self {
        Self {
            outcome,
            writes: Vec::new(),
        }
    }
}

pub trait ExecutionEngine: Send + Sync {
    /// Operation-level failures (duplicate key, immutable field) come back as
    /// a `Failed` outcome; `Err` is reserved for storage faults.
    fn apply(&self, docs: &dyn DocumentRead, op: &WriteOp) -> Result<Applied, StoreError>;
}

/// Committed documents with a transaction's staged writes layered on top.
pub struct StagedDocuments<'a> {
    base: &'a dyn DocumentRead,
    staged: &'a [DocumentWrite],
}

impl<'a> StagedDocuments<'a> {
    pub fn new(base: &'a dyn DocumentRead, staged: &'a [DocumentWrite]) -> Self {
        Self { base, staged }
    }
}

impl DocumentRead for StagedDocuments<'_> {
    fn get_document(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        let latest = self
            .staged
            .iter()
            .rev()
            .find(|write| write.ns() == ns && write.key() == key);
        match latest {
            Some(DocumentWrite::Put { body, .. }) => Ok(Some(body.clone())),
            Some(DocumentWrite::Delete { .. }) => Ok(None),
            None => self.base.get_document(ns, key),
        }
    }

    fn scan_documents(&self, ns: &Namespace) -> Result<Vec<StoredDocument>, StoreError> {
        let mut merged: BTreeMap<String, Value> = self
            .base
            .scan_documents(ns)?
            .into_iter()
            .map(|doc| (doc.key, doc.body))
            .collect();
        for write in self.staged.iter().filter(|write| write.ns() == ns) {
            match write {
                DocumentWrite::Put { body, .. } => {
                    merged.insert(write.key(), body.clone());
                }
                DocumentWrite::Delete { .. } => {
                    merged.remove(&write.key());
                }
            }
        }
        Ok(merged
            .into_iter()
            .map(|(key, body)| StoredDocument { key, body })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySessionStore, SessionStore};
    use serde_json::json;

    #[test]
    fn staged_writes_shadow_committed_documents() {
        let store = MemorySessionStore::new();
        let ns = Namespace::parse("test.c").unwrap();
        let mut tx = store.writer().begin_txn().unwrap();
        for id in [1, 2] {
            tx.apply_document_write(&DocumentWrite::Put {
                ns: ns.clone(),
                id: json!(id),
                body: json!({"_id": id, "v": "base"}),
            })
            .unwrap();
        }
        let staged = vec![
            DocumentWrite::Put {
                ns: ns.clone(),
                id: json!(1),
                body: json!({"_id": 1, "v": "staged"}),
            },
            DocumentWrite::Delete {
                ns: ns.clone(),
                id: json!(2),
            },
            DocumentWrite::Put {
                ns: ns.clone(),
                id: json!(3),
                body: json!({"_id": 3}),
            },
        ];
        let view = StagedDocuments::new(&*tx, &staged);
        assert_eq!(
            view.get_document(&ns, &crate::core::canon_key(&json!(1)))
                .unwrap(),
            Some(json!({"_id": 1, "v": "staged"}))
        );
        assert_eq!(
            view.get_document(&ns, &crate::core::canon_key(&json!(2)))
                .unwrap(),
            None
        );
        let keys: Vec<String> = view
            .scan_documents(&ns)
            .unwrap()
            .into_iter()
            .map(|doc| doc.key)
            .collect();
        assert_eq!(keys, vec!["1".to_string(), "3".to_string()]);
        tx.rollback().unwrap();
    }
}
