//! In-memory session store.
//!
//! A txn works on a clone of the whole state and swaps it in on commit.
//! Writers are serialized by a spin gate, readers see the last committed state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::core::{Namespace, SessionId, SessionIdentity, StmtId, Timestamp, TxnId, TxnNumber};

use super::{
    DecisionPhase, DecisionRecord, DocumentRead, DocumentWrite, SessionStore, SessionStoreReader,
    SessionStoreTxn, SessionStoreWriter, StatementInsert, StatementKey, StatementRow,
    StoreDurability, StoreError, StoredDocument, TxnRecord, TxnState,
};

#[derive(Clone, Default)]
struct MemoryStoreState {
    version: u64,
    ledger: BTreeMap<SessionId, TxnNumber>,
    txn_records: BTreeMap<SessionIdentity, TxnRecord>,
    statements: BTreeMap<StatementKey, StatementRow>,
    documents: BTreeMap<(Namespace, String), Value>,
    decisions: BTreeMap<TxnId, DecisionRecord>,
}

impl MemoryStoreState {
    fn get_document(&self, ns: &Namespace, key: &str) -> Option<Value> {
        self.documents.get(&(ns.clone(), key.to_string())).cloned()
    }

    fn scan_documents(&self, ns: &Namespace) -> Vec<StoredDocument> {
        self.documents
            .iter()
            .filter(|((doc_ns, _), _)| doc_ns == ns)
            .map(|((_, key), body)| StoredDocument {
                key: key.clone(),
                body: body.clone(),
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct MemorySessionStore {
    state: Arc<RwLock<MemoryStoreState>>,
    txn_gate: Arc<AtomicBool>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryStoreState::default())),
            txn_gate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of committed store txns so far.
    pub fn version(&self) -> u64 {
        self.state
            .read()
            .expect("memory session store lock poisoned")
            .version
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    fn writer(&self) -> Box<dyn SessionStoreWriter> {
        Box::new(MemorySessionStoreWriter {
            state: Arc::clone(&self.state),
            txn_gate: Arc::clone(&self.txn_gate),
        })
    }

    fn reader(&self) -> Box<dyn SessionStoreReader> {
        Box::new(MemorySessionStoreReader {
            state: Arc::clone(&self.state),
        })
    }

    fn durability(&self) -> StoreDurability {
        StoreDurability::Cache
    }
}

struct MemorySessionStoreWriter {
    state: Arc<RwLock<MemoryStoreState>>,
    txn_gate: Arc<AtomicBool>,
}

impl SessionStoreWriter for MemorySessionStoreWriter {
    fn begin_txn(&self) -> Result<Box<dyn SessionStoreTxn>, StoreError> {
        acquire_gate(&self.txn_gate);
        let working = self
            .state
            .read()
            .expect("memory session store lock poisoned")
            .clone();
        Ok(Box::new(MemorySessionStoreTxn {
            state: Arc::clone(&self.state),
            txn_gate: Arc::clone(&self.txn_gate),
            working,
            finished: false,
        }))
    }
}

struct MemorySessionStoreTxn {
    state: Arc<RwLock<MemoryStoreState>>,
    txn_gate: Arc<AtomicBool>,
    working: MemoryStoreState,
    finished: bool,
}

impl MemorySessionStoreTxn {
    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TxnFinished);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.finished = true;
        self.txn_gate.store(false, Ordering::Release);
    }
}

impl DocumentRead for MemorySessionStoreTxn {
    fn get_document(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_live()?;
        Ok(self.working.get_document(ns, key))
    }

    fn scan_documents(&self, ns: &Namespace) -> Result<Vec<StoredDocument>, StoreError> {
        self.ensure_live()?;
        Ok(self.working.scan_documents(ns))
    }
}

impl SessionStoreTxn for MemorySessionStoreTxn {
    fn ledger_high(&self, session: &SessionId) -> Result<Option<TxnNumber>, StoreError> {
        self.ensure_live()?;
        Ok(self.working.ledger.get(session).copied())
    }

    fn set_ledger_high(
        &mut self,
        session: &SessionId,
        high: TxnNumber,
    ) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.working.ledger.insert(*session, high);
        Ok(())
    }

    fn delete_ledger_if_idle(&mut self, session: &SessionId) -> Result<bool, StoreError> {
        self.ensure_live()?;
        let busy = self
            .working
            .txn_records
            .keys()
            .any(|identity| identity.session_id == *session);
        if busy {
            return Ok(false);
        }
        Ok(self.working.ledger.remove(session).is_some())
    }

    fn load_txn_record(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Option<TxnRecord>, StoreError> {
        self.ensure_live()?;
        Ok(self.working.txn_records.get(identity).cloned())
    }

    fn put_txn_record(&mut self, record: &TxnRecord) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.working
            .txn_records
            .insert(record.identity, record.clone());
        Ok(())
    }

    fn delete_txn_record(&mut self, identity: &SessionIdentity) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.working.txn_records.remove(identity);
        Ok(())
    }

    fn list_session_txn_records(
        &self,
        session: &SessionId,
    ) -> Result<Vec<TxnRecord>, StoreError> {
        self.ensure_live()?;
        let mut rows: Vec<TxnRecord> = self
            .working
            .txn_records
            .values()
            .filter(|record| record.identity.session_id == *session)
            .cloned()
            .collect();
        rows.sort_by_key(|record| record.identity.key());
        Ok(rows)
    }

    fn lookup_statement(&self, key: &StatementKey) -> Result<Option<StatementRow>, StoreError> {
        self.ensure_live()?;
        Ok(self.working.statements.get(key).cloned())
    }

    fn lookup_history(
        &self,
        session: &SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Vec<StatementRow>, StoreError> {
        self.ensure_live()?;
        let mut rows: Vec<StatementRow> = self
            .working
            .statements
            .values()
            .filter(|row| {
                row.key.txn.identity.session_id == *session
                    && row.history_txn_number == Some(txn_number)
                    && row.key.stmt_id == stmt_id
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.key.txn.identity.key().cmp(&b.key.txn.identity.key()))
        });
        Ok(rows)
    }

    fn insert_statement_if_absent(
        &mut self,
        row: &StatementRow,
    ) -> Result<StatementInsert, StoreError> {
        self.ensure_live()?;
        if let Some(existing) = self.working.statements.get(&row.key) {
            return Ok(StatementInsert::AlreadyPresent(existing.clone()));
        }
        self.working.statements.insert(row.key, row.clone());
        Ok(StatementInsert::Inserted)
    }

    fn mark_statements_committed(&mut self, txn: &TxnId) -> Result<usize, StoreError> {
        self.ensure_live()?;
        let mut updated = 0;
        for row in self
            .working
            .statements
            .values_mut()
            .filter(|row| row.key.txn == *txn)
        {
            row.committed = true;
            updated += 1;
        }
        Ok(updated)
    }

    fn delete_statements(&mut self, txn: &TxnId) -> Result<usize, StoreError> {
        self.ensure_live()?;
        let before = self.working.statements.len();
        self.working.statements.retain(|key, _| key.txn != *txn);
        Ok(before - self.working.statements.len())
    }

    fn delete_identity_statements(
        &mut self,
        identity: &SessionIdentity,
    ) -> Result<usize, StoreError> {
        self.ensure_live()?;
        let before = self.working.statements.len();
        self.working
            .statements
            .retain(|key, _| key.txn.identity != *identity);
        Ok(before - self.working.statements.len())
    }

    fn apply_document_write(&mut self, write: &DocumentWrite) -> Result<(), StoreError> {
        self.ensure_live()?;
        let key = (write.ns().clone(), write.key());
        match write {
            DocumentWrite::Put { body, .. } => {
                self.working.documents.insert(key, body.clone());
            }
            DocumentWrite::Delete { .. } => {
                self.working.documents.remove(&key);
            }
        }
        Ok(())
    }

    fn load_decision(&self, txn: &TxnId) -> Result<Option<DecisionRecord>, StoreError> {
        self.ensure_live()?;
        Ok(self.working.decisions.get(txn).cloned())
    }

    fn put_decision(&mut self, record: &DecisionRecord) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.working.decisions.insert(record.txn, record.clone());
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.finished {
            return Ok(());
        }
        let mut guard = self
            .state
            .write()
            .expect("memory session store lock poisoned");
        let mut working = std::mem::take(&mut self.working);
        working.version = guard.version.wrapping_add(1);
        *guard = working;
        drop(guard);
        self.release();
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.finished {
            return Ok(());
        }
        self.release();
        Ok(())
    }
}

impl Drop for MemorySessionStoreTxn {
    fn drop(&mut self) {
        if !self.finished {
            self.txn_gate.store(false, Ordering::Release);
        }
    }
}

fn acquire_gate(gate: &Arc<AtomicBool>) {
    let mut backoff = std::time::Duration::from_micros(50);
    while gate
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        std::thread::sleep(backoff);
        backoff = std::cmp::min(
            backoff.saturating_mul(2),
            std::time::Duration::from_millis(5),
        );
    }
}

struct MemorySessionStoreReader {
    state: Arc<RwLock<MemoryStoreState>>,
}

impl MemorySessionStoreReader {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&MemoryStoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self
            .state
            .read()
            .expect("memory session store lock poisoned");
        f(&guard)
    }
}

impl DocumentRead for MemorySessionStoreReader {
    fn get_document(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_state(|state| Ok(state.get_document(ns, key)))
    }

    fn scan_documents(&self, ns: &Namespace) -> Result<Vec<StoredDocument>, StoreError> {
        self.with_state(|state| Ok(state.scan_documents(ns)))
    }
}

impl SessionStoreReader for MemorySessionStoreReader {
    fn ledger_high(&self, session: &SessionId) -> Result<Option<TxnNumber>, StoreError> {
        self.with_state(|state| Ok(state.ledger.get(session).copied()))
    }

    fn load_txn_record(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Option<TxnRecord>, StoreError> {
        self.with_state(|state| Ok(state.txn_records.get(identity).cloned()))
    }

    fn lookup_statement(&self, key: &StatementKey) -> Result<Option<StatementRow>, StoreError> {
        self.with_state(|state| Ok(state.statements.get(key).cloned()))
    }

    fn list_unresolved_txn_records(&self) -> Result<Vec<TxnRecord>, StoreError> {
        self.with_state(|state| {
            let mut rows: Vec<TxnRecord> = state
                .txn_records
                .values()
                .filter(|record| !record.state.is_terminal())
                .cloned()
                .collect();
            sort_records(&mut rows);
            Ok(rows)
        })
    }

    fn list_expired_txn_records(
        &self,
        updated_before_ms: u64,
    ) -> Result<Vec<TxnRecord>, StoreError> {
        self.with_state(|state| {
            let mut rows: Vec<TxnRecord> = state
                .txn_records
                .values()
                .filter(|record| {
                    matches!(record.state, TxnState::Committed | TxnState::Aborted)
                        && record.updated_at_ms < updated_before_ms
                })
                .cloned()
                .collect();
            sort_records(&mut rows);
            Ok(rows)
        })
    }

    fn list_pending_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError> {
        self.with_state(|state| {
            let mut rows: Vec<DecisionRecord> = state
                .decisions
                .values()
                .filter(|record| record.phase != DecisionPhase::Completed)
                .cloned()
                .collect();
            rows.sort_by(|a, b| {
                a.updated_at_ms
                    .cmp(&b.updated_at_ms)
                    .then_with(|| a.txn.cmp(&b.txn))
            });
            Ok(rows)
        })
    }

    fn load_decision(&self, txn: &TxnId) -> Result<Option<DecisionRecord>, StoreError> {
        self.with_state(|state| Ok(state.decisions.get(txn).cloned()))
    }

    fn max_timestamp(&self) -> Result<Timestamp, StoreError> {
        self.with_state(|state| {
            let from_statements = state
                .statements
                .values()
                .map(|row| row.op_time.ts)
                .max()
                .unwrap_or(Timestamp::ZERO);
            let from_records = state
                .txn_records
                .values()
                .map(TxnRecord::high_timestamp)
                .max()
                .unwrap_or(Timestamp::ZERO);
            Ok(from_statements.max(from_records))
        })
    }
}

fn sort_records(rows: &mut [TxnRecord]) {
    rows.sort_by(|a, b| {
        a.updated_at_ms
            .cmp(&b.updated_at_ms)
            .then_with(|| a.identity.key().cmp(&b.identity.key()))
    });
}
