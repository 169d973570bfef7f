//! SQLite-backed session store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{
    Namespace, OpTime, SessionId, SessionIdentity, StmtId, Timestamp, TxnId, TxnNumber,
};

use super::{
    DecisionPhase, DecisionRecord, DocumentRead, DocumentWrite, STORE_SCHEMA_VERSION,
    SessionStore, SessionStoreReader, SessionStoreTxn, SessionStoreWriter, StatementInsert,
    StatementKey, StatementRow, StoreDurability, StoreError, StoredDocument, TxnRecord, TxnState,
};

const DB_FILE: &str = "sessions.sqlite";
const BUSY_TIMEOUT_MS: u64 = 5_000;
const CACHE_SIZE_KB: i64 = -16_000;

const STATEMENT_COLUMNS: &str = "identity_key, txn_number, stmt_id, history_txn_number, \
     request_sha256, outcome, op_term, op_wall_ms, op_counter, committed, created_at_ms";

impl StoreDurability {
    fn synchronous_value(self) -> &'static str {
        match self {
            StoreDurability::Cache => "NORMAL",
            StoreDurability::Durable => "FULL",
        }
    }
}

pub struct SqliteSessionStore {
    db_path: PathBuf,
    durability: StoreDurability,
}

impl SqliteSessionStore {
    /// Open (or create) the store under `store_dir`.
    pub fn open(store_dir: &Path, durability: StoreDurability) -> Result<Self, StoreError> {
        reject_symlink(store_dir)?;
        std::fs::create_dir_all(store_dir).map_err(|source| StoreError::Io {
            path: store_dir.to_path_buf(),
            source,
        })?;
        let db_path = store_dir.join(DB_FILE);
        reject_symlink(&db_path)?;

        let conn = open_connection(&db_path, durability, true)?;
        if table_exists(&conn, "meta")? {
            validate_meta(&conn)?;
        } else {
            initialize_schema(&conn)?;
            write_meta(&conn)?;
        }
        ensure_permissions(&db_path)?;
        drop(conn);

        tracing::debug!(path = %db_path.display(), durability = durability.as_str(), "session store opened");
        Ok(Self {
            db_path,
            durability,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl SessionStore for SqliteSessionStore {
    fn writer(&self) -> Box<dyn SessionStoreWriter> {
        Box::new(SqliteSessionStoreWriter {
            db_path: self.db_path.clone(),
            durability: self.durability,
        })
    }

    fn reader(&self) -> Box<dyn SessionStoreReader> {
        Box::new(SqliteSessionStoreReader {
            db_path: self.db_path.clone(),
            durability: self.durability,
        })
    }

    fn durability(&self) -> StoreDurability {
        self.durability
    }
}

struct SqliteSessionStoreWriter {
    db_path: PathBuf,
    durability: StoreDurability,
}

impl SessionStoreWriter for SqliteSessionStoreWriter {
    fn begin_txn(&self) -> Result<Box<dyn SessionStoreTxn>, StoreError> {
        let conn = open_connection(&self.db_path, self.durability, false)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteSessionStoreTxn {
            conn,
            finished: false,
        }))
    }
}

struct SqliteSessionStoreTxn {
    conn: Connection,
    finished: bool,
}

impl DocumentRead for SqliteSessionStoreTxn {
    fn get_document(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        get_document(&self.conn, ns, key)
    }

    fn scan_documents(&self, ns: &Namespace) -> Result<Vec<StoredDocument>, StoreError> {
        scan_documents(&self.conn, ns)
    }
}

impl SessionStoreTxn for SqliteSessionStoreTxn {
    fn ledger_high(&self, session: &SessionId) -> Result<Option<TxnNumber>, StoreError> {
        ledger_high(&self.conn, session)
    }

    fn set_ledger_high(
        &mut self,
        session: &SessionId,
        high: TxnNumber,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO session_ledger (session_id, high_txn_number) VALUES (?1, ?2) \
             ON CONFLICT(session_id) DO UPDATE SET high_txn_number = excluded.high_txn_number",
            params![uuid_blob(session.as_uuid()), txn_number_i64(high)],
        )?;
        Ok(())
    }

    fn delete_ledger_if_idle(&mut self, session: &SessionId) -> Result<bool, StoreError> {
        let blob = uuid_blob(session.as_uuid());
        let remaining: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM txn_records WHERE session_id = ?1",
            params![&blob],
            |row| row.get(0),
        )?;
        if remaining > 0 {
            return Ok(false);
        }
        let deleted = self.conn.execute(
            "DELETE FROM session_ledger WHERE session_id = ?1",
            params![&blob],
        )?;
        Ok(deleted > 0)
    }

    fn load_txn_record(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Option<TxnRecord>, StoreError> {
        load_txn_record(&self.conn, identity)
    }

    fn put_txn_record(&mut self, record: &TxnRecord) -> Result<(), StoreError> {
        let high = record.high_timestamp();
        let body = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO txn_records \
             (identity_key, session_id, txn_number, state, high_wall_ms, high_counter, updated_at_ms, body) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(identity_key) DO UPDATE SET \
               txn_number = excluded.txn_number, \
               state = excluded.state, \
               high_wall_ms = excluded.high_wall_ms, \
               high_counter = excluded.high_counter, \
               updated_at_ms = excluded.updated_at_ms, \
               body = excluded.body",
            params![
                record.identity.key(),
                uuid_blob(record.identity.session_id.as_uuid()),
                txn_number_i64(record.txn_number),
                record.state.as_str(),
                u64_i64(high.wall_ms, "txn_records")?,
                i64::from(high.counter),
                u64_i64(record.updated_at_ms, "txn_records")?,
                body,
            ],
        )?;
        Ok(())
    }

    fn delete_txn_record(&mut self, identity: &SessionIdentity) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM txn_records WHERE identity_key = ?1",
            params![identity.key()],
        )?;
        Ok(())
    }

    fn list_session_txn_records(
        &self,
        session: &SessionId,
    ) -> Result<Vec<TxnRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM txn_records WHERE session_id = ?1 ORDER BY identity_key ASC",
        )?;
        let mut rows = stmt.query(params![uuid_blob(session.as_uuid())])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            out.push(decode_txn_body(&body)?);
        }
        Ok(out)
    }

    fn lookup_statement(&self, key: &StatementKey) -> Result<Option<StatementRow>, StoreError> {
        lookup_statement(&self.conn, key)
    }

    fn lookup_history(
        &self,
        session: &SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Vec<StatementRow>, StoreError> {
        let sql = format!(
            "SELECT {STATEMENT_COLUMNS} FROM statements \
             WHERE session_id = ?1 AND history_txn_number = ?2 AND stmt_id = ?3 \
             ORDER BY created_at_ms ASC, identity_key ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![
            uuid_blob(session.as_uuid()),
            txn_number_i64(txn_number),
            i64::from(stmt_id.get()),
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(decode_statement_row(row)?);
        }
        Ok(out)
    }

    fn insert_statement_if_absent(
        &mut self,
        row: &StatementRow,
    ) -> Result<StatementInsert, StoreError> {
        let outcome = serde_json::to_string(&row.outcome)?;
        let inserted = self.conn.execute(
            "INSERT INTO statements \
             (identity_key, txn_number, stmt_id, session_id, history_txn_number, request_sha256, \
              outcome, op_term, op_wall_ms, op_counter, committed, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(identity_key, txn_number, stmt_id) DO NOTHING",
            params![
                row.key.txn.identity.key(),
                txn_number_i64(row.key.txn.txn_number),
                i64::from(row.key.stmt_id.get()),
                uuid_blob(row.key.txn.identity.session_id.as_uuid()),
                row.history_txn_number.map(txn_number_i64),
                row.request_sha256.to_vec(),
                outcome,
                u64_i64(row.op_time.term, "statements")?,
                u64_i64(row.op_time.ts.wall_ms, "statements")?,
                i64::from(row.op_time.ts.counter),
                i64::from(row.committed),
                u64_i64(row.created_at_ms, "statements")?,
            ],
        )?;
        if inserted > 0 {
            return Ok(StatementInsert::Inserted);
        }
        let existing = lookup_statement(&self.conn, &row.key)?.ok_or_else(|| {
            StoreError::RowDecode {
                table: "statements",
                reason: "statement conflict without row".to_string(),
            }
        })?;
        Ok(StatementInsert::AlreadyPresent(existing))
    }

    fn mark_statements_committed(&mut self, txn: &TxnId) -> Result<usize, StoreError> {
        let updated = self.conn.execute(
            "UPDATE statements SET committed = 1 WHERE identity_key = ?1 AND txn_number = ?2",
            params![txn.identity.key(), txn_number_i64(txn.txn_number)],
        )?;
        Ok(updated)
    }

    fn delete_statements(&mut self, txn: &TxnId) -> Result<usize, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM statements WHERE identity_key = ?1 AND txn_number = ?2",
            params![txn.identity.key(), txn_number_i64(txn.txn_number)],
        )?;
        Ok(deleted)
    }

    fn delete_identity_statements(
        &mut self,
        identity: &SessionIdentity,
    ) -> Result<usize, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM statements WHERE identity_key = ?1",
            params![identity.key()],
        )?;
        Ok(deleted)
    }

    fn apply_document_write(&mut self, write: &DocumentWrite) -> Result<(), StoreError> {
        match write {
            DocumentWrite::Put { ns, body, .. } => {
                self.conn.execute(
                    "INSERT INTO documents (namespace, doc_key, body) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(namespace, doc_key) DO UPDATE SET body = excluded.body",
                    params![ns.as_str(), write.key(), serde_json::to_string(body)?],
                )?;
            }
            DocumentWrite::Delete { ns, .. } => {
                self.conn.execute(
                    "DELETE FROM documents WHERE namespace = ?1 AND doc_key = ?2",
                    params![ns.as_str(), write.key()],
                )?;
            }
        }
        Ok(())
    }

    fn load_decision(&self, txn: &TxnId) -> Result<Option<DecisionRecord>, StoreError> {
        load_decision(&self.conn, txn)
    }

    fn put_decision(&mut self, record: &DecisionRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO commit_decisions (identity_key, txn_number, phase, updated_at_ms, body) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(identity_key, txn_number) DO UPDATE SET \
               phase = excluded.phase, \
               updated_at_ms = excluded.updated_at_ms, \
               body = excluded.body",
            params![
                record.txn.identity.key(),
                txn_number_i64(record.txn.txn_number),
                record.phase.as_str(),
                u64_i64(record.updated_at_ms, "commit_decisions")?,
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteSessionStoreTxn {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

struct SqliteSessionStoreReader {
    db_path: PathBuf,
    durability: StoreDurability,
}

impl SqliteSessionStoreReader {
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = open_connection(&self.db_path, self.durability, false)?;
        f(&conn)
    }

    fn txn_records_where(
        &self,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<TxnRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT body FROM txn_records WHERE {clause} ORDER BY updated_at_ms ASC, identity_key ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(args)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let body: String = row.get(0)?;
                out.push(decode_txn_body(&body)?);
            }
            Ok(out)
        })
    }
}

impl DocumentRead for SqliteSessionStoreReader {
    fn get_document(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_conn(|conn| get_document(conn, ns, key))
    }

    fn scan_documents(&self, ns: &Namespace) -> Result<Vec<StoredDocument>, StoreError> {
        self.with_conn(|conn| scan_documents(conn, ns))
    }
}

impl SessionStoreReader for SqliteSessionStoreReader {
    fn ledger_high(&self, session: &SessionId) -> Result<Option<TxnNumber>, StoreError> {
        self.with_conn(|conn| ledger_high(conn, session))
    }

    fn load_txn_record(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Option<TxnRecord>, StoreError> {
        self.with_conn(|conn| load_txn_record(conn, identity))
    }

    fn lookup_statement(&self, key: &StatementKey) -> Result<Option<StatementRow>, StoreError> {
        self.with_conn(|conn| lookup_statement(conn, key))
    }

    fn list_unresolved_txn_records(&self) -> Result<Vec<TxnRecord>, StoreError> {
        self.txn_records_where(
            "state IN (?1, ?2)",
            &[
                &TxnState::InProgress.as_str(),
                &TxnState::Prepared.as_str(),
            ],
        )
    }

    fn list_expired_txn_records(
        &self,
        updated_before_ms: u64,
    ) -> Result<Vec<TxnRecord>, StoreError> {
        let before = u64_i64(updated_before_ms, "txn_records")?;
        self.txn_records_where(
            "state IN (?1, ?2) AND updated_at_ms < ?3",
            &[
                &TxnState::Committed.as_str(),
                &TxnState::Aborted.as_str(),
                &before,
            ],
        )
    }

    fn list_pending_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM commit_decisions WHERE phase != ?1 \
                 ORDER BY updated_at_ms ASC, identity_key ASC, txn_number ASC",
            )?;
            let mut rows = stmt.query(params![DecisionPhase::Completed.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let body: String = row.get(0)?;
                out.push(decode_decision_body(&body)?);
            }
            Ok(out)
        })
    }

    fn load_decision(&self, txn: &TxnId) -> Result<Option<DecisionRecord>, StoreError> {
        self.with_conn(|conn| load_decision(conn, txn))
    }

    fn max_timestamp(&self) -> Result<Timestamp, StoreError> {
        self.with_conn(|conn| {
            let from_statements = max_ts_row(
                conn,
                "SELECT op_wall_ms, op_counter FROM statements \
                 ORDER BY op_wall_ms DESC, op_counter DESC LIMIT 1",
            )?;
            let from_records = max_ts_row(
                conn,
                "SELECT high_wall_ms, high_counter FROM txn_records \
                 ORDER BY high_wall_ms DESC, high_counter DESC LIMIT 1",
            )?;
            Ok(from_statements.max(from_records))
        })
    }
}

// =============================================================================
// Shared queries
// =============================================================================

fn ledger_high(conn: &Connection, session: &SessionId) -> Result<Option<TxnNumber>, StoreError> {
    let raw: Option<i64> = conn
        .query_row(
            "SELECT high_txn_number FROM session_ledger WHERE session_id = ?1",
            params![uuid_blob(session.as_uuid())],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|value| decode_txn_number(value, "session_ledger"))
        .transpose()
}

fn load_txn_record(
    conn: &Connection,
    identity: &SessionIdentity,
) -> Result<Option<TxnRecord>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM txn_records WHERE identity_key = ?1",
            params![identity.key()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|body| decode_txn_body(&body)).transpose()
}

fn lookup_statement(
    conn: &Connection,
    key: &StatementKey,
) -> Result<Option<StatementRow>, StoreError> {
    let sql = format!(
        "SELECT {STATEMENT_COLUMNS} FROM statements \
         WHERE identity_key = ?1 AND txn_number = ?2 AND stmt_id = ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![
        key.txn.identity.key(),
        txn_number_i64(key.txn.txn_number),
        i64::from(key.stmt_id.get()),
    ])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_statement_row(row)?)),
        None => Ok(None),
    }
}

fn load_decision(conn: &Connection, txn: &TxnId) -> Result<Option<DecisionRecord>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM commit_decisions WHERE identity_key = ?1 AND txn_number = ?2",
            params![txn.identity.key(), txn_number_i64(txn.txn_number)],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|body| decode_decision_body(&body)).transpose()
}

fn get_document(conn: &Connection, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE namespace = ?1 AND doc_key = ?2",
            params![ns.as_str(), key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(body
        .map(|body| serde_json::from_str::<Value>(&body))
        .transpose()?)
}

fn scan_documents(conn: &Connection, ns: &Namespace) -> Result<Vec<StoredDocument>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT doc_key, body FROM documents WHERE namespace = ?1 ORDER BY doc_key")?;
    let mut rows = stmt.query(params![ns.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let body: String = row.get(1)?;
        out.push(StoredDocument {
            key,
            body: serde_json::from_str(&body)?,
        });
    }
    Ok(out)
}

fn max_ts_row(conn: &Connection, sql: &str) -> Result<Timestamp, StoreError> {
    let row: Option<(i64, i64)> = conn
        .query_row(sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    let Some((wall, counter)) = row else {
        return Ok(Timestamp::ZERO);
    };
    Ok(Timestamp::new(
        i64_u64(wall, "timestamp")?,
        u32::try_from(counter).map_err(|_| row_decode("timestamp", "counter out of range"))?,
    ))
}

fn decode_statement_row(row: &Row<'_>) -> Result<StatementRow, StoreError> {
    let identity_key: String = row.get(0)?;
    let txn_number: i64 = row.get(1)?;
    let stmt_id: i64 = row.get(2)?;
    let history_txn_number: Option<i64> = row.get(3)?;
    let request_sha256: Vec<u8> = row.get(4)?;
    let outcome: String = row.get(5)?;
    let op_term: i64 = row.get(6)?;
    let op_wall_ms: i64 = row.get(7)?;
    let op_counter: i64 = row.get(8)?;
    let committed: i64 = row.get(9)?;
    let created_at_ms: i64 = row.get(10)?;

    let identity = SessionIdentity::parse_key(&identity_key)
        .map_err(|err| row_decode("statements", &err.to_string()))?;
    let stmt_id = u32::try_from(stmt_id)
        .map(StmtId::new)
        .map_err(|_| row_decode("statements", "stmt_id out of range"))?;
    let request_sha256: [u8; 32] = request_sha256
        .try_into()
        .map_err(|_| row_decode("statements", "request_sha256 wrong length"))?;
    let op_counter =
        u32::try_from(op_counter).map_err(|_| row_decode("statements", "op_counter out of range"))?;

    Ok(StatementRow {
        key: StatementKey::new(
            TxnId::new(identity, decode_txn_number(txn_number, "statements")?),
            stmt_id,
        ),
        history_txn_number: history_txn_number
            .map(|value| decode_txn_number(value, "statements"))
            .transpose()?,
        request_sha256,
        outcome: serde_json::from_str(&outcome)?,
        op_time: OpTime::new(
            i64_u64(op_term, "statements")?,
            Timestamp::new(i64_u64(op_wall_ms, "statements")?, op_counter),
        ),
        committed: committed != 0,
        created_at_ms: i64_u64(created_at_ms, "statements")?,
    })
}

fn decode_txn_body(body: &str) -> Result<TxnRecord, StoreError> {
    serde_json::from_str(body).map_err(|err| row_decode("txn_records", &err.to_string()))
}

fn decode_decision_body(body: &str) -> Result<DecisionRecord, StoreError> {
    serde_json::from_str(body).map_err(|err| row_decode("commit_decisions", &err.to_string()))
}

fn decode_txn_number(raw: i64, table: &'static str) -> Result<TxnNumber, StoreError> {
    let value = i64_u64(raw, table)?;
    TxnNumber::new(value).map_err(|err| row_decode(table, &err.to_string()))
}

fn txn_number_i64(value: TxnNumber) -> i64 {
    // TxnNumber is bounded by i64::MAX at construction.
    value.get() as i64
}

fn u64_i64(value: u64, table: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| row_decode(table, "value exceeds i64 range"))
}

fn i64_u64(value: i64, table: &'static str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| row_decode(table, "negative value"))
}

fn row_decode(table: &'static str, reason: &str) -> StoreError {
    StoreError::RowDecode {
        table,
        reason: reason.to_string(),
    }
}

fn uuid_blob(uuid: Uuid) -> Vec<u8> {
    uuid.as_bytes().to_vec()
}

// =============================================================================
// Schema + connection
// =============================================================================

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS session_ledger (
           session_id BLOB PRIMARY KEY,
           high_txn_number INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS txn_records (
           identity_key TEXT PRIMARY KEY,
           session_id BLOB NOT NULL,
           txn_number INTEGER NOT NULL,
           state TEXT NOT NULL,
           high_wall_ms INTEGER NOT NULL,
           high_counter INTEGER NOT NULL,
           updated_at_ms INTEGER NOT NULL,
           body TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS txn_records_by_state
           ON txn_records (state, updated_at_ms);
         CREATE INDEX IF NOT EXISTS txn_records_by_session
           ON txn_records (session_id);
         CREATE TABLE IF NOT EXISTS statements (
           identity_key TEXT NOT NULL,
           txn_number INTEGER NOT NULL,
           stmt_id INTEGER NOT NULL,
           session_id BLOB NOT NULL,
           history_txn_number INTEGER,
           request_sha256 BLOB NOT NULL,
           outcome TEXT NOT NULL,
           op_term INTEGER NOT NULL,
           op_wall_ms INTEGER NOT NULL,
           op_counter INTEGER NOT NULL,
           committed INTEGER NOT NULL DEFAULT 0,
           created_at_ms INTEGER NOT NULL,
           PRIMARY KEY (identity_key, txn_number, stmt_id)
         );
         CREATE INDEX IF NOT EXISTS statements_by_history
           ON statements (session_id, history_txn_number, stmt_id);
         CREATE TABLE IF NOT EXISTS documents (
           namespace TEXT NOT NULL,
           doc_key TEXT NOT NULL,
           body TEXT NOT NULL,
           PRIMARY KEY (namespace, doc_key)
         );
         CREATE TABLE IF NOT EXISTS commit_decisions (
           identity_key TEXT NOT NULL,
           txn_number INTEGER NOT NULL,
           phase TEXT NOT NULL,
           updated_at_ms INTEGER NOT NULL,
           body TEXT NOT NULL,
           PRIMARY KEY (identity_key, txn_number)
         );",
    )?;
    Ok(())
}

fn write_meta(conn: &Connection) -> Result<(), StoreError> {
    set_meta(conn, "schema_version", STORE_SCHEMA_VERSION.to_string())?;
    set_meta(conn, "created_at_ms", crate::core::now_ms().to_string())?;
    Ok(())
}

fn validate_meta(conn: &Connection) -> Result<(), StoreError> {
    let raw = require_meta(conn, "schema_version")?;
    let got = raw
        .parse::<u32>()
        .map_err(|_| row_decode("meta", "schema_version is not an integer"))?;
    if got != STORE_SCHEMA_VERSION {
        return Err(StoreError::SchemaVersionMismatch {
            expected: STORE_SCHEMA_VERSION,
            got,
        });
    }
    Ok(())
}

fn set_meta(conn: &Connection, key: &'static str, value: String) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn require_meta(conn: &Connection, key: &'static str) -> Result<String, StoreError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    value.ok_or(StoreError::MetaMissing { key })
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
        )?;
    }
    Ok(())
}

fn reject_symlink(path: &Path) -> Result<(), StoreError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(StoreError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

fn open_connection(
    path: &Path,
    durability: StoreDurability,
    create: bool,
) -> Result<Connection, StoreError> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", durability.synchronous_value())?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KB)?;
    Ok(conn)
}
