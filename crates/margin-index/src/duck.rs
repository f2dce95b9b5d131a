//! DuckDB-backed record index and cursor store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, Connection};
use margin_lexicon::{IndexedRecord, RecordBody};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::store::{CursorStore, RecordIndex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    uri TEXT PRIMARY KEY,
    author_did TEXT NOT NULL,
    collection TEXT NOT NULL,
    rkey TEXT NOT NULL,
    kind TEXT NOT NULL,
    cid TEXT,
    target_source TEXT,
    target_hash TEXT,
    subject_uri TEXT,
    body_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    indexed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cursors (
    subscription TEXT PRIMARY KEY,
    position BIGINT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const RECORD_COLUMNS: &str = "uri, author_did, collection, rkey, cid, target_source, \
     target_hash, subject_uri, body_json, created_at, indexed_at";

/// Record index and cursor store sharing one DuckDB database.
#[derive(Clone)]
pub struct DuckStore {
    conn: Arc<Mutex<Connection>>,
}

struct RecordRow {
    uri: String,
    author_did: String,
    collection: String,
    rkey: String,
    cid: Option<String>,
    target_source: Option<String>,
    target_hash: Option<String>,
    subject_uri: Option<String>,
    body_json: String,
    created_at: String,
    indexed_at: String,
}

impl DuckStore {
    /// Open or create a database file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), "opening record index");
        Self::init(Connection::open(path)?)
    }

    /// Create a new store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn query_records(&self, sql: &str, arg: &str) -> Result<Vec<IndexedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![arg], |row| {
            Ok(RecordRow {
                uri: row.get(0)?,
                author_did: row.get(1)?,
                collection: row.get(2)?,
                rkey: row.get(3)?,
                cid: row.get(4)?,
                target_source: row.get(5)?,
                target_hash: row.get(6)?,
                subject_uri: row.get(7)?,
                body_json: row.get(8)?,
                created_at: row.get(9)?,
                indexed_at: row.get(10)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

impl RecordRow {
    fn into_record(self) -> Result<IndexedRecord> {
        let body: RecordBody = serde_json::from_str(&self.body_json)?;
        let created_at = parse_timestamp(&self.uri, &self.created_at)?;
        let indexed_at = parse_timestamp(&self.uri, &self.indexed_at)?;
        Ok(IndexedRecord {
            uri: self.uri,
            author_did: self.author_did,
            collection: self.collection,
            rkey: self.rkey,
            cid: self.cid,
            target_source: self.target_source,
            target_hash: self.target_hash,
            subject_uri: self.subject_uri,
            body,
            created_at,
            indexed_at,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(uri: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| IndexError::InvalidTimestamp {
            uri: uri.to_string(),
            value: value.to_string(),
        })
}

impl RecordIndex for DuckStore {
    fn upsert(&self, record: &IndexedRecord) -> Result<()> {
        let body_json = serde_json::to_string(&record.body)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO records ({RECORD_COLUMNS}, kind) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                record.uri,
                record.author_did,
                record.collection,
                record.rkey,
                record.cid,
                record.target_source,
                record.target_hash,
                record.subject_uri,
                body_json,
                format_timestamp(&record.created_at),
                format_timestamp(&record.indexed_at),
                record.kind().as_str(),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, uri: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM records WHERE uri = ?", params![uri])?;
        Ok(removed > 0)
    }

    fn get(&self, uri: &str) -> Result<Option<IndexedRecord>> {
        let records = self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE uri = ?"),
            uri,
        )?;
        Ok(records.into_iter().next())
    }

    fn records_for_author(
        &self,
        did: &str,
        collection: &str,
    ) -> Result<HashMap<String, Option<String>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT uri, cid FROM records WHERE author_did = ? AND collection = ?")?;
        let rows = stmt.query_map(params![did, collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut uris = HashMap::new();
        for row in rows {
            let (uri, cid) = row?;
            uris.insert(uri, cid);
        }
        Ok(uris)
    }

    fn by_target_hash(&self, target_hash: &str) -> Result<Vec<IndexedRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE target_hash = ? \
                 ORDER BY created_at DESC"
            ),
            target_hash,
        )
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

impl CursorStore for DuckStore {
    fn load_cursor(&self, subscription: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT position FROM cursors WHERE subscription = ?")?;
        let mut rows = stmt.query_map(params![subscription], |row| row.get::<_, i64>(0))?;
        let cursor = rows.next().transpose()?;
        Ok(cursor)
    }

    fn save_cursor(&self, subscription: &str, cursor: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cursors (subscription, position, updated_at) VALUES (?, ?, ?)",
            params![subscription, cursor, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }
}
