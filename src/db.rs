//! Content-addressed receipt store.
//!
//! One table keyed by an auto id with a unique `source_sha` column; the
//! digest is the sole deduplication key, so re-processing the same image
//! bytes updates the existing row in place. WAL + relaxed synchronous make
//! the file friendly to concurrent readers; in-process writers are
//! serialized by the connection mutex, and duplicate digests across
//! processes rely on the atomic `ON CONFLICT` clause.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::info;

use crate::error::ScanError;
use crate::types::{ReceiptRecord, ReceiptSummary, StoredReceipt, UpsertOutcome, UpsertResult};

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn new(db_path: PathBuf) -> Result<Self, ScanError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS receipts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_sha TEXT NOT NULL UNIQUE,
                source_path TEXT,
                merchant TEXT,
                receipt_date TEXT,
                total_amount REAL,
                currency TEXT,
                ocr_text TEXT,
                ocr_json TEXT,
                du_json TEXT,
                meta_json TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            ",
        )?;
        Ok(Db { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ScanError> {
        self.conn.lock().map_err(|_| ScanError::LockPoisoned)
    }

    /// Insert-or-update keyed by content digest.
    ///
    /// A blank digest fails before any write. The existing source path is
    /// preserved unless the record carries a new non-empty one. Whether the
    /// row was inserted or updated is decided by its existence under the
    /// connection lock right before the atomic statement, not by comparing
    /// timestamps after the fact.
    pub fn upsert(&self, record: &ReceiptRecord) -> Result<UpsertResult, ScanError> {
        if record.source_sha.trim().is_empty() {
            return Err(ScanError::MissingDigest);
        }

        let conn = self.conn()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM receipts WHERE source_sha = ?1",
                params![record.source_sha],
                |row| row.get(0),
            )
            .optional()?;

        let source_path = record
            .source_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());

        conn.execute(
            "INSERT INTO receipts (
               source_sha, source_path,
               merchant, receipt_date, total_amount, currency,
               ocr_text, ocr_json, du_json, meta_json
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(source_sha) DO UPDATE SET
               source_path  = COALESCE(excluded.source_path, receipts.source_path),
               merchant     = excluded.merchant,
               receipt_date = excluded.receipt_date,
               total_amount = excluded.total_amount,
               currency     = excluded.currency,
               ocr_text     = excluded.ocr_text,
               ocr_json     = excluded.ocr_json,
               du_json      = excluded.du_json,
               meta_json    = excluded.meta_json,
               updated_at   = CURRENT_TIMESTAMP",
            params![
                record.source_sha,
                source_path,
                scalar_param(&record.merchant),
                scalar_param(&record.receipt_date),
                scalar_param(&record.total_amount),
                scalar_param(&record.currency),
                record.ocr_text,
                serde_json::to_string(&record.ocr_json)?,
                serde_json::to_string(&record.du_json)?,
                serde_json::to_string(&record.meta_json)?,
            ],
        )?;

        let (receipt_id, outcome) = match existing {
            Some(id) => (id, UpsertOutcome::Updated),
            None => (conn.last_insert_rowid(), UpsertOutcome::Inserted),
        };
        info!(receipt_id, ?outcome, sha = %record.source_sha, "receipt upserted");
        Ok(UpsertResult { receipt_id, outcome })
    }

    /// Most recent receipts, newest first by id. Summary projection only.
    pub fn list(&self, limit: usize) -> Result<Vec<ReceiptSummary>, ScanError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, merchant, receipt_date, total_amount, currency
             FROM receipts
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ReceiptSummary {
                id: row.get(0)?,
                merchant: column_json(row, 1)?,
                receipt_date: column_json(row, 2)?,
                total_amount: column_json(row, 3)?,
                currency: column_json(row, 4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Full record including stored JSON blobs, or None when absent.
    pub fn get_by_id(&self, receipt_id: i64) -> Result<Option<StoredReceipt>, ScanError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT
                   id, source_sha, source_path,
                   merchant, receipt_date, total_amount, currency,
                   ocr_text, ocr_json, du_json, meta_json,
                   created_at, updated_at
                 FROM receipts
                 WHERE id = ?1",
                params![receipt_id],
                |row| {
                    Ok(StoredReceipt {
                        id: row.get(0)?,
                        source_sha: row.get(1)?,
                        source_path: row.get(2)?,
                        merchant: column_json(row, 3)?,
                        receipt_date: column_json(row, 4)?,
                        total_amount: column_json(row, 5)?,
                        currency: column_json(row, 6)?,
                        ocr_text: row.get(7)?,
                        ocr_json: parse_blob(row.get::<_, Option<String>>(8)?),
                        du_json: parse_blob(row.get::<_, Option<String>>(9)?),
                        meta_json: parse_blob(row.get::<_, Option<String>>(10)?),
                        created_at: row.get(11)?,
                        updated_at: row.get(12)?,
                    })
                },
            )
            .optional()?;

        Ok(row.map(|mut r| {
            // keep meta self-describing even if the path only lives in its column
            if let (Some(path), Value::Object(meta)) = (&r.source_path, &mut r.meta_json) {
                meta.entry("source_path".to_string())
                    .or_insert_with(|| Value::String(path.clone()));
            }
            r
        }))
    }
}

/// Bind a dynamic JSON scalar the way the store keeps it: strings as text,
/// numbers as numbers, null as NULL. Anything structured is stored as its
/// JSON text.
fn scalar_param(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match v {
        Value::Null => SqlValue::Null,
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Read a dynamically-typed column back as a JSON scalar.
fn column_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let v = match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    };
    Ok(v)
}

/// Stored blobs are trusted but parsed leniently: absent or unparseable
/// text comes back as an empty object.
fn parse_blob(text: Option<String>) -> Value {
    text.and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}
