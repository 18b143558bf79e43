//! SQLite database for durable batch state
//!
//! Two tables: `batch_snapshots` holds one JSON snapshot per batch, guarded by
//! the batch revision so an older snapshot can never overwrite a newer one;
//! `engine_records` holds small keyed JSON documents (processed-batch ledger,
//! pending notifications).

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Raw snapshot row
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub id: String,
    pub status: String,
    pub revision: u64,
    pub snapshot_json: String,
    pub updated_at: String,
}

/// SQLite-backed batch database
pub struct BatchDb {
    conn: Arc<Mutex<Connection>>,
}

impl BatchDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::database(format!("Failed to open database {}: {}", path.display(), e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (tests, ephemeral engines)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::database(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#).map_err(|e| Error::database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS batch_snapshots (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                revision INTEGER NOT NULL,
                snapshot_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_batch_snapshots_status ON batch_snapshots(status);

            CREATE TABLE IF NOT EXISTS engine_records (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#).map_err(|e| Error::database(format!("Failed to create tables: {}", e)))?;

        Ok(())
    }

    // ==================== Batch Snapshots ====================

    /// Insert or replace a snapshot unless a newer revision is already stored.
    /// Returns false when the write was skipped as stale.
    pub fn upsert_snapshot(&self, id: &str, status: &str, revision: u64, snapshot_json: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let changed = conn.execute(
            r#"
            INSERT INTO batch_snapshots (id, status, revision, snapshot_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                revision = excluded.revision,
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            WHERE excluded.revision >= batch_snapshots.revision
            "#,
            params![id, status, revision as i64, snapshot_json, Utc::now().to_rfc3339()],
        ).map_err(|e| Error::database(format!("Failed to write snapshot {}: {}", id, e)))?;

        Ok(changed > 0)
    }

    /// Get one snapshot
    pub fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotRow>> {
        let conn = self.conn.lock();

        let row = conn.query_row(
            "SELECT id, status, revision, snapshot_json, updated_at FROM batch_snapshots WHERE id = ?1",
            params![id],
            row_to_snapshot,
        ).optional()
        .map_err(|e| Error::database(format!("Failed to read snapshot {}: {}", id, e)))?;

        Ok(row)
    }

    /// All stored snapshots, oldest update first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, status, revision, snapshot_json, updated_at FROM batch_snapshots ORDER BY updated_at ASC"
        ).map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt.query_map([], row_to_snapshot)
            .map_err(|e| Error::database(format!("Failed to list snapshots: {}", e)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(rows)
    }

    /// Delete a snapshot; returns whether one existed
    pub fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn.execute("DELETE FROM batch_snapshots WHERE id = ?1", params![id])
            .map_err(|e| Error::database(format!("Failed to delete snapshot {}: {}", id, e)))?;

        Ok(count > 0)
    }

    // ==================== Engine Records ====================

    /// Read a keyed JSON record
    pub fn get_record(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let value = conn.query_row(
            "SELECT value_json FROM engine_records WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        ).optional()
        .map_err(|e| Error::database(format!("Failed to read record {}: {}", key, e)))?;

        Ok(value)
    }

    /// Write a keyed JSON record
    pub fn put_record(&self, key: &str, value_json: &str) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO engine_records (key, value_json, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at
            "#,
            params![key, value_json, Utc::now().to_rfc3339()],
        ).map_err(|e| Error::database(format!("Failed to write record {}: {}", key, e)))?;

        Ok(())
    }

    /// Make every later write fail
    #[cfg(test)]
    pub(crate) fn drop_tables(&self) {
        self.conn
            .lock()
            .execute_batch("DROP TABLE batch_snapshots; DROP TABLE engine_records;")
            .unwrap();
    }
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: row.get(0)?,
        status: row.get(1)?,
        revision: row.get::<_, i64>(2)? as u64,
        snapshot_json: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_revision_is_ignored() {
        let db = BatchDb::in_memory().unwrap();

        assert!(db.upsert_snapshot("b1", "processing", 5, r#"{"rev":5}"#).unwrap());
        assert!(!db.upsert_snapshot("b1", "queued", 3, r#"{"rev":3}"#).unwrap());

        let row = db.get_snapshot("b1").unwrap().unwrap();
        assert_eq!(row.revision, 5);
        assert_eq!(row.status, "processing");

        assert!(db.upsert_snapshot("b1", "completed", 6, r#"{"rev":6}"#).unwrap());
        assert_eq!(db.get_snapshot("b1").unwrap().unwrap().snapshot_json, r#"{"rev":6}"#);
    }

    #[test]
    fn test_delete_and_list() {
        let db = BatchDb::in_memory().unwrap();
        db.upsert_snapshot("a", "queued", 1, "{}").unwrap();
        db.upsert_snapshot("b", "queued", 1, "{}").unwrap();

        assert!(db.delete_snapshot("a").unwrap());
        assert!(!db.delete_snapshot("a").unwrap());

        let ids: Vec<String> = db.list_snapshots().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_records_overwrite() {
        let db = BatchDb::in_memory().unwrap();
        assert!(db.get_record("processed_batches").unwrap().is_none());

        db.put_record("processed_batches", r#"["a"]"#).unwrap();
        db.put_record("processed_batches", r#"["a","b"]"#).unwrap();
        assert_eq!(db.get_record("processed_batches").unwrap().unwrap(), r#"["a","b"]"#);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("batches.db");

        {
            let db = BatchDb::new(&path).unwrap();
            db.upsert_snapshot("b1", "processing", 2, "{}").unwrap();
        }

        let db = BatchDb::new(&path).unwrap();
        assert_eq!(db.list_snapshots().unwrap().len(), 1);
    }
}
