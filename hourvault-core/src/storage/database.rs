//! A single hour-bucket SQLite file

use crate::{BucketKey, LogRecord, Result, VaultError};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER,
    host TEXT,
    message TEXT
);";

const INSERT: &str = "INSERT INTO log (timestamp, host, message) VALUES (?1, ?2, ?3)";

/// Open handle on `<dir>/<YYYYMMDDHH>.sqlite3`
#[derive(Debug)]
pub struct HourlyDatabase {
    key: BucketKey,
    path: PathBuf,
    conn: Connection,
}

impl HourlyDatabase {
    /// Open or create the file for `key` and make sure the schema exists
    pub fn open(dir: &Path, key: BucketKey) -> Result<Self> {
        let path = dir.join(key.file_name());
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { key, path, conn })
    }

    pub fn key(&self) -> BucketKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert one record, returning its row id
    pub fn insert(&self, record: &LogRecord) -> Result<i64> {
        let message = record.message();
        let mut stmt = self.conn.prepare_cached(INSERT)?;
        stmt.execute(params![record.received_at(), record.source(), message.as_ref()])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Number of rows in the log table
    pub fn row_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM log", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Flush and release the handle
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| VaultError::Sqlite(e))
    }
}
