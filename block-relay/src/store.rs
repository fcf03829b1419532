//! SQLite-backed record log.
//!
//! The store is the single serialization point for identifier assignment:
//! every call takes the connection lock, so `INSERT` and `last_insert_rowid`
//! observe the same row even when many handlers insert at once.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StorageError;
use crate::record::{Record, RecordId};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS blocks (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL,
    message TEXT NOT NULL
)";

/// Durable append-only table of records.
///
/// There is no update or delete; lookups always go to the database so a
/// record is visible to every connection as soon as `insert` commits.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Opens (or creates) the database file and ensures the table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening record store");
        Self::from_connection(Connection::open(path)?)
    }

    /// A private in-memory database, gone when the store is dropped.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(CREATE_TABLE, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Appends a record and returns the id the database assigned to it.
    pub fn insert(&self, hash: &str, message: &str) -> Result<RecordId, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO blocks (hash, message) VALUES (?1, ?2)",
            params![hash, message],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Point lookup. A missing id is `Ok(None)`, not an error.
    pub fn lookup(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, hash, message FROM blocks WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Record {
                        id: row.get(0)?,
                        hash: row.get(1)?,
                        message: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Every record in id order.
    pub fn all(&self) -> Result<Vec<Record>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, hash, message FROM blocks ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Record {
                id: row.get(0)?,
                hash: row.get(1)?,
                message: row.get(2)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Removes the table so every later call fails with a database error.
    #[cfg(test)]
    pub(crate) fn drop_table_for_test(&self) {
        self.conn()
            .expect("store lock")
            .execute("DROP TABLE blocks", [])
            .expect("drop table");
    }
}
