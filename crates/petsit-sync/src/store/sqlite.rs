//! `SQLite` implementation of `LocalStore`

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite stores seq as i64

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{migrations, LocalStore, StoredRecord};
use crate::error::StorageError;
use crate::models::{Collection, Record};

struct Inner {
    conn: Connection,
    next_seq: u64,
}

/// Record store backed by a single `SQLite` connection
pub struct SqliteStore {
    inner: Mutex<Inner>,
}

impl SqliteStore {
    /// Open a store at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, true)
    }

    /// Open a store at `path`, moving an unreadable database file aside and
    /// starting fresh when it is not a `SQLite` database.
    pub fn open_or_recover(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        match Self::open(path) {
            Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)))
                if failure.code == ErrorCode::NotADatabase =>
            {
                tracing::warn!(path = %path.display(), "Local store is not a database; starting fresh");
                quarantine(path)?;
                Self::open(path)
            }
            other => other,
        }
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, false)
    }

    fn from_connection(conn: Connection, on_disk: bool) -> Result<Self, StorageError> {
        configure(&conn, on_disk)?;
        migrations::run(&conn)?;
        let next_seq = max_seq(&conn)? + 1;
        tracing::debug!(next_seq, "Opened local store");
        Ok(Self {
            inner: Mutex::new(Inner { conn, next_seq }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn configure(conn: &Connection, on_disk: bool) -> Result<(), StorageError> {
    if on_disk {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "Configured local store");
    }
    // Every put is flushed before it returns.
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(())
}

/// Rename the database to `<name>.corrupt-<millis>` and drop its WAL sidecars.
fn quarantine(path: &Path) -> Result<(), StorageError> {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return Ok(());
    };
    if path.exists() {
        let backup = path.with_file_name(format!(
            "{name}.corrupt-{}",
            chrono::Utc::now().timestamp_millis()
        ));
        std::fs::rename(path, &backup)?;
        tracing::warn!(backup = %backup.display(), "Moved corrupted local store aside");
    }
    for suffix in ["-wal", "-shm", "-journal"] {
        let sidecar = path.with_file_name(format!("{name}{suffix}"));
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
        }
    }
    Ok(())
}

fn max_seq(conn: &Connection) -> Result<u64, StorageError> {
    let mut max = 0_i64;
    for collection in Collection::ALL {
        let seq: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(seq), 0) FROM {}", collection.as_str()),
            [],
            |row| row.get(0),
        )?;
        max = max.max(seq);
    }
    Ok(max as u64)
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64)> {
    Ok((row.get(0)?, row.get(1)?))
}

impl LocalStore for SqliteStore {
    fn get_entry(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let inner = self.lock()?;
        let row = inner
            .conn
            .query_row(
                &format!(
                    "SELECT record, seq FROM {} WHERE id = ?1",
                    collection.as_str()
                ),
                params![id],
                parse_entry,
            )
            .optional()?;
        drop(inner);

        row.map(|(json, seq)| {
            Ok(StoredRecord {
                record: serde_json::from_str(&json)?,
                seq: seq as u64,
            })
        })
        .transpose()
    }

    fn get_all(
        &self,
        collection: Collection,
        include_tombstones: bool,
    ) -> Result<Vec<Record>, StorageError> {
        let inner = self.lock()?;
        let sql = if include_tombstones {
            format!("SELECT record FROM {} ORDER BY seq", collection.as_str())
        } else {
            format!(
                "SELECT record FROM {} WHERE tombstone = 0 ORDER BY seq",
                collection.as_str()
            )
        };
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(inner);

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StorageError::from))
            .collect()
    }

    fn put(&self, collection: Collection, record: &Record) -> Result<u64, StorageError> {
        let json = serde_json::to_string(record)?;
        let mut inner = self.lock()?;
        let seq = inner.next_seq;
        inner.conn.execute(
            &format!(
                "INSERT INTO {} (id, owner_scope, updated_at, tombstone, seq, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    owner_scope = excluded.owner_scope,
                    updated_at = excluded.updated_at,
                    tombstone = excluded.tombstone,
                    seq = excluded.seq,
                    record = excluded.record",
                collection.as_str()
            ),
            params![
                record.id,
                record.owner_scope,
                record.updated_at,
                record.tombstone,
                seq as i64,
                json
            ],
        )?;
        inner.next_seq = seq + 1;
        Ok(seq)
    }

    fn next_seq(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.next_seq)
    }

    fn purge_tombstones(
        &self,
        collection: Collection,
        older_than: i64,
    ) -> Result<usize, StorageError> {
        let inner = self.lock()?;
        let removed = inner.conn.execute(
            &format!(
                "DELETE FROM {} WHERE tombstone = 1 AND updated_at < ?1",
                collection.as_str()
            ),
            params![older_than],
        )?;
        Ok(removed)
    }
}
