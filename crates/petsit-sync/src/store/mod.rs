//! Durable local persistence for records

mod migrations;
mod sqlite;

pub use migrations::CURRENT_VERSION;
pub use sqlite::SqliteStore;

use crate::error::StorageError;
use crate::models::{Collection, Origin, Record};

/// A record together with the sequence number it was ingested under
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: Record,
    pub seq: u64,
}

/// Key-value persistence keyed by `(collection, id)`.
///
/// `put` is an unconditional overwrite; merge decisions belong to the
/// reconciliation engine.
pub trait LocalStore: Send + Sync {
    /// Get a record with its ingestion sequence number
    fn get_entry(&self, collection: Collection, id: &str)
        -> Result<Option<StoredRecord>, StorageError>;

    /// All records in a collection, tombstones only when asked for
    fn get_all(
        &self,
        collection: Collection,
        include_tombstones: bool,
    ) -> Result<Vec<Record>, StorageError>;

    /// Write a record, returning the sequence number it was stored under.
    /// Durable once this returns.
    fn put(&self, collection: Collection, record: &Record) -> Result<u64, StorageError>;

    /// Sequence number the next `put` will use
    fn next_seq(&self) -> Result<u64, StorageError>;

    /// Physically remove tombstones with `updated_at < older_than`
    fn purge_tombstones(&self, collection: Collection, older_than: i64)
        -> Result<usize, StorageError>;

    /// Get a record by id
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.get_entry(collection, id)?.map(|entry| entry.record))
    }

    /// Tombstone a record at `updated_at`
    fn delete(&self, collection: Collection, id: &str, updated_at: i64) -> Result<(), StorageError> {
        let tombstone = match self.get(collection, id)? {
            Some(existing) => existing.to_tombstone(updated_at, Origin::Local),
            None => Record::local(id, "", serde_json::Value::Null, updated_at)
                .to_tombstone(updated_at, Origin::Local),
        };
        self.put(collection, &tombstone)?;
        Ok(())
    }
}
