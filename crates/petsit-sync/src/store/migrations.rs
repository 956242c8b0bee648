//! Local store migrations

use rusqlite::Connection;

use crate::error::StorageError;
use crate::models::Collection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<(), StorageError> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32, StorageError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migration to version 1: one record table per collection
fn migrate_v1(conn: &Connection) -> Result<(), StorageError> {
    let mut statements = vec![
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
        .to_string(),
    ];
    for collection in Collection::ALL {
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                owner_scope TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                tombstone INTEGER NOT NULL DEFAULT 0,
                seq INTEGER NOT NULL,
                record TEXT NOT NULL
            )",
            table = collection.as_str()
        ));
    }
    statements.push("INSERT INTO schema_version (version) VALUES (1)".to_string());

    apply(conn, &statements)?;
    tracing::info!("Migrated local store to version 1");
    Ok(())
}

/// Migration to version 2: indexes for scoped reads and tombstone purges
fn migrate_v2(conn: &Connection) -> Result<(), StorageError> {
    let mut statements = Vec::new();
    for collection in Collection::ALL {
        let table = collection.as_str();
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner_scope)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_tombstone ON {table}(tombstone, updated_at)"
        ));
    }
    statements.push("INSERT INTO schema_version (version) VALUES (2)".to_string());

    apply(conn, &statements)?;
    tracing::info!("Migrated local store to version {CURRENT_VERSION}");
    Ok(())
}

fn apply(conn: &Connection, statements: &[String]) -> Result<(), StorageError> {
    let tx = conn.unchecked_transaction()?;
    for statement in statements {
        tx.execute(statement, [])?;
    }
    tx.commit()?;
    Ok(())
}
