// src/db/schema.rs

//! Database schema definitions and migrations for Updraft
//!
//! This module defines the SQLite schema for the package slots, the failed
//! update blacklist and the update history, and provides a migration system
//! to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!("Schema migration complete. Now at version {}", SCHEMA_VERSION);
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(Error::InitError(format!("Unknown migration version: {}", version))),
    }
}

/// Initial schema - Version 1
///
/// - package_slots: the current package and the one it replaced
/// - failed_updates: identities that were rolled back (the blacklist)
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- Package slots: at most one current and one previous package
        CREATE TABLE package_slots (
            slot TEXT PRIMARY KEY CHECK(slot IN ('current', 'previous')),
            package_hash TEXT NOT NULL,
            app_version TEXT NOT NULL,
            deployment_key TEXT NOT NULL,
            label TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            is_mandatory INTEGER NOT NULL DEFAULT 0,
            package_size INTEGER NOT NULL DEFAULT 0,
            download_url TEXT NOT NULL DEFAULT '',
            local_path TEXT,
            is_pending INTEGER NOT NULL DEFAULT 0,
            rollback_timeout_ms INTEGER,
            installed_at TEXT NOT NULL
        );

        -- Failed updates: append-only until explicitly cleared
        CREATE TABLE failed_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_hash TEXT NOT NULL,
            app_version TEXT NOT NULL,
            deployment_key TEXT NOT NULL,
            failed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(package_hash, app_version, deployment_key)
        );

        CREATE INDEX idx_failed_updates_hash ON failed_updates(package_hash);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Add update history
///
/// Records every install, confirmation, rollback and blacklist clear
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE update_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_hash TEXT NOT NULL,
            label TEXT NOT NULL,
            action TEXT NOT NULL CHECK(action IN ('install', 'confirm', 'rollback', 'blacklist_clear')),
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_update_events_created_at ON update_events(created_at);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Schema Version 3: Add client settings
///
/// Holds values generated once per installation, such as the client id
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        CREATE TABLE settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        ",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        set_schema_version(&conn, 1).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"package_slots".to_string()));
        assert!(tables.contains(&"failed_updates".to_string()));
        assert!(tables.contains(&"update_events".to_string()));
        assert!(tables.contains(&"settings".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_slot_constraint() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO package_slots (slot, package_hash, app_version, deployment_key, label, installed_at)
             VALUES ('older', 'h', '1.0', 'k', 'v1', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_updates_unique_identity() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let insert = "INSERT INTO failed_updates (package_hash, app_version, deployment_key) VALUES (?1, ?2, ?3)";
        conn.execute(insert, ["h", "1.0", "k"]).unwrap();
        assert!(conn.execute(insert, ["h", "1.0", "k"]).is_err());
        // Same hash under another deployment key is a different identity
        conn.execute(insert, ["h", "1.0", "other"]).unwrap();
    }
}
