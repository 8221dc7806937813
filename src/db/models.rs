// src/db/models.rs

//! Data models for Updraft database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::Result;
use crate::packages::{LocalPackageRecord, PackageIdentity, PackageMetadata};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::PathBuf;
use std::str::FromStr;

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Which package slot a row occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Current,
    Previous,
}

impl Slot {
    pub fn as_str(&self) -> &str {
        match self {
            Slot::Current => "current",
            Slot::Previous => "previous",
        }
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "current" => Ok(Slot::Current),
            "previous" => Ok(Slot::Previous),
            _ => Err(format!("Invalid package slot: {}", s)),
        }
    }
}

/// A row of the package_slots table
#[derive(Debug, Clone)]
pub struct PackageSlot {
    pub slot: Slot,
    pub metadata: PackageMetadata,
    pub local_path: Option<String>,
    pub is_pending: bool,
    pub rollback_timeout_ms: Option<u32>,
    pub installed_at: String,
}

const SLOT_COLUMNS: &str = "slot, package_hash, app_version, deployment_key, label, description,
     is_mandatory, package_size, download_url, local_path, is_pending, rollback_timeout_ms, installed_at";

impl PackageSlot {
    /// Find the package occupying a slot
    pub fn find(conn: &Connection, slot: Slot) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM package_slots WHERE slot = ?1",
            SLOT_COLUMNS
        ))?;

        let row = stmt.query_row([slot.as_str()], Self::from_row).optional()?;

        Ok(row)
    }

    /// Write this row, replacing whatever occupied the slot
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        let meta = &self.metadata;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO package_slots ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                SLOT_COLUMNS
            ),
            params![
                self.slot.as_str(),
                &meta.identity.package_hash,
                &meta.identity.app_version,
                &meta.identity.deployment_key,
                &meta.label,
                &meta.description,
                meta.is_mandatory,
                meta.package_size as i64,
                &meta.download_url,
                &self.local_path,
                self.is_pending,
                self.rollback_timeout_ms,
                &self.installed_at,
            ],
        )?;
        Ok(())
    }

    /// Move the row in `from` into `to`, replacing any occupant of `to`
    pub fn move_slot(conn: &Connection, from: Slot, to: Slot) -> Result<()> {
        Self::delete(conn, to)?;
        conn.execute(
            "UPDATE package_slots SET slot = ?1 WHERE slot = ?2",
            [to.as_str(), from.as_str()],
        )?;
        Ok(())
    }

    /// Clear the pending flag of a slot
    pub fn clear_pending(conn: &Connection, slot: Slot) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE package_slots SET is_pending = 0 WHERE slot = ?1 AND is_pending = 1",
            [slot.as_str()],
        )?;
        Ok(changed)
    }

    /// Empty a slot
    pub fn delete(conn: &Connection, slot: Slot) -> Result<()> {
        conn.execute("DELETE FROM package_slots WHERE slot = ?1", [slot.as_str()])?;
        Ok(())
    }

    /// Convert into the public record type
    pub fn into_record(self, previous: Option<LocalPackageRecord>) -> LocalPackageRecord {
        LocalPackageRecord {
            metadata: self.metadata,
            previous: previous.map(Box::new),
            is_pending: self.is_pending,
            local_path: self.local_path.map(PathBuf::from),
            installed_at: self.installed_at,
            rollback_timeout_ms: self.rollback_timeout_ms,
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let slot_str: String = row.get(0)?;
        let slot = slot_str
            .parse::<Slot>()
            .map_err(|e| conversion_error(0, e))?;
        let package_size: i64 = row.get(7)?;

        Ok(Self {
            slot,
            metadata: PackageMetadata {
                identity: PackageIdentity {
                    package_hash: row.get(1)?,
                    app_version: row.get(2)?,
                    deployment_key: row.get(3)?,
                },
                label: row.get(4)?,
                description: row.get(5)?,
                is_mandatory: row.get(6)?,
                package_size: package_size.max(0) as u64,
                download_url: row.get(8)?,
                failed_apply: false,
            },
            local_path: row.get(9)?,
            is_pending: row.get(10)?,
            rollback_timeout_ms: row.get(11)?,
            installed_at: row.get(12)?,
        })
    }
}

/// A blacklisted package identity
#[derive(Debug, Clone)]
pub struct FailedUpdate {
    pub id: Option<i64>,
    pub identity: PackageIdentity,
    pub failed_at: Option<String>,
}

impl FailedUpdate {
    pub fn new(identity: PackageIdentity) -> Self {
        Self {
            id: None,
            identity,
            failed_at: None,
        }
    }

    /// Insert unless the identity is already present
    ///
    /// Returns `true` if a new row was written.
    pub fn insert(&mut self, conn: &Connection) -> Result<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO failed_updates (package_hash, app_version, deployment_key)
             VALUES (?1, ?2, ?3)",
            params![
                &self.identity.package_hash,
                &self.identity.app_version,
                &self.identity.deployment_key,
            ],
        )?;

        if changed > 0 {
            self.id = Some(conn.last_insert_rowid());
        }
        Ok(changed > 0)
    }

    /// Whether an identity has failed before
    pub fn exists(conn: &Connection, identity: &PackageIdentity) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM failed_updates
                 WHERE package_hash = ?1 AND app_version = ?2 AND deployment_key = ?3",
                params![
                    &identity.package_hash,
                    &identity.app_version,
                    &identity.deployment_key,
                ],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.is_some())
    }

    /// List all failed identities, oldest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_hash, app_version, deployment_key, failed_at
             FROM failed_updates ORDER BY id",
        )?;

        let entries = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Remove every entry, returning how many were removed
    pub fn delete_all(conn: &Connection) -> Result<usize> {
        let removed = conn.execute("DELETE FROM failed_updates", [])?;
        Ok(removed)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            identity: PackageIdentity {
                package_hash: row.get(1)?,
                app_version: row.get(2)?,
                deployment_key: row.get(3)?,
            },
            failed_at: row.get(4)?,
        })
    }
}

/// Kind of update history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Install,
    Confirm,
    Rollback,
    BlacklistClear,
}

impl UpdateAction {
    pub fn as_str(&self) -> &str {
        match self {
            UpdateAction::Install => "install",
            UpdateAction::Confirm => "confirm",
            UpdateAction::Rollback => "rollback",
            UpdateAction::BlacklistClear => "blacklist_clear",
        }
    }
}

impl FromStr for UpdateAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(UpdateAction::Install),
            "confirm" => Ok(UpdateAction::Confirm),
            "rollback" => Ok(UpdateAction::Rollback),
            "blacklist_clear" => Ok(UpdateAction::BlacklistClear),
            _ => Err(format!("Invalid update action: {}", s)),
        }
    }
}

/// An entry in the update history
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub id: Option<i64>,
    pub package_hash: String,
    pub label: String,
    pub action: UpdateAction,
    pub created_at: Option<String>,
}

impl UpdateEvent {
    pub fn new(package_hash: String, label: String, action: UpdateAction) -> Self {
        Self {
            id: None,
            package_hash,
            label,
            action,
            created_at: None,
        }
    }

    /// Insert this event into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO update_events (package_hash, label, action) VALUES (?1, ?2, ?3)",
            params![&self.package_hash, &self.label, self.action.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// List all events, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_hash, label, action, created_at
             FROM update_events ORDER BY id DESC",
        )?;

        let events = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let action_str: String = row.get(3)?;
        let action = action_str
            .parse::<UpdateAction>()
            .map_err(|e| conversion_error(3, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            package_hash: row.get(1)?,
            label: row.get(2)?,
            action,
            created_at: row.get(4)?,
        })
    }
}

/// A persisted key/value setting
pub struct Setting;

impl Setting {
    pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            [key, value],
        )?;
        Ok(())
    }
}
