// src/store.rs

//! Persistent package state
//!
//! `PackageStore` owns the current and previous package records and the
//! blacklist of packages that failed to apply. Every mutation runs in a
//! single SQLite transaction so a concurrent reader (a status query, say)
//! never sees a half-written swap.

use crate::db::{
    self,
    models::{FailedUpdate, PackageSlot, Setting, Slot, UpdateAction, UpdateEvent},
};
use crate::error::{Error, Result};
use crate::packages::{LocalPackageRecord, PackageIdentity, PackageMetadata};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const CLIENT_UNIQUE_ID: &str = "client_unique_id";

/// How a package was staged, recorded alongside its metadata
#[derive(Debug, Clone, Default)]
pub struct InstallDetails {
    pub local_path: Option<String>,
    /// When set, the record starts out pending confirmation
    pub rollback_timeout_ms: Option<u32>,
}

pub struct PackageStore {
    conn: Mutex<Connection>,
}

impl PackageStore {
    /// Open (creating and migrating if needed) the store at `db_path`
    pub fn open(db_path: &str) -> Result<Self> {
        db::init(db_path)?;
        let conn = db::open(db_path)?;
        debug!("Opened package store at {}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the store inside a data directory
    pub fn open_in(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("updraft.db");
        let db_path = db_path
            .to_str()
            .ok_or_else(|| Error::Configuration(format!("Non UTF-8 data dir: {}", data_dir.display())))?;
        Self::open(db_path)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind, so the connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The currently installed package, with its predecessor attached
    pub fn current(&self) -> Result<Option<LocalPackageRecord>> {
        let conn = self.lock();
        let Some(current) = PackageSlot::find(&conn, Slot::Current)? else {
            return Ok(None);
        };
        let previous = PackageSlot::find(&conn, Slot::Previous)?.map(|p| p.into_record(None));
        Ok(Some(current.into_record(previous)))
    }

    /// The package the current one replaced
    pub fn previous(&self) -> Result<Option<LocalPackageRecord>> {
        let conn = self.lock();
        Ok(PackageSlot::find(&conn, Slot::Previous)?.map(|p| p.into_record(None)))
    }

    /// Make `meta` the current package
    ///
    /// The old current record becomes the previous one and anything older is
    /// discarded. Fails with `DuplicateInstall` if `meta` is already current.
    pub fn record_installed(
        &self,
        meta: &PackageMetadata,
        details: InstallDetails,
    ) -> Result<LocalPackageRecord> {
        let mut conn = self.lock();

        let record = db::transaction(&mut conn, |tx| {
            let current = PackageSlot::find(tx, Slot::Current)?;
            if let Some(current) = &current
                && current.metadata.identity == meta.identity
            {
                return Err(Error::DuplicateInstall(meta.identity.to_string()));
            }

            if current.is_some() {
                // A replaced package is no longer awaiting confirmation
                PackageSlot::move_slot(tx, Slot::Current, Slot::Previous)?;
                PackageSlot::clear_pending(tx, Slot::Previous)?;
            }

            let mut stored = meta.clone();
            stored.failed_apply = false;
            let row = PackageSlot {
                slot: Slot::Current,
                metadata: stored,
                local_path: details.local_path,
                is_pending: details.rollback_timeout_ms.is_some(),
                rollback_timeout_ms: details.rollback_timeout_ms,
                installed_at: chrono::Utc::now().to_rfc3339(),
            };
            row.upsert(tx)?;

            UpdateEvent::new(
                meta.identity.package_hash.clone(),
                meta.label.clone(),
                UpdateAction::Install,
            )
            .insert(tx)?;

            let previous = PackageSlot::find(tx, Slot::Previous)?.map(|p| p.into_record(None));
            Ok(row.into_record(previous))
        })?;

        info!(
            "Recorded {} ({}) as current package{}",
            record.metadata.label,
            record.identity(),
            if record.is_pending { ", pending confirmation" } else { "" }
        );
        Ok(record)
    }

    /// Clear the pending flag if `identity` is still the current package
    ///
    /// Returns `true` if a pending record was confirmed.
    pub fn mark_confirmed(&self, identity: &PackageIdentity) -> Result<bool> {
        let mut conn = self.lock();

        let confirmed = db::transaction(&mut conn, |tx| {
            let Some(current) = PackageSlot::find(tx, Slot::Current)? else {
                return Ok(false);
            };
            if current.metadata.identity != *identity {
                warn!(
                    "Not confirming {}: current package is {}",
                    identity, current.metadata.identity
                );
                return Ok(false);
            }
            if PackageSlot::clear_pending(tx, Slot::Current)? == 0 {
                return Ok(false);
            }
            UpdateEvent::new(
                identity.package_hash.clone(),
                current.metadata.label.clone(),
                UpdateAction::Confirm,
            )
            .insert(tx)?;
            Ok(true)
        })?;

        if confirmed {
            info!("Confirmed package {}", identity);
        }
        Ok(confirmed)
    }

    /// Reinstate the previous package and blacklist `failed`
    ///
    /// Returns the record that is current afterwards, or `None` when the
    /// application falls back to the package shipped with the binary.
    pub fn revert_to_previous(&self, failed: &PackageMetadata) -> Result<Option<LocalPackageRecord>> {
        let mut conn = self.lock();

        let restored = db::transaction(&mut conn, |tx| {
            PackageSlot::delete(tx, Slot::Current)?;
            PackageSlot::move_slot(tx, Slot::Previous, Slot::Current)?;
            PackageSlot::clear_pending(tx, Slot::Current)?;
            FailedUpdate::new(failed.identity.clone()).insert(tx)?;
            UpdateEvent::new(
                failed.identity.package_hash.clone(),
                failed.label.clone(),
                UpdateAction::Rollback,
            )
            .insert(tx)?;

            Ok(PackageSlot::find(tx, Slot::Current)?.map(|p| p.into_record(None)))
        })?;

        warn!(
            "Rolled back {}; blacklisted. Now running {}",
            failed.identity,
            restored
                .as_ref()
                .map(|r| r.metadata.label.as_str())
                .unwrap_or("the binary package")
        );
        Ok(restored)
    }

    /// Whether `identity` previously failed to apply
    pub fn is_blacklisted(&self, identity: &PackageIdentity) -> Result<bool> {
        let conn = self.lock();
        FailedUpdate::exists(&conn, identity)
    }

    /// Add `identity` to the blacklist; adding it again has no effect
    pub fn blacklist(&self, identity: &PackageIdentity) -> Result<()> {
        let conn = self.lock();
        if FailedUpdate::new(identity.clone()).insert(&conn)? {
            info!("Blacklisted package {}", identity);
        } else {
            debug!("Package {} already blacklisted", identity);
        }
        Ok(())
    }

    /// Every blacklisted identity, oldest first
    pub fn failed_updates(&self) -> Result<Vec<PackageIdentity>> {
        let conn = self.lock();
        Ok(FailedUpdate::list_all(&conn)?
            .into_iter()
            .map(|entry| entry.identity)
            .collect())
    }

    /// Remove every blacklist entry
    pub fn clear_blacklist(&self) -> Result<usize> {
        let mut conn = self.lock();
        let removed = db::transaction(&mut conn, |tx| {
            let removed = FailedUpdate::delete_all(tx)?;
            if removed > 0 {
                UpdateEvent::new(String::new(), String::new(), UpdateAction::BlacklistClear)
                    .insert(tx)?;
            }
            Ok(removed)
        })?;
        info!("Cleared {} blacklist entries", removed);
        Ok(removed)
    }

    /// Update history, newest first
    pub fn history(&self) -> Result<Vec<UpdateEvent>> {
        let conn = self.lock();
        UpdateEvent::list_all(&conn)
    }

    /// Identifier this installation reports to the update service
    ///
    /// Generated on first use and kept for the life of the data directory.
    pub fn client_unique_id(&self) -> Result<String> {
        let mut conn = self.lock();
        db::transaction(&mut conn, |tx| {
            if let Some(id) = Setting::get(tx, CLIENT_UNIQUE_ID)? {
                return Ok(id);
            }
            let id = uuid::Uuid::new_v4().to_string();
            Setting::set(tx, CLIENT_UNIQUE_ID, &id)?;
            info!("Generated client id {}", id);
            Ok(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_store() -> (TempDir, PackageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::open_in(dir.path()).unwrap();
        (dir, store)
    }

    fn meta(hash: &str, label: &str) -> PackageMetadata {
        PackageMetadata::new(PackageIdentity::new(hash, "1.0.0", "keyA"), label)
    }

    #[test]
    fn test_empty_store() {
        let (_dir, store) = create_store();
        assert!(store.current().unwrap().is_none());
        assert!(store.previous().unwrap().is_none());
        assert!(store.failed_updates().unwrap().is_empty());
    }

    #[test]
    fn test_record_installed_keeps_one_previous() {
        let (_dir, store) = create_store();

        store.record_installed(&meta("a", "v1"), InstallDetails::default()).unwrap();
        store.record_installed(&meta("b", "v2"), InstallDetails::default()).unwrap();
        let record = store.record_installed(&meta("c", "v3"), InstallDetails::default()).unwrap();

        assert_eq!(record.metadata.label, "v3");
        let previous = record.previous.as_ref().unwrap();
        assert_eq!(previous.metadata.label, "v2");
        assert!(previous.previous.is_none());

        let current = store.current().unwrap().unwrap();
        assert_eq!(current, record);
    }

    #[test]
    fn test_record_installed_rejects_duplicate() {
        let (_dir, store) = create_store();
        store.record_installed(&meta("a", "v1"), InstallDetails::default()).unwrap();

        let result = store.record_installed(&meta("a", "v1"), InstallDetails::default());
        assert!(matches!(result, Err(Error::DuplicateInstall(_))));
        assert!(store.previous().unwrap().is_none());
    }

    #[test]
    fn test_pending_follows_rollback_timeout() {
        let (_dir, store) = create_store();

        let record = store
            .record_installed(
                &meta("a", "v1"),
                InstallDetails {
                    local_path: None,
                    rollback_timeout_ms: Some(5000),
                },
            )
            .unwrap();
        assert!(record.is_pending);

        assert!(store.mark_confirmed(record.identity()).unwrap());
        assert!(!store.current().unwrap().unwrap().is_pending);
        // Confirming again changes nothing
        assert!(!store.mark_confirmed(record.identity()).unwrap());
    }

    #[test]
    fn test_mark_confirmed_ignores_stale_identity() {
        let (_dir, store) = create_store();
        let details = InstallDetails {
            local_path: None,
            rollback_timeout_ms: Some(1000),
        };
        store.record_installed(&meta("a", "v1"), details).unwrap();

        let other = PackageIdentity::new("zzz", "1.0.0", "keyA");
        assert!(!store.mark_confirmed(&other).unwrap());
        assert!(store.current().unwrap().unwrap().is_pending);
    }

    #[test]
    fn test_blacklist_is_idempotent() {
        let (_dir, store) = create_store();
        let identity = PackageIdentity::new("hashB", "1.0.0", "keyA");

        for _ in 0..3 {
            store.blacklist(&identity).unwrap();
            assert!(store.is_blacklisted(&identity).unwrap());
        }
        assert_eq!(store.failed_updates().unwrap(), vec![identity]);
    }

    #[test]
    fn test_revert_to_previous_blacklists_failed_package() {
        let (_dir, store) = create_store();
        store.record_installed(&meta("a", "v1"), InstallDetails::default()).unwrap();
        let failed = meta("b", "v2");
        store.record_installed(&failed, InstallDetails::default()).unwrap();

        let restored = store.revert_to_previous(&failed).unwrap().unwrap();

        assert_eq!(restored.metadata.label, "v1");
        assert_eq!(store.current().unwrap().unwrap().metadata.label, "v1");
        assert!(store.previous().unwrap().is_none());
        assert!(store.is_blacklisted(&failed.identity).unwrap());
    }

    #[test]
    fn test_revert_first_install_falls_back_to_binary() {
        let (_dir, store) = create_store();
        let failed = meta("a", "v1");
        store.record_installed(&failed, InstallDetails::default()).unwrap();

        assert!(store.revert_to_previous(&failed).unwrap().is_none());
        assert!(store.current().unwrap().is_none());
    }

    #[test]
    fn test_replaced_pending_record_is_restored_confirmed() {
        let (_dir, store) = create_store();
        let pending = InstallDetails {
            local_path: None,
            rollback_timeout_ms: Some(1000),
        };
        store.record_installed(&meta("a", "v1"), pending.clone()).unwrap();
        let failed = meta("b", "v2");
        store.record_installed(&failed, pending).unwrap();

        assert!(!store.previous().unwrap().unwrap().is_pending);

        let restored = store.revert_to_previous(&failed).unwrap().unwrap();
        assert_eq!(restored.metadata.label, "v1");
        assert!(!restored.is_pending);
        assert!(!store.current().unwrap().unwrap().is_pending);
    }

    #[test]
    fn test_client_unique_id_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = PackageStore::open_in(dir.path()).unwrap().client_unique_id().unwrap();
        let again = PackageStore::open_in(dir.path()).unwrap().client_unique_id().unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, again);

        let (_other_dir, other) = create_store();
        assert_ne!(other.client_unique_id().unwrap(), first);
    }

    #[test]
    fn test_clear_blacklist_and_history() {
        let (_dir, store) = create_store();
        store.blacklist(&PackageIdentity::new("x", "1.0.0", "keyA")).unwrap();
        store.record_installed(&meta("a", "v1"), InstallDetails::default()).unwrap();

        assert_eq!(store.clear_blacklist().unwrap(), 1);
        assert!(store.failed_updates().unwrap().is_empty());

        let history = store.history().unwrap();
        assert_eq!(history[0].action, UpdateAction::BlacklistClear);
        assert_eq!(history[1].action, UpdateAction::Install);
    }
}
