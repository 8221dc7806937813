// src/lifecycle.rs

//! Update lifecycle orchestration
//!
//! `UpdateLifecycle` drives one update attempt at a time through
//! check -> download -> verify -> install -> pending -> commit or rollback.
//! A second attempt started while one is downloading, verifying, installing
//! or awaiting confirmation is rejected with `ConcurrentUpdate` rather than
//! queued. Installation runs on the blocking pool so dropping the caller's
//! future cannot interrupt it halfway.

use crate::acquisition::{AcquisitionClient, HttpAcquisitionClient, validate_query};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::installer::{Installer, ResumeOutcome, StageOptions};
use crate::packages::{LocalPackageRecord, PackageMetadata, RemotePayload, UpdateCheckResult};
use crate::platform::{FsPlatformBridge, PlatformBridge};
use crate::store::PackageStore;
use crate::verify;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Where the in-flight update attempt is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Installing,
    /// Installed, waiting for the application to confirm
    Pending,
}

impl UpdatePhase {
    pub fn as_str(&self) -> &str {
        match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Checking => "checking",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Installing => "installing",
            UpdatePhase::Pending => "pending",
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for `install_with`
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub rollback_timeout_ms: Option<u32>,
    /// Install even if the package previously failed to apply
    pub allow_failed: bool,
    /// Restart the application once the package is active
    pub restart: bool,
}

/// Options for `sync`
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub install: InstallOptions,
}

/// Result of a `sync`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    /// An update exists but previously failed to apply
    UpdateIgnored(PackageMetadata),
    Installed(LocalPackageRecord),
}

fn lock_phase(phase: &Mutex<UpdatePhase>) -> MutexGuard<'_, UpdatePhase> {
    phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks an attempt in flight; returns the lifecycle to idle when dropped
struct AttemptGuard {
    phase: Arc<Mutex<UpdatePhase>>,
}

impl AttemptGuard {
    fn advance(&self, next: UpdatePhase) {
        debug!("Update attempt entering {}", next);
        *lock_phase(&self.phase) = next;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        *lock_phase(&self.phase) = UpdatePhase::Idle;
    }
}

/// Orchestrates checks, downloads, installs and confirmation
pub struct UpdateLifecycle {
    config: ClientConfig,
    acquisition: Arc<dyn AcquisitionClient>,
    store: Arc<PackageStore>,
    installer: Installer,
    phase: Arc<Mutex<UpdatePhase>>,
}

impl UpdateLifecycle {
    pub fn new(
        config: ClientConfig,
        acquisition: Arc<dyn AcquisitionClient>,
        store: Arc<PackageStore>,
        bridge: Arc<dyn PlatformBridge>,
    ) -> Self {
        let installer = Installer::new(store.clone(), bridge);
        Self {
            config,
            acquisition,
            store,
            installer,
            phase: Arc::new(Mutex::new(UpdatePhase::Idle)),
        }
    }

    /// Wire up the HTTP client, the store and the filesystem bridge from `config`
    ///
    /// Without a configured client id, the one stored in the data directory
    /// is used.
    pub fn from_config(mut config: ClientConfig) -> Result<Self> {
        let store = Arc::new(PackageStore::open_in(&config.data_dir)?);
        if config.client_unique_id.as_deref().is_none_or(|id| id.trim().is_empty()) {
            config.client_unique_id = Some(store.client_unique_id()?);
        }
        let acquisition = Arc::new(HttpAcquisitionClient::new(&config)?);
        let bridge = Arc::new(
            FsPlatformBridge::new(config.packages_dir())
                .with_restart_command(config.restart_command.clone()),
        );
        Ok(Self::new(config, acquisition, store, bridge))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    /// Phase of the in-flight attempt, `Pending` while a deadline is armed
    pub fn phase(&self) -> UpdatePhase {
        let phase = *lock_phase(&self.phase);
        if phase == UpdatePhase::Idle && self.installer.awaiting_confirmation() {
            UpdatePhase::Pending
        } else {
            phase
        }
    }

    fn begin(&self, phase: UpdatePhase) -> Result<AttemptGuard> {
        let mut current = lock_phase(&self.phase);
        if *current != UpdatePhase::Idle {
            return Err(Error::ConcurrentUpdate(*current));
        }
        if self.installer.awaiting_confirmation() {
            return Err(Error::ConcurrentUpdate(UpdatePhase::Pending));
        }
        *current = phase;
        debug!("Update attempt entering {}", phase);
        Ok(AttemptGuard {
            phase: self.phase.clone(),
        })
    }

    /// The currently installed package, if any update was ever installed
    pub fn current_package(&self) -> Result<Option<LocalPackageRecord>> {
        self.store.current()
    }

    /// What to report to the update service as the running package
    fn reported_package(&self) -> Result<PackageMetadata> {
        let binary = PackageMetadata::binary_default(&self.config.app_version, &self.config.deployment_key);
        match self.store.current()? {
            // A package built for an older binary no longer applies
            Some(record) if record.identity().app_version == self.config.app_version => {
                Ok(record.metadata)
            }
            Some(record) => {
                debug!(
                    "Installed package targets app {}, binary is {}",
                    record.identity().app_version,
                    self.config.app_version
                );
                Ok(binary)
            }
            None => Ok(binary),
        }
    }

    /// Ask the update service whether a newer package exists
    ///
    /// An offered package that was rolled back before comes back with
    /// `failed_apply` set; the caller decides whether to proceed.
    pub async fn check_for_update(&self) -> Result<UpdateCheckResult> {
        let _attempt = self.begin(UpdatePhase::Checking)?;

        let current = self.reported_package()?;
        validate_query(&current)?;

        match self.acquisition.query_update(&current).await? {
            UpdateCheckResult::UpToDate => {
                info!("The application is up to date.");
                Ok(UpdateCheckResult::UpToDate)
            }
            UpdateCheckResult::UpdateForOtherVersion { app_version } => {
                info!(
                    "An update is available for app version {}; treating as up to date",
                    app_version
                );
                Ok(UpdateCheckResult::UpdateForOtherVersion { app_version })
            }
            UpdateCheckResult::UpdateAvailable(mut meta) => {
                meta.failed_apply = self.store.is_blacklisted(&meta.identity)?;
                info!(
                    "An update is available: {} ({}){}",
                    meta.label,
                    meta.identity,
                    if meta.failed_apply { ", previously failed to apply" } else { "" }
                );
                Ok(UpdateCheckResult::UpdateAvailable(meta))
            }
        }
    }

    /// Download and verify `meta`, refusing packages that failed before
    pub async fn download(&self, meta: &PackageMetadata) -> Result<RemotePayload> {
        self.download_with(meta, false).await
    }

    /// Download `meta` and check it against the advertised hash
    ///
    /// A payload that fails verification is deleted before the
    /// `Integrity` error is returned.
    pub async fn download_with(&self, meta: &PackageMetadata, allow_failed: bool) -> Result<RemotePayload> {
        let attempt = self.begin(UpdatePhase::Downloading)?;

        if !allow_failed && self.store.is_blacklisted(&meta.identity)? {
            return Err(Error::Blacklisted(meta.identity.to_string()));
        }

        let path = self
            .acquisition
            .download_package(meta, &self.config.download_dir())
            .await?;

        attempt.advance(UpdatePhase::Verifying);
        let hash_path = path.clone();
        let expected = meta.package_hash().to_string();
        let verified = tokio::task::spawn_blocking(move || verify::verify_file(&hash_path, &expected))
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?;

        if let Err(e) = verified {
            warn!("Discarding payload for {}: {}", meta.identity, e);
            if let Err(remove) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove {}: {}", path.display(), remove);
            }
            return Err(e);
        }

        Ok(RemotePayload {
            metadata: meta.clone(),
            path,
        })
    }

    /// Install a verified payload
    pub async fn install(
        &self,
        payload: RemotePayload,
        rollback_timeout_ms: Option<u32>,
    ) -> Result<LocalPackageRecord> {
        self.install_with(
            payload,
            InstallOptions {
                rollback_timeout_ms,
                ..InstallOptions::default()
            },
        )
        .await
    }

    /// Install a verified payload with explicit options
    ///
    /// Once started, installation always runs to completion even if the
    /// returned future is dropped.
    pub async fn install_with(
        &self,
        payload: RemotePayload,
        options: InstallOptions,
    ) -> Result<LocalPackageRecord> {
        let attempt = self.begin(UpdatePhase::Installing)?;
        let installer = self.installer.clone();
        let stage = StageOptions {
            rollback_timeout_ms: options.rollback_timeout_ms,
            allow_failed: options.allow_failed,
            restart: options.restart,
        };

        let task = tokio::task::spawn_blocking(move || {
            let _attempt = attempt;
            installer.stage_with(&payload, stage)
        });

        task.await.map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    /// The application started successfully on the current package
    ///
    /// Cancels the rollback deadline. A no-op when no deadline is armed.
    /// Waits on the blocking pool if an install holds the installer.
    pub async fn notify_application_ready(&self) -> Result<()> {
        let installer = self.installer.clone();
        tokio::task::spawn_blocking(move || installer.confirm())
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    /// Revert to the previous package and blacklist the current one
    pub async fn rollback(&self) -> Result<Option<LocalPackageRecord>> {
        let phase = *lock_phase(&self.phase);
        if phase == UpdatePhase::Installing {
            return Err(Error::ConcurrentUpdate(phase));
        }
        let installer = self.installer.clone();
        tokio::task::spawn_blocking(move || installer.rollback())
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    /// Re-arm the deadline of an install left pending by an earlier process
    pub async fn resume_pending(&self) -> Result<ResumeOutcome> {
        let outcome = self.installer.resume()?;
        match &outcome {
            ResumeOutcome::NothingPending => debug!("No pending install to resume"),
            ResumeOutcome::Armed(remaining) => {
                info!("Resumed pending install; {}ms left to confirm", remaining.as_millis())
            }
            ResumeOutcome::RolledBack(_) => info!("Pending install expired and was rolled back"),
        }
        Ok(outcome)
    }

    /// Forget every package that failed to apply
    pub fn clear_blacklist(&self) -> Result<usize> {
        self.store.clear_blacklist()
    }

    /// Check, download, verify and install in one call
    ///
    /// An update that failed before is skipped unless `allow_failed` is set.
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncOutcome> {
        let meta = match self.check_for_update().await? {
            UpdateCheckResult::UpdateAvailable(meta) => meta,
            UpdateCheckResult::UpToDate | UpdateCheckResult::UpdateForOtherVersion { .. } => {
                return Ok(SyncOutcome::UpToDate);
            }
        };

        if meta.failed_apply && !options.install.allow_failed {
            info!("Skipping {}: it previously failed to apply", meta.label);
            return Ok(SyncOutcome::UpdateIgnored(meta));
        }

        let payload = self.download_with(&meta, options.install.allow_failed).await?;
        let record = self.install_with(payload, options.install).await?;
        Ok(SyncOutcome::Installed(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::StaticAcquisitionClient;
    use crate::packages::PackageIdentity;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        server: Arc<StaticAcquisitionClient>,
        lifecycle: UpdateLifecycle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            server_url: "https://updates.example.com".to_string(),
            deployment_key: "keyA".to_string(),
            app_version: "1.0.0".to_string(),
            data_dir: dir.path().to_path_buf(),
            ..ClientConfig::default()
        };
        let server = Arc::new(StaticAcquisitionClient::new());
        let store = Arc::new(PackageStore::open_in(dir.path()).unwrap());
        let bridge = Arc::new(FsPlatformBridge::new(config.packages_dir()));
        let lifecycle = UpdateLifecycle::new(config, server.clone(), store, bridge);
        Fixture {
            _dir: dir,
            server,
            lifecycle,
        }
    }

    impl Fixture {
        /// Publish a package whose payload is `content`
        fn publish(&self, label: &str, content: &[u8]) -> PackageMetadata {
            let hash = verify::hash_bytes(content);
            let url = format!("https://cdn.example.com/{}", label);
            let mut meta = PackageMetadata::new(PackageIdentity::new(hash, "1.0.0", "keyA"), label);
            meta.download_url = url.clone();
            meta.package_size = content.len() as u64;
            self.server.add_payload(url, content.to_vec());
            self.server
                .set_response(UpdateCheckResult::UpdateAvailable(meta.clone()));
            meta
        }
    }

    #[tokio::test]
    async fn test_check_reports_binary_default_when_nothing_installed() {
        let f = fixture();
        assert_eq!(
            f.lifecycle.check_for_update().await.unwrap(),
            UpdateCheckResult::UpToDate
        );

        let queries = f.server.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].identity, PackageIdentity::new("", "1.0.0", "keyA"));
        assert_eq!(f.lifecycle.phase(), UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn test_update_for_other_version_is_up_to_date() {
        let f = fixture();
        f.server.set_response(UpdateCheckResult::UpdateForOtherVersion {
            app_version: "2.0.0".to_string(),
        });

        let result = f.lifecycle.check_for_update().await.unwrap();
        assert!(result.is_up_to_date());
        assert_eq!(
            f.lifecycle.sync(SyncOptions::default()).await.unwrap(),
            SyncOutcome::UpToDate
        );
    }

    #[tokio::test]
    async fn test_empty_deployment_key_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            data_dir: dir.path().to_path_buf(),
            ..ClientConfig::default()
        };
        let store = Arc::new(PackageStore::open_in(dir.path()).unwrap());
        let lifecycle = UpdateLifecycle::new(
            config,
            Arc::new(StaticAcquisitionClient::new()),
            store,
            Arc::new(FsPlatformBridge::new(dir.path().join("packages"))),
        );

        assert!(matches!(
            lifecycle.check_for_update().await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_download_install_without_timeout() {
        let f = fixture();
        let meta = f.publish("v1", b"bundle one");

        let offered = f.lifecycle.check_for_update().await.unwrap();
        assert_eq!(offered.update(), Some(&meta));

        let payload = f.lifecycle.download(&meta).await.unwrap();
        let record = f.lifecycle.install(payload, None).await.unwrap();
        assert!(!record.is_pending);
        assert_eq!(f.lifecycle.phase(), UpdatePhase::Idle);

        let before = f.lifecycle.current_package().unwrap();
        f.lifecycle.notify_application_ready().await.unwrap();
        assert_eq!(f.lifecycle.current_package().unwrap(), before);

        // The service stops offering what is already installed
        assert!(f.lifecycle.check_for_update().await.unwrap().is_up_to_date());
    }

    #[tokio::test]
    async fn test_tampered_payload_is_integrity_error() {
        let f = fixture();
        let meta = f.publish("v1", b"bundle one");
        f.server.add_payload(meta.download_url.clone(), b"bundle one, tampered".to_vec());

        let err = f.lifecycle.download(&meta).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(f.lifecycle.current_package().unwrap().is_none());
        let discarded = f
            .lifecycle
            .config()
            .download_dir()
            .join(format!("{}.pkg", meta.package_hash()));
        assert!(!discarded.exists());
        assert_eq!(f.lifecycle.phase(), UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn test_pending_install_blocks_new_attempts() {
        let f = fixture();
        let meta = f.publish("v1", b"bundle one");
        let payload = f.lifecycle.download(&meta).await.unwrap();
        f.lifecycle.install(payload, Some(60_000)).await.unwrap();

        assert_eq!(f.lifecycle.phase(), UpdatePhase::Pending);
        assert!(matches!(
            f.lifecycle.check_for_update().await,
            Err(Error::ConcurrentUpdate(UpdatePhase::Pending))
        ));

        f.lifecycle.notify_application_ready().await.unwrap();
        assert_eq!(f.lifecycle.phase(), UpdatePhase::Idle);
        assert!(!f.lifecycle.current_package().unwrap().unwrap().is_pending);
        assert!(f.lifecycle.check_for_update().await.is_ok());
    }

    #[tokio::test]
    async fn test_rolled_back_update_is_reported_as_failed() {
        let f = fixture();
        let v1 = f.publish("v1", b"bundle one");
        let payload = f.lifecycle.download(&v1).await.unwrap();
        f.lifecycle.install(payload, None).await.unwrap();

        let v2 = f.publish("v2", b"bundle two");
        let offered = f.lifecycle.check_for_update().await.unwrap();
        assert!(!offered.update().unwrap().failed_apply);

        let payload = f.lifecycle.download(&v2).await.unwrap();
        f.lifecycle.install(payload, Some(50)).await.unwrap();

        let mut waited = Duration::ZERO;
        while f.lifecycle.phase() == UpdatePhase::Pending && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        let current = f.lifecycle.current_package().unwrap().unwrap();
        assert_eq!(current.metadata.label, "v1");

        let offered = f.lifecycle.check_for_update().await.unwrap();
        let again = offered.update().unwrap();
        assert!(again.failed_apply);
        assert_eq!(again.identity, v2.identity);

        assert!(matches!(
            f.lifecycle.download(again).await,
            Err(Error::Blacklisted(_))
        ));
        assert_eq!(
            f.lifecycle.sync(SyncOptions::default()).await.unwrap(),
            SyncOutcome::UpdateIgnored(again.clone())
        );
    }

    #[tokio::test]
    async fn test_sync_installs_update() {
        let f = fixture();
        f.publish("v1", b"bundle one");

        match f.lifecycle.sync(SyncOptions::default()).await.unwrap() {
            SyncOutcome::Installed(record) => assert_eq!(record.metadata.label, "v1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            f.lifecycle.sync(SyncOptions::default()).await.unwrap(),
            SyncOutcome::UpToDate
        );
    }

    #[tokio::test]
    async fn test_network_failure_leaves_state_untouched() {
        let f = fixture();
        f.server.set_offline(true);

        let err = f.lifecycle.check_for_update().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.lifecycle.phase(), UpdatePhase::Idle);
        assert!(f.lifecycle.current_package().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_package_for_older_binary_is_not_reported() {
        let f = fixture();
        let old = PackageMetadata::new(PackageIdentity::new("old", "0.9.0", "keyA"), "v0");
        f.lifecycle
            .store()
            .record_installed(&old, Default::default())
            .unwrap();

        f.lifecycle.check_for_update().await.unwrap();
        assert_eq!(f.server.queries()[0].identity.package_hash, "");
    }

    #[test]
    fn test_client_id_is_stable_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            server_url: "https://updates.example.com".to_string(),
            deployment_key: "keyA".to_string(),
            data_dir: dir.path().to_path_buf(),
            ..ClientConfig::default()
        };

        let first = UpdateLifecycle::from_config(config.clone()).unwrap();
        let second = UpdateLifecycle::from_config(config.clone()).unwrap();
        let id = first.config().client_unique_id.clone().unwrap();
        assert_eq!(second.config().client_unique_id.as_deref(), Some(id.as_str()));

        let pinned = ClientConfig {
            client_unique_id: Some("device-42".to_string()),
            ..config
        };
        let third = UpdateLifecycle::from_config(pinned).unwrap();
        assert_eq!(third.config().client_unique_id.as_deref(), Some("device-42"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(UpdatePhase::Installing.to_string(), "installing");
        assert_eq!(
            Error::ConcurrentUpdate(UpdatePhase::Pending).to_string(),
            "An update attempt is already in progress (pending)"
        );
    }
}
