// src/packages/mod.rs

//! Package data model
//!
//! Types shared by the store, the acquisition client, the installer and the
//! lifecycle orchestrator. A package is identified by its content hash, the
//! native application version it targets, and the deployment key of the
//! update channel it was published to.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identity of a package: all three fields must match for two to be equal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageIdentity {
    pub package_hash: String,
    pub app_version: String,
    pub deployment_key: String,
}

impl PackageIdentity {
    pub fn new(
        package_hash: impl Into<String>,
        app_version: impl Into<String>,
        deployment_key: impl Into<String>,
    ) -> Self {
        Self {
            package_hash: package_hash.into(),
            app_version: app_version.into(),
            deployment_key: deployment_key.into(),
        }
    }

    /// First 12 characters of the hash, for log lines
    pub fn short_hash(&self) -> &str {
        let end = self
            .package_hash
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.package_hash.len());
        &self.package_hash[..end]
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (app {}, key {})",
            self.short_hash(),
            self.app_version,
            self.deployment_key
        )
    }
}

/// Metadata describing an installable package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    #[serde(flatten)]
    pub identity: PackageIdentity,

    /// Human-readable version tag (e.g. "v7")
    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub is_mandatory: bool,

    /// Package size in bytes
    #[serde(default)]
    pub package_size: u64,

    /// URL or local path the package is fetched from
    #[serde(default)]
    pub download_url: String,

    /// Set locally when the identity is in the blacklist; never server-sourced
    #[serde(default)]
    pub failed_apply: bool,
}

impl PackageMetadata {
    pub fn new(identity: PackageIdentity, label: impl Into<String>) -> Self {
        Self {
            identity,
            label: label.into(),
            description: String::new(),
            is_mandatory: false,
            package_size: 0,
            download_url: String::new(),
            failed_apply: false,
        }
    }

    /// Placeholder used when no update has ever been installed
    ///
    /// Reports the native binary's version and channel with an empty hash so
    /// the server can offer the first update.
    pub fn binary_default(app_version: &str, deployment_key: &str) -> Self {
        Self::new(PackageIdentity::new("", app_version, deployment_key), "")
    }

    pub fn package_hash(&self) -> &str {
        &self.identity.package_hash
    }
}

/// A package installed on this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPackageRecord {
    pub metadata: PackageMetadata,

    /// The package this one replaced; its own `previous` is always `None`
    pub previous: Option<Box<LocalPackageRecord>>,

    /// Installed but not yet confirmed by the running application
    pub is_pending: bool,

    /// Where the activated payload was staged from
    pub local_path: Option<PathBuf>,

    /// RFC 3339 install timestamp
    pub installed_at: String,

    pub rollback_timeout_ms: Option<u32>,
}

impl LocalPackageRecord {
    pub fn identity(&self) -> &PackageIdentity {
        &self.metadata.identity
    }

    /// Instant after which an unconfirmed install is reverted
    pub fn rollback_deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = self.rollback_timeout_ms?;
        let installed = DateTime::parse_from_rfc3339(&self.installed_at).ok()?;
        Some(installed.with_timezone(&Utc) + Duration::milliseconds(i64::from(timeout)))
    }
}

/// Outcome of asking the server for an update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheckResult {
    /// Nothing newer for this binary
    UpToDate,

    /// The server has an update, but only for a different native version
    UpdateForOtherVersion { app_version: String },

    /// A package is available for this binary
    UpdateAvailable(PackageMetadata),
}

impl UpdateCheckResult {
    /// The offered package, if any applies to this binary
    pub fn update(&self) -> Option<&PackageMetadata> {
        match self {
            UpdateCheckResult::UpdateAvailable(meta) => Some(meta),
            UpdateCheckResult::UpToDate | UpdateCheckResult::UpdateForOtherVersion { .. } => None,
        }
    }

    /// True for both up-to-date variants
    pub fn is_up_to_date(&self) -> bool {
        self.update().is_none()
    }
}

/// A downloaded, verified package ready to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePayload {
    pub metadata: PackageMetadata,
    pub path: PathBuf,
}
