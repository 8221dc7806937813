// src/config.rs

//! Client configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! no file at all) is valid. Command-line flags override file values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base URL of the update service
    pub server_url: String,

    /// Update channel this client belongs to
    pub deployment_key: String,

    /// Version of the native binary the packages run on
    pub app_version: String,

    /// Identifier reported with every query; generated and stored in the
    /// database when unset
    pub client_unique_id: Option<String>,

    /// Holds the database, downloads and activated packages
    pub data_dir: PathBuf,

    pub http_timeout_secs: u64,

    /// Default rollback deadline for installs
    pub rollback_timeout_ms: Option<u32>,

    /// Interval between update checks in daemon mode
    pub check_interval_secs: u64,

    /// Command run to restart the application after an install
    pub restart_command: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            deployment_key: String::new(),
            app_version: "1.0.0".to_string(),
            client_unique_id: None,
            data_dir: PathBuf::from("/var/lib/updraft"),
            http_timeout_secs: 30,
            rollback_timeout_ms: None,
            check_interval_secs: 3600,
            restart_command: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from `path`, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Check the fields needed to talk to the update service
    pub fn validate(&self) -> Result<()> {
        if self.deployment_key.trim().is_empty() {
            return Err(Error::Configuration("deployment key is empty".to_string()));
        }
        if self.server_url.trim().is_empty() {
            return Err(Error::Configuration("server URL is empty".to_string()));
        }
        if self.app_version.trim().is_empty() {
            return Err(Error::Configuration("app version is empty".to_string()));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }
}
