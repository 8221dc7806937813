// src/acquisition/mod.rs

//! Update acquisition
//!
//! An `AcquisitionClient` asks the update service whether a newer package
//! exists for the installed one and fetches package payloads. Clients are
//! stateless with respect to the update lifecycle and never retry on their
//! own; retry cadence belongs to whoever schedules checks.

pub mod http;

pub use http::HttpAcquisitionClient;

use crate::error::{Error, Result};
use crate::packages::{PackageMetadata, UpdateCheckResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait AcquisitionClient: Send + Sync {
    /// Ask the service for an update to `current`
    async fn query_update(&self, current: &PackageMetadata) -> Result<UpdateCheckResult>;

    /// Fetch the payload of `meta` into `dest_dir`, returning the file path
    async fn download_package(&self, meta: &PackageMetadata, dest_dir: &Path) -> Result<PathBuf>;
}

/// Reject queries that cannot be scoped to an update channel
pub fn validate_query(current: &PackageMetadata) -> Result<()> {
    if current.identity.deployment_key.trim().is_empty() {
        return Err(Error::Configuration(
            "cannot query for updates without a deployment key".to_string(),
        ));
    }
    Ok(())
}

/// File name a payload is stored under
pub fn payload_file_name(meta: &PackageMetadata) -> String {
    let stem: String = meta
        .identity
        .package_hash
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if stem.is_empty() {
        "package.pkg".to_string()
    } else {
        format!("{}.pkg", stem)
    }
}

/// Filesystem path of a `file://` URL; `None` for anything else
pub fn local_source(download_url: &str) -> Option<PathBuf> {
    download_url
        .strip_prefix("file://")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Default)]
struct StaticState {
    response: Option<UpdateCheckResult>,
    payloads: HashMap<String, Vec<u8>>,
    queries: Vec<PackageMetadata>,
    offline: bool,
}

/// In-memory update service
///
/// Serves a fixed answer and fixed payloads keyed by download URL. Useful
/// for offline operation and as a deterministic stand-in for the network.
#[derive(Default)]
pub struct StaticAcquisitionClient {
    state: Mutex<StaticState>,
}

impl StaticAcquisitionClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer every query with `response`
    pub fn set_response(&self, response: UpdateCheckResult) {
        self.state().response = Some(response);
    }

    /// Serve `bytes` for `download_url`
    pub fn add_payload(&self, download_url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.state().payloads.insert(download_url.into(), bytes.into());
    }

    /// Fail every request with a network error while set
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Packages reported by past queries, oldest first
    pub fn queries(&self) -> Vec<PackageMetadata> {
        self.state().queries.clone()
    }
}

#[async_trait]
impl AcquisitionClient for StaticAcquisitionClient {
    async fn query_update(&self, current: &PackageMetadata) -> Result<UpdateCheckResult> {
        validate_query(current)?;
        let mut state = self.state();
        if state.offline {
            return Err(Error::Network("update service unreachable".to_string()));
        }
        state.queries.push(current.clone());

        let response = state.response.clone().unwrap_or(UpdateCheckResult::UpToDate);
        // The service never offers the package the client already runs
        if let UpdateCheckResult::UpdateAvailable(meta) = &response
            && meta.identity == current.identity
        {
            return Ok(UpdateCheckResult::UpToDate);
        }
        Ok(response)
    }

    async fn download_package(&self, meta: &PackageMetadata, dest_dir: &Path) -> Result<PathBuf> {
        let bytes = {
            let state = self.state();
            if state.offline {
                return Err(Error::Network("update service unreachable".to_string()));
            }
            state.payloads.get(&meta.download_url).cloned().ok_or_else(|| {
                Error::Network(format!("HTTP 404 Not Found from {}", meta.download_url))
            })?
        };

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(payload_file_name(meta));
        tokio::fs::write(&dest, &bytes).await?;
        debug!("Served {} bytes for {}", bytes.len(), meta.download_url);
        Ok(dest)
    }
}
