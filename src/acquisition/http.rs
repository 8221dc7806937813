// src/acquisition/http.rs

//! HTTP update service client
//!
//! `GET {server}/updateCheck?deploymentKey=..&appVersion=..&packageHash=..&label=..&clientUniqueId=..`
//!
//! The response body is one of:
//! - `{}`: up to date
//! - `{"updateAppVersion": true, "appVersion": "2.0.0"}`: update for another binary
//! - a full package description (`packageHash`, `downloadUrl`, `label`, ...)

use super::{AcquisitionClient, local_source, payload_file_name, validate_query};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::packages::{PackageIdentity, PackageMetadata, UpdateCheckResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Query parameters of an update check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuery {
    pub deployment_key: String,
    pub app_version: String,
    pub package_hash: String,
    pub label: String,
    pub client_unique_id: String,
}

impl UpdateQuery {
    pub fn new(current: &PackageMetadata, client_unique_id: &str) -> Self {
        Self {
            deployment_key: current.identity.deployment_key.clone(),
            app_version: current.identity.app_version.clone(),
            package_hash: current.identity.package_hash.clone(),
            label: current.label.clone(),
            client_unique_id: client_unique_id.to_string(),
        }
    }
}

/// Body of an update check response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateResponse {
    pub update_app_version: Option<bool>,
    pub app_version: Option<String>,
    pub deployment_key: Option<String>,
    pub description: Option<String>,
    pub download_url: Option<String>,
    pub is_mandatory: Option<bool>,
    pub label: Option<String>,
    pub package_hash: Option<String>,
    pub package_size: Option<u64>,
}

impl UpdateResponse {
    /// Classify the response relative to the package that was reported
    pub fn into_result(self, current: &PackageMetadata) -> Result<UpdateCheckResult> {
        if self.update_app_version == Some(true) {
            return Ok(UpdateCheckResult::UpdateForOtherVersion {
                app_version: self.app_version.unwrap_or_default(),
            });
        }

        let Some(package_hash) = self.package_hash.filter(|h| !h.is_empty()) else {
            return Ok(UpdateCheckResult::UpToDate);
        };

        let download_url = self
            .download_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::ParseError(format!("update {} has no downloadUrl", package_hash)))?;

        Ok(UpdateCheckResult::UpdateAvailable(PackageMetadata {
            identity: PackageIdentity {
                package_hash,
                app_version: self
                    .app_version
                    .unwrap_or_else(|| current.identity.app_version.clone()),
                deployment_key: self
                    .deployment_key
                    .unwrap_or_else(|| current.identity.deployment_key.clone()),
            },
            label: self.label.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            is_mandatory: self.is_mandatory.unwrap_or(false),
            package_size: self.package_size.unwrap_or(0),
            download_url,
            failed_apply: false,
        }))
    }
}

/// Update service client over HTTP
pub struct HttpAcquisitionClient {
    client: Client,
    server_url: String,
    client_unique_id: String,
}

impl HttpAcquisitionClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            server_url: config.server_url.clone(),
            client_unique_id: config.client_unique_id.clone().unwrap_or_default(),
        })
    }

    /// Endpoint update checks are sent to
    pub fn update_check_url(&self) -> String {
        if self.server_url.ends_with('/') {
            format!("{}updateCheck", self.server_url)
        } else {
            format!("{}/updateCheck", self.server_url)
        }
    }

    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!("HTTP {} from {}", response.status(), url)));
        }

        // Write to a temporary file first; only a complete transfer is renamed
        let partial = PartialDownload::new(dest.with_extension("tmp"));
        let mut file = tokio::fs::File::create(&partial.path).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial.path, dest).await?;
        partial.keep();
        Ok(written)
    }
}

/// Temporary download file, removed unless the transfer completed
///
/// Removal happens on drop so a failed or cancelled transfer leaves nothing behind.
struct PartialDownload {
    path: PathBuf,
    completed: bool,
}

impl PartialDownload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            completed: false,
        }
    }

    fn keep(mut self) {
        self.completed = true;
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial download {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

#[async_trait]
impl AcquisitionClient for HttpAcquisitionClient {
    async fn query_update(&self, current: &PackageMetadata) -> Result<UpdateCheckResult> {
        validate_query(current)?;

        let url = self.update_check_url();
        let query = UpdateQuery::new(current, &self.client_unique_id);
        debug!("Querying {} for {}", url, current.identity);

        let response = self.client.get(&url).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!("HTTP {} from {}", response.status(), url)));
        }

        let body = response.text().await?;
        let parsed: UpdateResponse = if body.trim().is_empty() {
            UpdateResponse::default()
        } else {
            serde_json::from_str(&body)
                .map_err(|e| Error::ParseError(format!("Invalid update response: {}", e)))?
        };

        parsed.into_result(current)
    }

    async fn download_package(&self, meta: &PackageMetadata, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(payload_file_name(meta));

        if let Some(source) = local_source(&meta.download_url) {
            info!("Copying {} to {}", source.display(), dest.display());
            tokio::fs::copy(&source, &dest).await?;
            return Ok(dest);
        }

        info!("Downloading {} to {}", meta.download_url, dest.display());
        let written = self.fetch_to_file(&meta.download_url, &dest).await?;
        info!("Downloaded {} bytes for {}", written, meta.label);
        Ok(dest)
    }
}
