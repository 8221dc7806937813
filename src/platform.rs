// src/platform.rs

//! Platform bridge
//!
//! The installer never touches the application's files or process directly;
//! it goes through a `PlatformBridge`. `FsPlatformBridge` keeps the active
//! package under `<root>/current` and the one it replaced under
//! `<root>/previous`, swapping them with directory renames.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Failures reported by the platform bridge
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Package payload not found: {0}")]
    MissingPackage(PathBuf),

    #[error("Failed to restart application: {0}")]
    RestartFailed(String),
}

/// Capabilities the installer needs from the host platform
pub trait PlatformBridge: Send + Sync {
    /// Make the package at `package_path` the active application code
    fn activate(&self, package_path: &Path) -> Result<(), PlatformError>;

    /// Reactivate whatever was active before the last `activate`
    fn revert_to_previous(&self) -> Result<(), PlatformError>;

    /// Restart the application so the active package is loaded
    fn restart_application(&self) -> Result<(), PlatformError>;
}

/// Directory-based bridge
pub struct FsPlatformBridge {
    root: PathBuf,
    restart_command: Option<Vec<String>>,
}

impl FsPlatformBridge {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            restart_command: None,
        }
    }

    /// Run `argv` when asked to restart the application
    pub fn with_restart_command(mut self, argv: Vec<String>) -> Self {
        self.restart_command = Some(argv).filter(|argv| !argv.is_empty());
        self
    }

    /// Directory holding the active package
    pub fn current_dir(&self) -> PathBuf {
        self.root.join("current")
    }

    /// Directory holding the package that was active before
    pub fn previous_dir(&self) -> PathBuf {
        self.root.join("previous")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl PlatformBridge for FsPlatformBridge {
    fn activate(&self, package_path: &Path) -> Result<(), PlatformError> {
        if !package_path.is_file() {
            return Err(PlatformError::MissingPackage(package_path.to_path_buf()));
        }
        let file_name = package_path
            .file_name()
            .ok_or_else(|| PlatformError::MissingPackage(package_path.to_path_buf()))?;

        // Copy into a staging directory first so a failed copy never
        // disturbs the active package
        let staging = self.staging_dir();
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)?;
        fs::copy(package_path, staging.join(file_name))?;

        let current = self.current_dir();
        if current.exists() {
            let previous = self.previous_dir();
            remove_dir_if_exists(&previous)?;
            fs::rename(&current, &previous)?;
        }
        fs::rename(&staging, &current)?;

        info!("Activated {} in {}", package_path.display(), current.display());
        Ok(())
    }

    fn revert_to_previous(&self) -> Result<(), PlatformError> {
        let current = self.current_dir();
        let previous = self.previous_dir();

        remove_dir_if_exists(&current)?;
        if previous.exists() {
            fs::rename(&previous, &current)?;
            info!("Reactivated previous package in {}", current.display());
        } else {
            info!("No previous package; falling back to the binary package");
        }
        Ok(())
    }

    fn restart_application(&self) -> Result<(), PlatformError> {
        let Some(argv) = &self.restart_command else {
            debug!("No restart command configured");
            return Ok(());
        };

        info!("Restarting application: {}", argv.join(" "));
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .status()
            .map_err(|e| PlatformError::RestartFailed(e.to_string()))?;

        if !status.success() {
            return Err(PlatformError::RestartFailed(format!(
                "{} exited with {}",
                argv[0], status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_payload(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_activate_and_revert() {
        let downloads = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bridge = FsPlatformBridge::new(root.path());

        let v1 = write_payload(downloads.path(), "v1.pkg", b"one");
        let v2 = write_payload(downloads.path(), "v2.pkg", b"two");

        bridge.activate(&v1).unwrap();
        bridge.activate(&v2).unwrap();
        assert_eq!(fs::read(bridge.current_dir().join("v2.pkg")).unwrap(), b"two");
        assert_eq!(fs::read(bridge.previous_dir().join("v1.pkg")).unwrap(), b"one");

        bridge.revert_to_previous().unwrap();
        assert_eq!(fs::read(bridge.current_dir().join("v1.pkg")).unwrap(), b"one");
        assert!(!bridge.previous_dir().exists());
    }

    #[test]
    fn test_revert_without_previous_clears_current() {
        let downloads = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bridge = FsPlatformBridge::new(root.path());

        bridge
            .activate(&write_payload(downloads.path(), "v1.pkg", b"one"))
            .unwrap();
        bridge.revert_to_previous().unwrap();

        assert!(!bridge.current_dir().exists());
    }

    #[test]
    fn test_activate_missing_payload() {
        let root = tempfile::tempdir().unwrap();
        let bridge = FsPlatformBridge::new(root.path());

        let result = bridge.activate(Path::new("/nonexistent/v1.pkg"));
        assert!(matches!(result, Err(PlatformError::MissingPackage(_))));
        assert!(!bridge.current_dir().exists());
    }

    #[test]
    fn test_restart_without_command_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let bridge = FsPlatformBridge::new(root.path()).with_restart_command(Vec::new());
        assert!(bridge.restart_application().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_restart_command_failure() {
        let root = tempfile::tempdir().unwrap();
        let bridge = FsPlatformBridge::new(root.path()).with_restart_command(vec!["false".to_string()]);
        assert!(matches!(
            bridge.restart_application(),
            Err(PlatformError::RestartFailed(_))
        ));
    }
}
