// src/error.rs

use crate::platform::PlatformError;
use thiserror::Error;

/// Core error types for Updraft
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Update query or download transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Downloaded payload does not hash to the advertised value
    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Platform activation or rollback failure
    #[error("Failed to apply package: {0}")]
    Apply(#[from] PlatformError),

    /// Missing or invalid client configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another update attempt is already in flight
    #[error("An update attempt is already in progress ({0})")]
    ConcurrentUpdate(crate::lifecycle::UpdatePhase),

    /// The package being installed is already the current package
    #[error("Package {0} is already installed")]
    DuplicateInstall(String),

    /// Rollback requested after the package was confirmed
    #[error("Package {0} has already been confirmed")]
    AlreadyCommitted(String),

    /// Confirmation or rollback requested after the package was rolled back
    #[error("Package {0} has already been rolled back")]
    AlreadyRolledBack(String),

    /// Package previously failed to apply and no override was given
    #[error("Package {0} previously failed to apply")]
    Blacklisted(String),

    /// Rollback requested with no installed package
    #[error("No installed package to roll back")]
    NothingToRollBack,

    /// Malformed persisted or wire data
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A must-complete background task did not finish
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl Error {
    /// Whether an outer scheduler may retry the operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::ConcurrentUpdate(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

/// Result type alias using Updraft's Error type
pub type Result<T> = std::result::Result<T, Error>;
