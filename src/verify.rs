// src/verify.rs

//! Package integrity verification
//!
//! A downloaded payload is hashed in full with SHA-256 and the hex digest is
//! compared against the hash the server advertised. A mismatching payload is
//! left on disk; removing it is up to the caller.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Lowercase hex SHA-256 of everything `reader` yields
pub fn hash_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Lowercase hex SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

/// Lowercase hex SHA-256 of a byte slice
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn compare(actual: String, expected: &str) -> Result<()> {
    let expected = expected.trim().to_ascii_lowercase();
    if actual.as_bytes() != expected.as_bytes() {
        return Err(Error::Integrity { expected, actual });
    }
    debug!("Checksum verified: {}", expected);
    Ok(())
}

/// Verify a downloaded file against the advertised hash
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    debug!("Verifying checksum for {}", path.display());
    compare(hash_file(path)?, expected)
}

/// Verify an in-memory payload against the advertised hash
pub fn verify_bytes(bytes: &[u8], expected: &str) -> Result<()> {
    compare(hash_bytes(bytes), expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_hash_bytes() {
        assert_eq!(hash_bytes(b"hello world"), HELLO);
    }

    #[test]
    fn test_verify_file_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(verify_file(&path, HELLO).is_ok());
        // Advertised hashes are compared case-insensitively
        assert!(verify_file(&path, &HELLO.to_uppercase()).is_ok());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"hello wor").unwrap();

        let err = verify_file(&path, HELLO).unwrap_err();
        match err {
            Error::Integrity { expected, actual } => {
                assert_eq!(expected, HELLO);
                assert_ne!(actual, HELLO);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The payload is left for inspection
        assert!(path.exists());
    }

    #[test]
    fn test_verify_bytes_mismatch() {
        assert!(verify_bytes(b"hello world", HELLO).is_ok());
        assert!(matches!(
            verify_bytes(b"hello world!", HELLO),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = verify_file(Path::new("/nonexistent/payload"), HELLO);
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
