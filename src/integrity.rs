//! Integrity Verifier
//!
//! SHA-256 content hashes over artifact bytes, compared before anything
//! destructive is allowed to proceed.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, error};

use crate::error::{DrError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Content hashing and comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn hash_bytes(&self, data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Stream a file through SHA-256.
    pub fn hash_file(&self, path: &Path) -> Result<String> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recompute the hash of `path` and compare it to `expected`.
    pub fn verify_file(&self, path: &Path, expected: &str) -> Result<()> {
        let actual = self.hash_file(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            error!(path = %path.display(), %expected, %actual, "Checksum mismatch");
            return Err(DrError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        debug!(path = %path.display(), "Checksum verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();

        let v = IntegrityVerifier::new();
        assert_eq!(v.hash_file(&path).unwrap(), v.hash_bytes(&data));
        assert!(v.verify_file(&path, &v.hash_bytes(&data)).is_ok());
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            IntegrityVerifier::new().hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"contents").unwrap();
        let err = IntegrityVerifier::new().verify_file(&path, "00").unwrap_err();
        assert!(matches!(err, DrError::ChecksumMismatch { .. }));
    }
}
