//! Error Taxonomy
//!
//! Every failure the orchestrator can surface. Callers branch on the variant,
//! so cryptographic failures, timeouts and integrity faults stay distinct.

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DrError>;

/// Disaster-recovery errors.
#[derive(Debug, thiserror::Error)]
pub enum DrError {
    /// Retryable disk or network fault.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Stored content hash does not match the bytes on disk.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A dump or apply utility exited unsuccessfully.
    #[error("external process `{program}` failed with code {code:?}: {stderr}")]
    ExternalProcess {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// External processes are killed at the limit; in-process stages run to
    /// completion and report the overrun afterwards.
    #[error("stage {stage} timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("session token expired")]
    ExpiredToken,

    #[error("session token failed authentication")]
    TamperedToken,

    /// A failed restore could not be fully undone.
    #[error("rollback incomplete after `{cause}`: {detail}")]
    RollbackIncomplete { cause: String, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("a {0} backup is already running")]
    LevelBusy(String),

    /// Restore and failover hold the same exclusive lock.
    #[error("another restore or failover holds the target: {0}")]
    OperationInProgress(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("admin connection pool exhausted after {attempts} attempts")]
    PoolExhausted { attempts: u32 },
}

impl DrError {
    /// Whether the next scheduled firing may reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DrError::TransientIo(_) | DrError::PoolExhausted { .. } | DrError::StageTimeout { .. }
        )
    }

    /// Whether this is one of the session-token rejections.
    pub fn is_token_rejection(&self) -> bool {
        matches!(self, DrError::ExpiredToken | DrError::TamperedToken)
    }
}

impl From<std::io::Error> for DrError {
    fn from(e: std::io::Error) -> Self {
        DrError::TransientIo(e.to_string())
    }
}

impl From<serde_json::Error> for DrError {
    fn from(e: serde_json::Error) -> Self {
        DrError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_checksum_mismatch() {
        let err = DrError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.to_string(), "checksum mismatch: expected aa, got bb");
    }

    #[test]
    fn test_io_error_is_transient() {
        let err: DrError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(err.is_transient());
        assert!(!DrError::ExpiredToken.is_transient());
    }

    #[test]
    fn test_token_rejections() {
        assert!(DrError::ExpiredToken.is_token_rejection());
        assert!(DrError::TamperedToken.is_token_rejection());
        assert!(!DrError::Decryption("x".into()).is_token_rejection());
    }
}
