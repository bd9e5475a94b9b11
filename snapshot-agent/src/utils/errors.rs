//! Error types for snapshot creation, verification and restore.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::engine::manifest::Mismatch;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error at {}: {source}", path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Integrity verification failed for backup {backup_id}: {} mismatched file(s)", mismatches.len())]
    VerificationFailed {
        backup_id: String,
        mismatches: Vec<Mismatch>,
    },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse error category, stable enough for an API layer to map onto
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Integrity,
    Authentication,
    NotFound,
    Configuration,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Io => "io",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl BackupError {
    /// Attach the offending path to an I/O error.
    pub fn at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::PathIo {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Io(_) | BackupError::PathIo { .. } | BackupError::Serialization(_) => {
                ErrorKind::Io
            }
            BackupError::Integrity(_) | BackupError::VerificationFailed { .. } => {
                ErrorKind::Integrity
            }
            BackupError::Authentication(_) => ErrorKind::Authentication,
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::Config(_) => ErrorKind::Configuration,
            BackupError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let io = BackupError::at("/data/lpm.db", std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(io.to_string().contains("/data/lpm.db"));

        assert_eq!(
            BackupError::NotFound("abc".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BackupError::Authentication("bad tag".into()).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            BackupError::VerificationFailed {
                backup_id: "abc".into(),
                mismatches: Vec::new()
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
