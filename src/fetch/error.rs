use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::InvalidModelId;
use crate::error::{ErrorKind, Remediation};
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{file}: not found on origin (HTTP {status})")]
    NotFound { file: String, status: u16 },

    #[error("{file}: origin requires credentials (HTTP {status})")]
    AuthRequired { file: String, status: u16 },

    #[error("{file}: {reason}")]
    Transient {
        file: String,
        reason: String,
        status: Option<u16>,
    },

    #[error("{file}: corrupt download: {reason}")]
    Corrupt { file: String, reason: String },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download already in progress for {0}")]
    ConcurrencyConflict(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    InvalidModelId(#[from] InvalidModelId),

    #[error("No downloadable files could be resolved for {0}")]
    NoFilesResolved(String),

    #[error("{file}: giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        file: String,
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },

    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("Download task aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Classify an HTTP status that is not a success.
    pub fn from_status(file: &str, status: u16) -> Self {
        let file = file.to_string();
        match status {
            401 | 403 => Self::AuthRequired { file, status },
            408 | 429 | 500..=599 => Self::Transient {
                file,
                reason: format!("HTTP {status}"),
                status: Some(status),
            },
            _ => Self::NotFound { file, status },
        }
    }

    pub fn transient(file: &str, reason: impl Into<String>) -> Self {
        Self::Transient {
            file: file.to_string(),
            reason: reason.into(),
            status: None,
        }
    }

    pub fn corrupt(file: &str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            file: file.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AuthRequired { .. } => ErrorKind::AuthRequired,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Cancelled | Self::Aborted(_) => ErrorKind::Cancelled,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::Io { .. } | Self::Client(_) => ErrorKind::Io,
            Self::Storage(e) => e.kind(),
            Self::InvalidModelId(_) | Self::NoFilesResolved(_) => ErrorKind::InvalidInput,
            Self::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    pub fn remediation(&self) -> Remediation {
        self.kind().remediation()
    }

    /// True for failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Remote file the error is about, when there is one.
    pub fn file(&self) -> Option<&str> {
        match self {
            Self::NotFound { file, .. }
            | Self::AuthRequired { file, .. }
            | Self::Transient { file, .. }
            | Self::Corrupt { file, .. }
            | Self::RetriesExhausted { file, .. } => Some(file),
            _ => None,
        }
    }

    /// HTTP status behind the error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound { status, .. } | Self::AuthRequired { status, .. } => Some(*status),
            Self::Transient { status, .. } => *status,
            Self::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Number of attempts made before giving up, when retries were involved.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchError::from_status("f", 404).kind(), ErrorKind::NotFound);
        assert_eq!(FetchError::from_status("f", 410).kind(), ErrorKind::NotFound);
        assert_eq!(FetchError::from_status("f", 401).kind(), ErrorKind::AuthRequired);
        assert_eq!(FetchError::from_status("f", 403).kind(), ErrorKind::AuthRequired);
        assert_eq!(FetchError::from_status("f", 429).kind(), ErrorKind::Transient);
        assert_eq!(FetchError::from_status("f", 408).kind(), ErrorKind::Transient);
        assert_eq!(FetchError::from_status("f", 503).kind(), ErrorKind::Transient);
        assert_eq!(FetchError::from_status("f", 400).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_exhausted_keeps_inner_kind() {
        let err = FetchError::RetriesExhausted {
            file: "model.safetensors".into(),
            attempts: 3,
            source: Box::new(FetchError::from_status("model.safetensors", 503)),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.file(), Some("model.safetensors"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_remediation_follows_kind() {
        let err = FetchError::from_status("config.json", 401);
        assert_eq!(err.remediation(), Remediation::ProvideCredentials);
    }
}
