//! Error taxonomy shared by every depot layer.
//!
//! Each module owns its own `thiserror` enum; all of them classify into an
//! [`ErrorKind`] so callers can pick a [`Remediation`] without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activation::{ActivationError, RuntimeError};
use crate::config::ConfigError;
use crate::fetch::FetchError;
use crate::storage::StorageError;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Remote file absent.
    NotFound,
    /// Remote demands credentials the client does not have.
    AuthRequired,
    /// Timeouts, resets, throttling. Retried before surfacing.
    Transient,
    /// Downloaded content failed a size or manifest sanity check.
    Corrupt,
    /// Memory failed to stabilize while evicting the previous model.
    ResourceExhausted,
    /// Another activation or download is already in flight.
    ConcurrencyConflict,
    Cancelled,
    NotInstalled,
    InvalidInput,
    Io,
    Runtime,
}

/// What a caller can do about a failure. Wording is left to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    Retry,
    Redownload,
    FreeSpace,
    CheckConnectivity,
    ProvideCredentials,
    None,
}

impl ErrorKind {
    /// Default remediation for this kind of failure.
    pub fn remediation(self) -> Remediation {
        match self {
            Self::Transient => Remediation::CheckConnectivity,
            Self::AuthRequired => Remediation::ProvideCredentials,
            Self::Corrupt | Self::NotInstalled => Remediation::Redownload,
            Self::ResourceExhausted => Remediation::FreeSpace,
            Self::ConcurrencyConflict | Self::Runtime => Remediation::Retry,
            Self::NotFound | Self::Cancelled | Self::InvalidInput | Self::Io => Remediation::None,
        }
    }

    /// Returns true if a failure of this kind is worth retrying automatically.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Top-level error for the consumer-facing [`crate::Depot`] API.
#[derive(Debug, Error)]
pub enum DepotError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown model reference {0:?}: not a catalog id or owner/name repository")]
    UnknownModel(String),

    #[error("Download of {0} is still shutting down")]
    StillDownloading(String),
}

impl DepotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Activation(e) => e.kind(),
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Config(_) | Self::UnknownModel(_) => ErrorKind::InvalidInput,
            Self::StillDownloading(_) => ErrorKind::ConcurrencyConflict,
        }
    }

    pub fn remediation(&self) -> Remediation {
        self.kind().remediation()
    }
}
