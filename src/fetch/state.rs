//! Published download state.

use serde::{Deserialize, Serialize};

use super::error::FetchError;
use super::progress::FileProgress;
use crate::error::{ErrorKind, Remediation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single cause attached to a `Failed` or `Cancelled` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
    pub remediation: Remediation,
    pub file: Option<String>,
    pub status: Option<u16>,
    pub attempts: Option<u32>,
}

impl From<&FetchError> for FailureReport {
    fn from(err: &FetchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            remediation: err.remediation(),
            file: err.file().map(str::to_string),
            status: err.status(),
            attempts: err.attempts(),
        }
    }
}

/// Snapshot of one download, as seen by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadState {
    pub model_id: String,
    /// Planned files in fetch order.
    pub files: Vec<FileProgress>,
    pub overall_fraction: f64,
    pub speed_bytes_per_sec: f64,
    pub status: DownloadStatus,
    pub failure: Option<FailureReport>,
}

impl DownloadState {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            files: Vec::new(),
            overall_fraction: 0.0,
            speed_bytes_per_sec: 0.0,
            status: DownloadStatus::Pending,
            failure: None,
        }
    }

    pub fn file(&self, path: &str) -> Option<&FileProgress> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
