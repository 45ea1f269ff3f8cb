//! Model acquisition: origins, strategies, transfers and progress.

mod error;
pub mod http;
pub mod manifest;
mod orchestrator;
pub mod origin;
pub mod progress;
mod reporter;
pub mod retry;
mod state;
pub mod strategy;
mod transfer;

use std::time::Duration;

pub use error::FetchError;
pub use http::HttpOrigin;
pub use manifest::ShardIndex;
pub use orchestrator::{DownloadOrchestrator, DownloadStream};
pub use origin::{Fault, MemoryOrigin, RemoteBody, RemoteOrigin};
pub use progress::{FileProgress, FileStatus, ProgressTracker};
pub use retry::RetryPolicy;
pub use state::{DownloadState, DownloadStatus, FailureReport};
pub use strategy::{
    strategy_for, DownloadStrategy, FileSpec, MultiPartStrategy, Plan, SelfContainedStrategy,
    SingleFileStrategy,
};
pub use transfer::TransferJob;

/// Tunables for the download pipeline.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub retry: RetryPolicy,
    /// Per-attempt wait for the response and between chunks.
    pub attempt_timeout: Duration,
    /// Concurrent optional-file transfers once required files are done.
    pub optional_concurrency: usize,
    pub progress_interval: Duration,
    pub speed_window: Duration,
    /// Minimum size of a weights file.
    pub min_weight_bytes: u64,
    /// Capacity of the published state channel.
    pub progress_buffer: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(60),
            optional_concurrency: 2,
            progress_interval: progress::DEFAULT_PROGRESS_INTERVAL,
            speed_window: progress::DEFAULT_SPEED_WINDOW,
            min_weight_bytes: 1024,
            progress_buffer: 16,
        }
    }
}
