//! Progress reporter task.
//!
//! Transfer tasks push [`ProgressEvent`]s onto an unbounded queue. The reporter
//! owns the [`ProgressTracker`] and publishes [`DownloadState`]s on a bounded
//! channel: throttled snapshots are dropped when the consumer lags, status and
//! file transitions are always delivered.

use std::time::Instant;

use tokio::sync::mpsc;

use super::progress::ProgressTracker;
use super::state::{DownloadState, DownloadStatus, FailureReport};
use super::strategy::FileSpec;

#[derive(Debug)]
pub(crate) enum ProgressEvent {
    Planned(Vec<FileSpec>),
    Status(DownloadStatus),
    Attempt { file: String, attempt: u32 },
    Expected { file: String, bytes: Option<u64> },
    Sample { file: String, bytes: u64, at: Instant },
    FileDone { file: String, bytes: u64 },
    FileSkipped { file: String },
    FileFailed { file: String },
    Finished { status: DownloadStatus, failure: Option<FailureReport> },
}

pub(crate) type EventSender = mpsc::UnboundedSender<ProgressEvent>;

/// Fire-and-forget send; a gone reporter means nobody is listening.
pub(crate) fn emit(tx: &EventSender, event: ProgressEvent) {
    let _ = tx.send(event);
}

pub(crate) async fn run(
    mut state: DownloadState,
    mut tracker: ProgressTracker,
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
    out: mpsc::Sender<DownloadState>,
) {
    if out.send(state.clone()).await.is_err() {
        return;
    }

    while let Some(event) = events.recv().await {
        let now = Instant::now();
        let forced = match event {
            ProgressEvent::Planned(files) => {
                files.iter().for_each(|f| tracker.plan_file(f));
                true
            }
            ProgressEvent::Status(status) => {
                state.status = status;
                true
            }
            ProgressEvent::Attempt { file, attempt } => {
                tracker.start_attempt(&file, attempt);
                false
            }
            ProgressEvent::Expected { file, bytes } => {
                tracker.set_expected(&file, bytes);
                false
            }
            ProgressEvent::Sample { file, bytes, at } => {
                tracker.sample(&file, bytes, at);
                false
            }
            ProgressEvent::FileDone { file, bytes } => {
                tracker.complete(&file, bytes);
                true
            }
            ProgressEvent::FileSkipped { file } => {
                tracker.skip(&file);
                true
            }
            ProgressEvent::FileFailed { file } => {
                tracker.fail(&file);
                true
            }
            ProgressEvent::Finished { status, failure } => {
                state.status = status;
                state.failure = failure;
                true
            }
        };

        state.files = tracker.files().to_vec();
        state.overall_fraction = tracker.overall_fraction();
        state.speed_bytes_per_sec = if state.status.is_terminal() { 0.0 } else { tracker.speed_at(now) };

        if forced {
            tracker.mark_emitted(now);
            if out.send(state.clone()).await.is_err() {
                return;
            }
        } else if tracker.snapshot_due(now) {
            tracker.mark_emitted(now);
            match out.try_send(state.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }

        if state.status.is_terminal() {
            return;
        }
    }
}
