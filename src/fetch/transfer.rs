//! Streaming one file from the origin into staging.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::error::FetchError;
use super::origin::RemoteOrigin;
use super::reporter::{emit, EventSender, ProgressEvent};
use super::strategy::FileSpec;

/// Where and how a transfer talks to the outside world.
pub(crate) struct TransferContext<'a> {
    pub origin: &'a dyn RemoteOrigin,
    pub repository: &'a str,
    pub revision: &'a str,
    /// Maximum wait for the response and for each chunk.
    pub attempt_timeout: Duration,
    pub events: &'a EventSender,
}

/// One in-flight file. Lives until the file is promoted or discarded.
#[derive(Debug)]
pub struct TransferJob {
    pub spec: FileSpec,
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
    pub started_at: Instant,
    pub cancel: CancellationToken,
    pub attempt: u32,
    staging: PathBuf,
    target: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io { path: path.to_path_buf(), source }
}

impl TransferJob {
    pub fn new(spec: FileSpec, staging: PathBuf, target: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            spec,
            bytes_written: 0,
            bytes_expected: None,
            started_at: Instant::now(),
            cancel,
            attempt: 0,
            staging,
            target,
        }
    }

    /// Run one attempt, streaming into the staging file from scratch.
    pub(crate) async fn run_attempt(&mut self, ctx: &TransferContext<'_>, attempt: u32) -> Result<u64, FetchError> {
        let file = self.spec.path.clone();
        self.attempt = attempt;
        self.bytes_written = 0;
        emit(ctx.events, ProgressEvent::Attempt { file: file.clone(), attempt });

        if let Some(parent) = self.staging.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let mut out = tokio::fs::File::create(&self.staging)
            .await
            .map_err(io_err(&self.staging))?;

        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            r = tokio::time::timeout(ctx.attempt_timeout, ctx.origin.open(ctx.repository, ctx.revision, &file)) => {
                r.map_err(|_| FetchError::transient(&file, "timed out waiting for response"))??
            }
        };
        self.bytes_expected = body.content_length;
        emit(ctx.events, ProgressEvent::Expected { file: file.clone(), bytes: body.content_length });

        let mut stream = body.stream;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                r = tokio::time::timeout(ctx.attempt_timeout, stream.next()) => r,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(FetchError::transient(
                        &file,
                        format!("no data for {}s", ctx.attempt_timeout.as_secs_f32()),
                    ))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            out.write_all(&chunk).await.map_err(io_err(&self.staging))?;
            self.bytes_written += chunk.len() as u64;
            crate::telemetry::record_bytes_downloaded(chunk.len() as u64);
            emit(
                ctx.events,
                ProgressEvent::Sample { file: file.clone(), bytes: chunk.len() as u64, at: Instant::now() },
            );
        }
        out.flush().await.map_err(io_err(&self.staging))?;
        drop(out);

        if let Some(expected) = self.bytes_expected {
            if self.bytes_written != expected {
                return Err(FetchError::transient(
                    &file,
                    format!("truncated body: {} of {} bytes", self.bytes_written, expected),
                ));
            }
        }
        if !self.spec.accepts_size(self.bytes_written) {
            return Err(FetchError::corrupt(
                &file,
                format!(
                    "{} bytes is below the {} byte minimum",
                    self.bytes_written,
                    self.spec.min_size.unwrap_or(1)
                ),
            ));
        }
        Ok(self.bytes_written)
    }

    /// Atomically move the finished staging file into place.
    pub async fn promote(&self) -> Result<(), FetchError> {
        if let Some(parent) = self.target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        tokio::fs::rename(&self.staging, &self.target)
            .await
            .map_err(io_err(&self.target))
    }

    /// Remove whatever the last attempt left in staging.
    pub async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.staging.display(), error = %e, "failed to discard staging file");
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fetch::origin::{Fault, MemoryOrigin};
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        staging: PathBuf,
        target: PathBuf,
        origin: MemoryOrigin,
        events: EventSender,
        _rx: mpsc::UnboundedReceiver<ProgressEvent>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(".staging/m/model.safetensors");
        let target = dir.path().join("m/model.safetensors");
        let (events, rx) = mpsc::unbounded_channel();
        Fixture { staging, target, origin: MemoryOrigin::new().with_chunk_size(100), events, _rx: rx, _dir: dir }
    }

    fn ctx<'a>(f: &'a Fixture, timeout: Duration) -> TransferContext<'a> {
        TransferContext {
            origin: &f.origin,
            repository: "org/m",
            revision: "main",
            attempt_timeout: timeout,
            events: &f.events,
        }
    }

    #[tokio::test]
    async fn test_streams_then_promotes() {
        let f = fixture();
        f.origin.insert("org/m", "model.safetensors", vec![7u8; 2048]);
        let mut job = TransferJob::new(
            FileSpec::required("model.safetensors", 1024),
            f.staging.clone(),
            f.target.clone(),
            CancellationToken::new(),
        );
        let n = job.run_attempt(&ctx(&f, Duration::from_secs(5)), 1).await.unwrap();
        assert_eq!(n, 2048);
        assert!(!f.target.exists());
        job.promote().await.unwrap();
        assert_eq!(std::fs::metadata(&f.target).unwrap().len(), 2048);
        assert!(!f.staging.exists());
    }

    #[tokio::test]
    async fn test_undersized_file_is_corrupt() {
        let f = fixture();
        f.origin.insert("org/m", "model.safetensors", vec![1u8; 10]);
        let mut job = TransferJob::new(
            FileSpec::required("model.safetensors", 1024),
            f.staging.clone(),
            f.target.clone(),
            CancellationToken::new(),
        );
        let err = job.run_attempt(&ctx(&f, Duration::from_secs(5)), 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn test_truncated_body_is_transient() {
        let f = fixture();
        f.origin.insert("org/m", "model.safetensors", vec![1u8; 4096]);
        f.origin.set_fault("org/m", "model.safetensors", Fault::Truncate(1500));
        let mut job = TransferJob::new(
            FileSpec::required("model.safetensors", 1024),
            f.staging.clone(),
            f.target.clone(),
            CancellationToken::new(),
        );
        let err = job.run_attempt(&ctx(&f, Duration::from_secs(5)), 1).await.unwrap_err();
        assert!(err.is_transient());
        job.discard().await;
        assert!(!f.staging.exists());
    }

    #[tokio::test]
    async fn test_stall_times_out() {
        let f = fixture();
        f.origin.insert("org/m", "model.safetensors", vec![1u8; 4096]);
        f.origin.set_fault("org/m", "model.safetensors", Fault::Stall);
        let mut job = TransferJob::new(
            FileSpec::required("model.safetensors", 1024),
            f.staging.clone(),
            f.target.clone(),
            CancellationToken::new(),
        );
        let err = job.run_attempt(&ctx(&f, Duration::from_millis(50)), 1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cancel_stops_transfer() {
        let f = fixture();
        f.origin.insert("org/m", "model.safetensors", vec![1u8; 4096]);
        f.origin.set_fault("org/m", "model.safetensors", Fault::Stall);
        let cancel = CancellationToken::new();
        let mut job = TransferJob::new(
            FileSpec::required("model.safetensors", 1024),
            f.staging.clone(),
            f.target.clone(),
            cancel.clone(),
        );
        cancel.cancel();
        let err = job.run_attempt(&ctx(&f, Duration::from_secs(5)), 1).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }
}
