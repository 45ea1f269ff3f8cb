//! Download orchestration.
//!
//! One job per model id. Required files run sequentially, optional files run
//! afterwards with bounded concurrency. Every transfer streams into staging and
//! is promoted by rename, so the model directory only ever holds whole files.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::FetchError;
use super::origin::RemoteOrigin;
use super::progress::ProgressTracker;
use super::reporter::{self, emit, EventSender, ProgressEvent};
use super::state::{DownloadState, DownloadStatus, FailureReport};
use super::strategy::{strategy_for, DownloadStrategy, FileSpec};
use super::transfer::{TransferContext, TransferJob};
use super::FetchConfig;
use crate::catalog::{FormatDetector, ModelRef};
use crate::storage::{InstalledArtifact, MarkerDetails, StorageManager};
use crate::telemetry::{self, DownloadSpan, SpanExt};

/// Drives download strategies and owns the set of in-flight jobs.
pub struct DownloadOrchestrator {
    origin: Arc<dyn RemoteOrigin>,
    storage: Arc<StorageManager>,
    detector: FormatDetector,
    config: FetchConfig,
    active: DashMap<String, CancellationToken>,
}

impl DownloadOrchestrator {
    pub fn new(
        origin: Arc<dyn RemoteOrigin>,
        storage: Arc<StorageManager>,
        detector: FormatDetector,
        config: FetchConfig,
    ) -> Self {
        Self {
            origin,
            storage,
            detector,
            config,
            active: DashMap::new(),
        }
    }

    pub fn origin(&self) -> &Arc<dyn RemoteOrigin> {
        &self.origin
    }

    pub fn detector(&self) -> &FormatDetector {
        &self.detector
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Detect the format and start a download with the matching strategy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, model: ModelRef) -> Result<DownloadStream, FetchError> {
        let format = self.detector.detect(&model);
        let strategy = strategy_for(format, self.config.min_weight_bytes)
            .ok_or_else(|| FetchError::NoFilesResolved(model.id().to_string()))?;
        self.start_with(model, strategy)
    }

    /// Start a download with an explicit strategy.
    pub fn start_with(
        self: &Arc<Self>,
        model: ModelRef,
        strategy: Arc<dyn DownloadStrategy>,
    ) -> Result<DownloadStream, FetchError> {
        let model_id = model.id().to_string();
        let cancel = match self.active.entry(model_id.clone()) {
            Entry::Occupied(_) => return Err(FetchError::ConcurrencyConflict(model_id)),
            Entry::Vacant(slot) => slot.insert(CancellationToken::new()).clone(),
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let tracker = ProgressTracker::new(self.config.speed_window, self.config.progress_interval);
        tokio::spawn(reporter::run(DownloadState::new(&model_id), tracker, event_rx, state_tx));

        let this = Arc::clone(self);
        let job_cancel = cancel.clone();
        let task = tokio::spawn(async move { this.run_job(model, strategy, job_cancel, event_tx).await });

        tracing::info!(model_id = %model_id, "download started");
        Ok(DownloadStream { model_id, states: state_rx, task, cancel })
    }

    /// Download to completion, discarding intermediate states.
    pub async fn download(self: &Arc<Self>, model: ModelRef) -> Result<InstalledArtifact, FetchError> {
        self.start(model)?.finish().await
    }

    /// Request cancellation. Returns false if nothing is downloading under `model_id`.
    pub fn cancel(&self, model_id: &str) -> bool {
        match self.active.get(model_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(model_id, "download cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_downloading(&self, model_id: &str) -> bool {
        self.active.contains_key(model_id)
    }

    pub fn active_downloads(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    async fn run_job(
        self: Arc<Self>,
        model: ModelRef,
        strategy: Arc<dyn DownloadStrategy>,
        cancel: CancellationToken,
        events: EventSender,
    ) -> Result<InstalledArtifact, FetchError> {
        let span = DownloadSpan::new(model.id(), strategy.format().as_str());
        let started = Instant::now();

        let result = self
            .execute(&model, strategy.as_ref(), &cancel, &events)
            .instrument(span.clone())
            .await;
        span.record_result(&result);

        if result.is_err() {
            if let Err(e) = self.storage.clear_staging(model.id()) {
                tracing::warn!(model_id = model.id(), error = %e, "failed to clear staging");
            }
        }
        self.active.remove(model.id());

        let (status, failure) = match &result {
            Ok(artifact) => {
                tracing::info!(
                    model_id = model.id(),
                    files = artifact.files.len(),
                    bytes = artifact.total_bytes(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "download completed"
                );
                (DownloadStatus::Completed, None)
            }
            Err(e @ FetchError::Cancelled) => {
                tracing::info!(model_id = model.id(), "download cancelled");
                (DownloadStatus::Cancelled, Some(FailureReport::from(e)))
            }
            Err(e) => {
                tracing::warn!(model_id = model.id(), kind = ?e.kind(), error = %e, "download failed");
                (DownloadStatus::Failed, Some(FailureReport::from(e)))
            }
        };
        telemetry::record_download_outcome(status.as_str());
        emit(&events, ProgressEvent::Finished { status, failure });
        result
    }

    async fn execute(
        &self,
        model: &ModelRef,
        strategy: &dyn DownloadStrategy,
        cancel: &CancellationToken,
        events: &EventSender,
    ) -> Result<InstalledArtifact, FetchError> {
        let id = model.id();

        let reuse_existing = match self.storage.installed(id)? {
            Some(artifact) if artifact.revision == model.revision() => {
                tracing::info!(model_id = id, revision = model.revision(), "already installed, nothing to fetch");
                let files = artifact
                    .files
                    .iter()
                    .map(|f| FileSpec { path: f.name.clone(), required: f.required, min_size: f.min_size })
                    .collect();
                emit(events, ProgressEvent::Planned(files));
                for f in &artifact.files {
                    emit(events, ProgressEvent::FileDone { file: f.name.clone(), bytes: f.size });
                }
                return Ok(artifact);
            }
            Some(artifact) => {
                tracing::info!(
                    model_id = id,
                    installed = %artifact.revision,
                    requested = model.revision(),
                    "revision changed, fetching every file again"
                );
                false
            }
            None => true,
        };
        // The marker may only reappear through `finalize`.
        if self.storage.clear_marker(id)? {
            tracing::debug!(model_id = id, "previous install marker removed");
        }

        let origin = self.origin.as_ref();
        let plan = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            plan = self.config.retry.run("plan", cancel, |_| strategy.plan_files(model, origin)) => plan?,
        };
        if plan.required().next().is_none() {
            return Err(FetchError::NoFilesResolved(id.to_string()));
        }
        tracing::debug!(
            model_id = id,
            format = %plan.format,
            files = ?plan.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            "plan resolved"
        );

        emit(events, ProgressEvent::Planned(plan.files.clone()));
        emit(events, ProgressEvent::Status(DownloadStatus::Downloading));

        for spec in plan.required() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if let Err(e) = self.fetch_file(model, spec, reuse_existing, cancel, events).await {
                emit(events, ProgressEvent::FileFailed { file: spec.path.clone() });
                return Err(e);
            }
        }

        let concurrency = self.config.optional_concurrency.max(1);
        let optional_files: Vec<FileSpec> = plan.optional().cloned().collect();
        let mut optional = futures::stream::iter(optional_files)
            .map(|spec| async move {
                let result = self.fetch_file(model, &spec, reuse_existing, cancel, events).await;
                (spec, result)
            })
            .buffer_unordered(concurrency);
        while let Some((spec, result)) = optional.next().await {
            match result {
                Ok(_) => {}
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => {
                    tracing::warn!(model_id = id, file = %spec.path, error = %e, "optional file skipped");
                    emit(events, ProgressEvent::FileSkipped { file: spec.path.clone() });
                }
            }
        }
        drop(optional);

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        emit(events, ProgressEvent::Status(DownloadStatus::Verifying));
        let details = MarkerDetails {
            repository: model.repository().to_string(),
            revision: model.revision().to_string(),
        };
        Ok(self.storage.finalize(id, plan.format, &plan.files, details)?)
    }

    /// Fetch one file into the model directory, reusing a sane existing copy
    /// when `reuse_existing` is set.
    async fn fetch_file(
        &self,
        model: &ModelRef,
        spec: &FileSpec,
        reuse_existing: bool,
        cancel: &CancellationToken,
        events: &EventSender,
    ) -> Result<u64, FetchError> {
        let id = model.id();
        let target = self.storage.file_path(id, &spec.path)?;

        let existing = match reuse_existing {
            true => tokio::fs::metadata(&target).await.ok(),
            false => None,
        };
        if let Some(meta) = existing {
            if meta.is_file() && spec.accepts_size(meta.len()) {
                tracing::debug!(model_id = id, file = %spec.path, bytes = meta.len(), "present on disk");
                emit(events, ProgressEvent::FileDone { file: spec.path.clone(), bytes: meta.len() });
                return Ok(meta.len());
            }
        }

        let staging = self.storage.staging_path(id, &spec.path)?;
        let mut job = TransferJob::new(spec.clone(), staging, target, cancel.child_token());
        let ctx = TransferContext {
            origin: self.origin.as_ref(),
            repository: model.repository(),
            revision: model.revision(),
            attempt_timeout: self.config.attempt_timeout,
            events,
        };

        let mut attempt = 1;
        let bytes = loop {
            match job.run_attempt(&ctx, attempt).await {
                Ok(bytes) => break bytes,
                Err(e) => {
                    job.discard().await;
                    self.config.retry.backoff(&spec.path, attempt, e, cancel).await?;
                    attempt += 1;
                }
            }
        };
        if let Err(e) = job.promote().await {
            job.discard().await;
            return Err(e);
        }

        tracing::info!(
            model_id = id,
            file = %spec.path,
            bytes,
            attempt,
            elapsed_ms = job.elapsed().as_millis() as u64,
            "file fetched"
        );
        emit(events, ProgressEvent::FileDone { file: spec.path.clone(), bytes });
        Ok(bytes)
    }
}

/// Consumer end of one download: a stream of [`DownloadState`]s ending with a
/// terminal state, plus the job's typed result.
pub struct DownloadStream {
    model_id: String,
    states: mpsc::Receiver<DownloadState>,
    task: JoinHandle<Result<InstalledArtifact, FetchError>>,
    cancel: CancellationToken,
}

impl DownloadStream {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Next published state; `None` after the terminal state.
    pub async fn next(&mut self) -> Option<DownloadState> {
        self.states.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain remaining states and return the job's result.
    pub async fn finish(mut self) -> Result<InstalledArtifact, FetchError> {
        while self.states.recv().await.is_some() {}
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(FetchError::Aborted(e.to_string())),
        }
    }

    /// Like [`finish`](Self::finish), handing every state to `on_state` first.
    pub async fn finish_with<F>(mut self, mut on_state: F) -> Result<InstalledArtifact, FetchError>
    where
        F: FnMut(&DownloadState),
    {
        while let Some(state) = self.states.recv().await {
            on_state(&state);
        }
        self.finish().await
    }
}

impl Stream for DownloadStream {
    type Item = DownloadState;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().states.poll_recv(cx)
    }
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream").field("model_id", &self.model_id).finish_non_exhaustive()
    }
}
