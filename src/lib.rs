//! GG-DEPOT
//!
//! Acquires model artifacts from a remote registry into a local models
//! directory and keeps at most one of them resident in an inference runtime.
//!
//! # Pipeline
//!
//! - **Catalog**: immutable [`ModelRef`]s and format detection.
//! - **Fetch**: one download strategy per format, resumable transfers with
//!   retry, and a throttled stream of [`DownloadState`]s.
//! - **Storage**: the on-disk tree; an artifact counts as installed only once
//!   its marker file has been written after full verification.
//! - **Activation**: a single-writer state machine that unloads the previous
//!   model and waits for memory to settle before loading the next.
//!
//! [`Depot`] wires these together behind one handle.

pub mod activation;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod storage;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use activation::{ActivationCoordinator, InferenceRuntime, MappedRuntime};
use fetch::{DownloadOrchestrator, HttpOrigin, RemoteOrigin};
use storage::{ArtifactReport, StorageManager, StorageUsage};

pub use activation::ActiveModelHandle;
pub use catalog::{DetectedFormat, ModelRef};
pub use config::EnvConfig;
pub use error::{DepotError, ErrorKind, Remediation};
pub use fetch::{DownloadState, DownloadStatus, DownloadStream};
pub use storage::InstalledArtifact;

/// How long `delete` waits for a cancelled download to release its files.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const CANCEL_DRAIN_POLL: Duration = Duration::from_millis(20);

/// The depot instance: storage, downloads and the active model.
pub struct Depot {
    config: EnvConfig,
    storage: Arc<StorageManager>,
    orchestrator: Arc<DownloadOrchestrator>,
    coordinator: ActivationCoordinator,
}

impl Depot {
    /// Create a depot over an explicit origin and runtime.
    pub fn new(
        config: EnvConfig,
        origin: Arc<dyn RemoteOrigin>,
        runtime: Arc<dyn InferenceRuntime>,
    ) -> Result<Self, DepotError> {
        let storage = Arc::new(StorageManager::new(config.models_dir.clone()));
        storage.ensure_root()?;
        let orchestrator = Arc::new(DownloadOrchestrator::new(
            origin,
            Arc::clone(&storage),
            config.detector()?,
            config.fetch_config(),
        ));
        let coordinator = ActivationCoordinator::new(Arc::clone(&storage), runtime, config.cleanup_policy());

        tracing::debug!(models_dir = %config.models_dir.display(), origin = %config.origin, "depot ready");
        Ok(Self { config, storage, orchestrator, coordinator })
    }

    /// Production wiring: HTTP origin and the memory-mapping runtime.
    pub fn with_http(config: EnvConfig) -> Result<Self, DepotError> {
        let origin = HttpOrigin::new(&config.origin, config.token.clone(), config.fetch.attempt_timeout)?;
        let runtime = MappedRuntime::new(config.memory_budget);
        Self::new(config, Arc::new(origin), Arc::new(runtime))
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn orchestrator(&self) -> &Arc<DownloadOrchestrator> {
        &self.orchestrator
    }

    /// Turn a catalog id, `owner/name` or `owner/name@revision` into a reference.
    pub fn resolve(&self, reference: &str) -> Result<ModelRef, DepotError> {
        let unknown = || DepotError::UnknownModel(reference.to_string());
        let (name, revision) = match reference.split_once('@') {
            Some((name, rev)) if !rev.is_empty() => (name, Some(rev)),
            Some(_) => return Err(unknown()),
            None => (reference, None),
        };

        let model = if let Some(entry) = catalog::find(name) {
            entry.to_model_ref().map_err(|_| unknown())?
        } else if name.split('/').filter(|s| !s.is_empty()).count() == 2 {
            ModelRef::from_repository(name).map_err(|_| unknown())?
        } else {
            return Err(unknown());
        };
        Ok(model.with_revision(revision.unwrap_or(self.config.revision.as_str())))
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledArtifact>, DepotError> {
        Ok(self.storage.list_installed()?)
    }

    /// Start downloading `model`. Must be called from within a tokio runtime.
    pub fn download(&self, model: ModelRef) -> Result<DownloadStream, DepotError> {
        Ok(self.orchestrator.start(model)?)
    }

    /// Request cancellation of an in-flight download.
    pub fn cancel(&self, model_id: &str) -> bool {
        self.orchestrator.cancel(model_id)
    }

    pub async fn activate(&self, model_id: &str) -> Result<ActiveModelHandle, DepotError> {
        Ok(self.coordinator.activate(model_id).await?)
    }

    pub async fn deactivate(&self) -> Result<bool, DepotError> {
        Ok(self.coordinator.deactivate().await?)
    }

    pub fn active(&self) -> Option<ActiveModelHandle> {
        self.coordinator.active()
    }

    /// Remove a model: cancel its download, unload it if active, delete its files.
    pub async fn delete(&self, model_id: &str) -> Result<bool, DepotError> {
        catalog::validate_model_id(model_id).map_err(|_| DepotError::UnknownModel(model_id.to_string()))?;

        if self.orchestrator.cancel(model_id) {
            self.wait_download_released(model_id).await?;
        }
        self.coordinator.deactivate_model(model_id).await?;

        let removed = self.storage.remove(model_id)?;
        tracing::info!(model_id, removed, "model deleted");
        Ok(removed)
    }

    async fn wait_download_released(&self, model_id: &str) -> Result<(), DepotError> {
        let deadline = tokio::time::Instant::now() + CANCEL_DRAIN_TIMEOUT;
        while self.orchestrator.is_downloading(model_id) {
            if tokio::time::Instant::now() >= deadline {
                return Err(DepotError::StillDownloading(model_id.to_string()));
            }
            tokio::time::sleep(CANCEL_DRAIN_POLL).await;
        }
        Ok(())
    }

    pub fn usage(&self) -> Result<StorageUsage, DepotError> {
        Ok(self.storage.usage()?)
    }

    /// Detect the format of `model`, probing the origin when metadata is inconclusive.
    pub async fn detect(&self, model: &ModelRef) -> DetectedFormat {
        self.orchestrator
            .detector()
            .detect_with_probe(model, self.orchestrator.origin().as_ref())
            .await
    }

    pub fn inspect(&self, model_id: &str) -> Result<ArtifactReport, DepotError> {
        Ok(self.storage.inspect(model_id)?)
    }
}

impl std::fmt::Debug for Depot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Depot")
            .field("models_dir", &self.config.models_dir)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}
