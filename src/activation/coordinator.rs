//! Single-model activation state machine.
//!
//! ```text
//! Idle ─activate─▶ Preparing ─▶ Loading ─▶ Ready ─deactivate─▶ Unloading ─▶ Idle
//!                      │            │
//!                      └────────────┴──▶ Failed
//! ```
//!
//! The previous model is unloaded and memory is reclaimed before the next one
//! is loaded, so at most one model is ever resident. Requests that arrive
//! while a transition is in flight are rejected, never queued.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;

use super::cleanup::{reclaim, CleanupPolicy};
use super::runtime::{InferenceRuntime, RuntimeError, RuntimeHandle};
use crate::catalog::{validate_model_id, DetectedFormat, InvalidModelId};
use crate::error::ErrorKind;
use crate::storage::{StorageError, StorageManager};
use crate::telemetry::{self, ActivationSpan, SpanExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPhase {
    Idle,
    Preparing,
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl ActivationPhase {
    /// A transition is running; new requests are rejected.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Preparing | Self::Loading | Self::Unloading)
    }
}

impl std::fmt::Display for ActivationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("Activation of {requested} rejected: coordinator is {phase}")]
    ConcurrencyConflict {
        requested: String,
        phase: ActivationPhase,
        busy_with: Option<String>,
    },

    #[error("Model not installed: {0}")]
    NotInstalled(String),

    #[error(transparent)]
    InvalidModelId(#[from] InvalidModelId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Memory did not settle after {rounds} cleanup rounds (pressure {pressure:.2} > {threshold:.2})")]
    ResourceExhausted { pressure: f64, threshold: f64, rounds: u32 },

    #[error("Runtime failed to load {model_id}: {source}")]
    Load {
        model_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Runtime failed to unload {model_id}: {source}")]
    Unload {
        model_id: String,
        #[source]
        source: RuntimeError,
    },
}

impl ActivationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::NotInstalled(_) => ErrorKind::NotInstalled,
            Self::InvalidModelId(_) => ErrorKind::InvalidInput,
            Self::Storage(e) => e.kind(),
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Load { .. } | Self::Unload { .. } => ErrorKind::Runtime,
        }
    }
}

/// The resident model. Only the coordinator creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveModelHandle {
    model_id: String,
    runtime_handle: RuntimeHandle,
    generation: u64,
    root: PathBuf,
    format: DetectedFormat,
    activated_at: DateTime<Utc>,
}

impl ActiveModelHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn runtime_handle(&self) -> RuntimeHandle {
        self.runtime_handle
    }

    /// Increases with every successful activation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn format(&self) -> DetectedFormat {
        self.format
    }

    pub fn activated_at(&self) -> DateTime<Utc> {
        self.activated_at
    }
}

#[derive(Debug)]
struct Inner {
    phase: ActivationPhase,
    target: Option<String>,
    active: Option<ActiveModelHandle>,
    /// Taken out of `active` but not yet confirmed released by the runtime.
    pending_unload: Option<ActiveModelHandle>,
}

impl Inner {
    /// Phase implied by what is resident, used when a transition is abandoned.
    fn settled_phase(&self) -> ActivationPhase {
        if self.pending_unload.is_some() {
            ActivationPhase::Failed
        } else if self.active.is_some() {
            ActivationPhase::Ready
        } else {
            ActivationPhase::Idle
        }
    }
}

/// Owns the busy phase for one transition.
///
/// Dropped without `finish` (the caller's future was cancelled mid-await), it
/// settles the phase from what is resident so the coordinator never stays busy.
struct Transition<'a> {
    inner: &'a Mutex<Inner>,
    finished: bool,
}

impl<'a> Transition<'a> {
    fn new(inner: &'a Mutex<Inner>) -> Self {
        Self { inner, finished: false }
    }

    fn set_phase(&self, phase: ActivationPhase) {
        self.inner.lock().phase = phase;
    }

    fn finish(mut self, phase: ActivationPhase) {
        self.finished = true;
        let mut inner = self.inner.lock();
        inner.phase = phase;
        inner.target = inner.active.as_ref().map(|a| a.model_id.clone());
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut inner = self.inner.lock();
        inner.phase = inner.settled_phase();
        inner.target = inner.active.as_ref().map(|a| a.model_id.clone());
        tracing::warn!(phase = %inner.phase, "activation transition abandoned");
    }
}

/// Serializes load/unload so that no two models are resident at once.
pub struct ActivationCoordinator {
    storage: Arc<StorageManager>,
    runtime: Arc<dyn InferenceRuntime>,
    cleanup: CleanupPolicy,
    inner: Mutex<Inner>,
    generation: AtomicU64,
}

impl ActivationCoordinator {
    pub fn new(storage: Arc<StorageManager>, runtime: Arc<dyn InferenceRuntime>, cleanup: CleanupPolicy) -> Self {
        Self {
            storage,
            runtime,
            cleanup,
            inner: Mutex::new(Inner {
                phase: ActivationPhase::Idle,
                target: None,
                active: None,
                pending_unload: None,
            }),
            generation: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> ActivationPhase {
        self.inner.lock().phase
    }

    pub fn active(&self) -> Option<ActiveModelHandle> {
        self.inner.lock().active.clone()
    }

    /// A model whose unload failed and is retried before the next load.
    pub fn pending_unload(&self) -> Option<String> {
        self.inner.lock().pending_unload.as_ref().map(|m| m.model_id.clone())
    }

    /// True if `handle` still refers to the resident model.
    pub fn is_current(&self, handle: &ActiveModelHandle) -> bool {
        self.inner
            .lock()
            .active
            .as_ref()
            .map_or(false, |a| a.generation == handle.generation)
    }

    fn conflict(inner: &Inner, requested: &str) -> ActivationError {
        ActivationError::ConcurrencyConflict {
            requested: requested.to_string(),
            phase: inner.phase,
            busy_with: inner.target.clone(),
        }
    }

    /// Make `model_id` the resident model, evicting whatever was there.
    pub async fn activate(&self, model_id: &str) -> Result<ActiveModelHandle, ActivationError> {
        validate_model_id(model_id)?;
        let span = ActivationSpan::new(model_id);
        let result = self.activate_inner(model_id).instrument(span.clone()).await;
        span.record_result(&result);
        telemetry::record_activation(match &result {
            Ok(_) => "ok",
            Err(e) if e.kind() == ErrorKind::ConcurrencyConflict => "rejected",
            Err(_) => "error",
        });
        result
    }

    async fn activate_inner(&self, model_id: &str) -> Result<ActiveModelHandle, ActivationError> {
        let (transition, prior_phase) = {
            let mut inner = self.inner.lock();
            if inner.phase.is_busy() {
                return Err(Self::conflict(&inner, model_id));
            }
            if let Some(active) = inner.active.as_ref().filter(|a| a.model_id == model_id) {
                tracing::debug!(model_id, "already active");
                return Ok(active.clone());
            }
            let prior = inner.phase;
            inner.phase = ActivationPhase::Preparing;
            inner.target = Some(model_id.to_string());
            (Transition::new(&self.inner), prior)
        };
        let started = Instant::now();

        let artifact = match self.storage.installed(model_id) {
            Ok(Some(artifact)) => artifact,
            outcome => {
                transition.finish(prior_phase);
                return Err(match outcome {
                    Err(e) => ActivationError::Storage(e),
                    _ => ActivationError::NotInstalled(model_id.to_string()),
                });
            }
        };

        if let Err(e) = self.evict_resident(Some(model_id)).await {
            transition.finish(ActivationPhase::Failed);
            return Err(e);
        }

        transition.set_phase(ActivationPhase::Loading);
        let runtime_handle = match self.runtime.load(&artifact).await {
            Ok(handle) => handle,
            Err(source) => {
                tracing::warn!(model_id, error = %source, "load failed");
                transition.finish(ActivationPhase::Failed);
                return Err(ActivationError::Load { model_id: model_id.to_string(), source });
            }
        };

        let handle = ActiveModelHandle {
            model_id: model_id.to_string(),
            runtime_handle,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            root: artifact.root.clone(),
            format: artifact.format,
            activated_at: Utc::now(),
        };
        self.inner.lock().active = Some(handle.clone());
        transition.finish(ActivationPhase::Ready);

        telemetry::set_active_model_bytes(
            self.runtime.resident_bytes(runtime_handle).unwrap_or_else(|| artifact.total_bytes()),
        );
        tracing::info!(
            model_id,
            generation = handle.generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model active"
        );
        Ok(handle)
    }

    /// Unload the resident model and any leftover from an earlier failed
    /// unload, then wait for memory to settle. Returns false if nothing was resident.
    ///
    /// A model stays in `pending_unload` until the runtime confirms its release,
    /// so a failed or abandoned unload is retried by the next transition.
    async fn evict_resident(&self, next: Option<&str>) -> Result<bool, ActivationError> {
        let mut evicted = false;
        loop {
            let victim = {
                let mut inner = self.inner.lock();
                let victim = match inner.pending_unload.take() {
                    Some(pending) => Some(pending),
                    None => inner.active.take(),
                };
                inner.pending_unload = victim.clone();
                victim
            };
            let Some(victim) = victim else {
                break;
            };

            tracing::info!(from = %victim.model_id, to = next.unwrap_or("none"), "unloading model");
            match self.runtime.unload(victim.runtime_handle).await {
                Ok(()) => {}
                Err(RuntimeError::UnknownHandle(handle)) => {
                    tracing::debug!(model_id = %victim.model_id, %handle, "runtime no longer holds model");
                }
                Err(source) => {
                    tracing::warn!(model_id = %victim.model_id, error = %source, "unload failed");
                    return Err(ActivationError::Unload { model_id: victim.model_id, source });
                }
            }
            self.inner.lock().pending_unload = None;
            telemetry::set_active_model_bytes(0);
            evicted = true;
        }
        if !evicted {
            return Ok(false);
        }

        match reclaim(self.runtime.as_ref(), &self.cleanup).await {
            Ok(outcome) => {
                tracing::debug!(rounds = outcome.rounds, pressure = outcome.pressure, "memory settled");
                Ok(true)
            }
            Err(outcome) => {
                tracing::warn!(
                    rounds = outcome.rounds,
                    pressure = outcome.pressure,
                    threshold = self.cleanup.threshold,
                    "memory did not settle"
                );
                Err(ActivationError::ResourceExhausted {
                    pressure: outcome.pressure,
                    threshold: self.cleanup.threshold,
                    rounds: outcome.rounds,
                })
            }
        }
    }

    /// Unload the resident model. Returns false when nothing was active.
    pub async fn deactivate(&self) -> Result<bool, ActivationError> {
        self.deactivate_matching(None).await
    }

    /// Unload the resident model only if it is `model_id`.
    pub async fn deactivate_model(&self, model_id: &str) -> Result<bool, ActivationError> {
        self.deactivate_matching(Some(model_id)).await
    }

    async fn deactivate_matching(&self, only: Option<&str>) -> Result<bool, ActivationError> {
        let (transition, resident_id) = {
            let mut inner = self.inner.lock();
            if inner.phase.is_busy() {
                let requested = only.or(inner.target.as_deref()).unwrap_or_default().to_string();
                return Err(Self::conflict(&inner, &requested));
            }
            let resident_id = inner
                .active
                .as_ref()
                .or(inner.pending_unload.as_ref())
                .map(|m| m.model_id.clone());
            let matches = match (only, resident_id.as_deref()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(id), Some(resident)) => resident == id,
            };
            if !matches {
                if resident_id.is_none() {
                    inner.phase = ActivationPhase::Idle;
                }
                return Ok(false);
            }
            inner.phase = ActivationPhase::Unloading;
            inner.target = resident_id.clone();
            (Transition::new(&self.inner), resident_id.unwrap_or_default())
        };

        match self.evict_resident(None).await {
            Ok(_) => transition.finish(ActivationPhase::Idle),
            Err(e @ ActivationError::Unload { .. }) => {
                transition.finish(ActivationPhase::Failed);
                return Err(e);
            }
            Err(e) => {
                transition.finish(ActivationPhase::Idle);
                tracing::warn!(model_id = %resident_id, error = %e, "cleanup after unload incomplete");
            }
        }
        tracing::info!(model_id = %resident_id, "model deactivated");
        Ok(true)
    }
}

impl std::fmt::Debug for ActivationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationCoordinator").field("inner", &*self.inner.lock()).finish_non_exhaustive()
    }
}
