//! Inference runtime seam.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::InstalledArtifact;

/// Opaque id the runtime hands out for a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeHandle(u64);

impl RuntimeHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rt-{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to load {model_id}: {reason}")]
    Load { model_id: String, reason: String },

    #[error("{model_id} needs {needed} bytes but only {available} are available")]
    OverBudget { model_id: String, needed: u64, available: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to release {handle}: {reason}")]
    Unload { handle: RuntimeHandle, reason: String },

    #[error("Unknown runtime handle {0}")]
    UnknownHandle(RuntimeHandle),
}

/// What the activation coordinator needs from an inference engine.
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Bring an installed artifact into memory.
    async fn load(&self, artifact: &InstalledArtifact) -> Result<RuntimeHandle, RuntimeError>;

    /// Release everything held for `handle`.
    async fn unload(&self, handle: RuntimeHandle) -> Result<(), RuntimeError>;

    /// Current memory pressure in `[0, 1]`.
    fn memory_pressure(&self) -> f64;

    /// One cleanup pass (cache purge, allocator trim).
    async fn trim(&self) {}

    /// Bytes held for `handle`, if the runtime tracks it.
    fn resident_bytes(&self, _handle: RuntimeHandle) -> Option<u64> {
        None
    }
}
