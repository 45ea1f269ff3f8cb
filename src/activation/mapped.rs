//! Reference runtime that memory-maps weight files.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use memmap2::Mmap;
use parking_lot::Mutex;

use super::runtime::{InferenceRuntime, RuntimeError, RuntimeHandle};
use crate::storage::{InstalledArtifact, InstalledFile};

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

struct Loaded {
    model_id: String,
    maps: Vec<Mmap>,
}

impl Loaded {
    fn bytes(&self) -> u64 {
        self.maps.iter().map(|m| m.len() as u64).sum()
    }
}

/// Maps each weight file read-only and accounts resident bytes against a budget.
pub struct MappedRuntime {
    budget_bytes: u64,
    next_id: AtomicU64,
    loaded: Mutex<HashMap<RuntimeHandle, Loaded>>,
}

impl MappedRuntime {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: budget_bytes.max(1),
            next_id: AtomicU64::new(1),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn resident_total(&self) -> u64 {
        self.loaded.lock().values().map(Loaded::bytes).sum()
    }

    pub fn loaded_models(&self) -> Vec<String> {
        self.loaded.lock().values().map(|l| l.model_id.clone()).collect()
    }

    fn map_file(artifact: &InstalledArtifact, file: &InstalledFile) -> Result<Mmap, RuntimeError> {
        let path = artifact.path_of(file);
        let handle = File::open(&path).map_err(|source| RuntimeError::Io { path: path.clone(), source })?;
        // SAFETY: read-only mapping of a file the depot promoted atomically and
        // never rewrites in place.
        let mmap = unsafe { Mmap::map(&handle) }.map_err(|source| RuntimeError::Io { path, source })?;
        validate_header(&artifact.model_id, &file.name, &mmap)?;
        Ok(mmap)
    }
}

/// Cheap structural check of a weights header.
fn validate_header(model_id: &str, name: &str, data: &[u8]) -> Result<(), RuntimeError> {
    let bad = |reason: String| RuntimeError::Load { model_id: model_id.to_string(), reason: format!("{name}: {reason}") };
    if name.to_ascii_lowercase().ends_with(".gguf") {
        if data.len() < 4 || &data[..4] != GGUF_MAGIC {
            return Err(bad("missing GGUF magic".into()));
        }
        return Ok(());
    }

    // safetensors: u64 little-endian header length, then a JSON object.
    let Some(len_bytes) = data.get(..8) else {
        return Err(bad("shorter than a safetensors header".into()));
    };
    let mut buf = [0u8; 8];
    buf.copy_from_slice(len_bytes);
    let header_len = u64::from_le_bytes(buf);
    if header_len == 0 || header_len > (data.len() as u64).saturating_sub(8) {
        return Err(bad(format!("header length {header_len} out of range")));
    }
    if data.get(8) != Some(&b'{') {
        return Err(bad("header is not a JSON object".into()));
    }
    Ok(())
}

#[async_trait]
impl InferenceRuntime for MappedRuntime {
    async fn load(&self, artifact: &InstalledArtifact) -> Result<RuntimeHandle, RuntimeError> {
        let weights: Vec<&InstalledFile> = artifact.weight_files().collect();
        if weights.is_empty() {
            return Err(RuntimeError::Load {
                model_id: artifact.model_id.clone(),
                reason: "no weight files in artifact".into(),
            });
        }

        let needed: u64 = weights.iter().map(|f| f.size).sum();
        let resident = self.resident_total();
        let available = self.budget_bytes.saturating_sub(resident);
        if needed > available {
            return Err(RuntimeError::OverBudget { model_id: artifact.model_id.clone(), needed, available });
        }

        let maps = weights
            .iter()
            .map(|f| Self::map_file(artifact, f))
            .collect::<Result<Vec<_>, _>>()?;

        let handle = RuntimeHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.loaded.lock().insert(handle, Loaded { model_id: artifact.model_id.clone(), maps });
        tracing::debug!(model_id = %artifact.model_id, %handle, bytes = needed, "weights mapped");
        Ok(handle)
    }

    async fn unload(&self, handle: RuntimeHandle) -> Result<(), RuntimeError> {
        let removed = self.loaded.lock().remove(&handle);
        match removed {
            Some(loaded) => {
                tracing::debug!(model_id = %loaded.model_id, %handle, "weights unmapped");
                Ok(())
            }
            None => Err(RuntimeError::UnknownHandle(handle)),
        }
    }

    fn memory_pressure(&self) -> f64 {
        (self.resident_total() as f64 / self.budget_bytes as f64).clamp(0.0, 1.0)
    }

    fn resident_bytes(&self, handle: RuntimeHandle) -> Option<u64> {
        self.loaded.lock().get(&handle).map(Loaded::bytes)
    }
}
