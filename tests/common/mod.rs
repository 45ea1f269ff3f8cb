//! Shared fixtures for integration tests: seeded origins, fast configs and a
//! scriptable inference runtime.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use gg_depot::activation::{InferenceRuntime, RuntimeError, RuntimeHandle};
use gg_depot::catalog::DetectedFormat;
use gg_depot::config::EnvConfig;
use gg_depot::fetch::{FetchConfig, FileSpec, MemoryOrigin};
use gg_depot::storage::{MarkerDetails, StorageManager};
use gg_depot::InstalledArtifact;

/// A minimal valid safetensors blob of `total` bytes.
pub fn safetensors(total: usize) -> Vec<u8> {
    let header = br#"{"__metadata__":{}}"#;
    let mut out = (header.len() as u64).to_le_bytes().to_vec();
    out.extend_from_slice(header);
    out.resize(total.max(out.len()), 0);
    out
}

/// Fetch tunables with millisecond backoff so failure paths run fast.
pub fn fast_fetch() -> FetchConfig {
    let mut fetch = FetchConfig::default();
    fetch.retry.base_delay = Duration::from_millis(1);
    fetch.retry.max_delay = Duration::from_millis(5);
    fetch.attempt_timeout = Duration::from_secs(5);
    fetch.progress_interval = Duration::from_millis(5);
    fetch
}

pub fn fast_config(models_dir: &Path) -> EnvConfig {
    let mut config = EnvConfig { models_dir: models_dir.to_path_buf(), fetch: fast_fetch(), ..EnvConfig::default() };
    config.cleanup.settle = Duration::from_millis(1);
    config
}

/// Weights, config and both tokenizer sidecars for a single-file repository.
pub fn seed_single(origin: &MemoryOrigin, repo: &str, weight_bytes: usize) {
    origin.insert(repo, "model.safetensors", safetensors(weight_bytes));
    origin.insert(repo, "config.json", r#"{"model_type":"gpt2"}"#);
    origin.insert(repo, "tokenizer.json", r#"{"version":"1.0"}"#);
    origin.insert(repo, "tokenizer_config.json", r#"{"bos_token":"<s>"}"#);
}

/// Index manifest whose weight map names `shards` unique files, each several times.
pub fn shard_index(shards: &[&str]) -> String {
    let mut entries = Vec::new();
    for (layer, shard) in shards.iter().cycle().take(shards.len() * 3).enumerate() {
        entries.push(format!("\"model.layers.{layer}.weight\": \"{shard}\""));
    }
    format!("{{\"metadata\": {{\"total_size\": 7000000000}}, \"weight_map\": {{{}}}}}", entries.join(", "))
}

pub fn seed_sharded(origin: &MemoryOrigin, repo: &str, shards: &[&str], shard_bytes: usize) {
    origin.insert(repo, "model.safetensors.index.json", shard_index(shards));
    for shard in shards {
        origin.insert(repo, shard, safetensors(shard_bytes));
    }
    origin.insert(repo, "config.json", r#"{"model_type":"qwen2"}"#);
    origin.insert(repo, "tokenizer.json", r#"{"version":"1.0"}"#);
    origin.insert(repo, "tokenizer_config.json", r#"{"eos_token":"</s>"}"#);
}

/// Lay down a single-file artifact directly on disk and write its marker.
pub fn install_local(storage: &StorageManager, model_id: &str, weight_bytes: usize) -> InstalledArtifact {
    let weights = storage.file_path(model_id, "model.safetensors").unwrap();
    std::fs::create_dir_all(weights.parent().unwrap()).unwrap();
    std::fs::write(&weights, safetensors(weight_bytes)).unwrap();
    std::fs::write(storage.file_path(model_id, "config.json").unwrap(), b"{}").unwrap();
    let plan = vec![FileSpec::required("model.safetensors", 16), FileSpec::required("config.json", 2)];
    storage
        .finalize(model_id, DetectedFormat::SingleSafetensors, &plan, MarkerDetails::default())
        .unwrap()
}

/// Scriptable runtime: tracks what is resident and reports a settable pressure.
pub struct FakeRuntime {
    next_id: AtomicU64,
    resident: Mutex<HashMap<RuntimeHandle, String>>,
    max_resident: AtomicUsize,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    trims: AtomicUsize,
    idle_pressure: Mutex<f64>,
    fail_load: Mutex<Option<String>>,
    failing_unloads: AtomicUsize,
    load_delay: Mutex<Duration>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            resident: Mutex::new(HashMap::new()),
            max_resident: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            trims: AtomicUsize::new(0),
            idle_pressure: Mutex::new(0.2),
            fail_load: Mutex::new(None),
            failing_unloads: AtomicUsize::new(0),
            load_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Pressure reported once nothing is resident.
    pub fn set_idle_pressure(&self, pressure: f64) {
        *self.idle_pressure.lock() = pressure;
    }

    pub fn fail_loads_of(&self, model_id: &str) {
        *self.fail_load.lock() = Some(model_id.to_string());
    }

    /// The next `count` unloads fail and leave the model resident.
    pub fn fail_next_unloads(&self, count: usize) {
        self.failing_unloads.store(count, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock() = delay;
    }

    pub fn resident_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.resident.lock().values().cloned().collect();
        models.sort();
        models
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn trims(&self) -> usize {
        self.trims.load(Ordering::SeqCst)
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceRuntime for FakeRuntime {
    async fn load(&self, artifact: &InstalledArtifact) -> Result<RuntimeHandle, RuntimeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_load.lock().as_deref() == Some(artifact.model_id.as_str()) {
            return Err(RuntimeError::Load {
                model_id: artifact.model_id.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        let handle = RuntimeHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let count = {
            let mut resident = self.resident.lock();
            resident.insert(handle, artifact.model_id.clone());
            resident.len()
        };
        self.max_resident.fetch_max(count, Ordering::SeqCst);
        Ok(handle)
    }

    async fn unload(&self, handle: RuntimeHandle) -> Result<(), RuntimeError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_unloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuntimeError::Unload { handle, reason: "scripted failure".to_string() });
        }
        match self.resident.lock().remove(&handle) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::UnknownHandle(handle)),
        }
    }

    fn memory_pressure(&self) -> f64 {
        if self.resident.lock().is_empty() {
            *self.idle_pressure.lock()
        } else {
            0.6
        }
    }

    async fn trim(&self) {
        self.trims.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn storage(dir: &Path) -> Arc<StorageManager> {
    let storage = StorageManager::new(dir);
    storage.ensure_root().unwrap();
    Arc::new(storage)
}
