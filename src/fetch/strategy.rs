//! Per-format download strategies.
//!
//! A strategy decides which files make up an artifact and whether each is
//! required. The orchestrator never looks at formats; it only runs plans.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::FetchError;
use super::manifest::{is_safe_relative_path, ShardIndex};
use super::origin::{read_to_end, RemoteOrigin};
use crate::catalog::format::resolve_primary;
use crate::catalog::{DetectedFormat, ModelRef};

pub const SAFETENSORS_WEIGHTS: &str = "model.safetensors";
pub const INDEX_MANIFEST: &str = "model.safetensors.index.json";
pub const CONFIG_FILE: &str = "config.json";
pub const SIDECARS: &[&str] = &["tokenizer.json", "tokenizer_config.json"];

/// Smallest plausible JSON document (`{}`).
pub const MIN_JSON_BYTES: u64 = 2;

const MAX_INDEX_BYTES: usize = 16 * 1024 * 1024;

/// One file in a download plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path relative to the model directory; also the remote filename.
    pub path: String,
    pub required: bool,
    pub min_size: Option<u64>,
}

impl FileSpec {
    pub fn required(path: impl Into<String>, min_size: u64) -> Self {
        Self { path: path.into(), required: true, min_size: Some(min_size) }
    }

    pub fn optional(path: impl Into<String>, min_size: u64) -> Self {
        Self { path: path.into(), required: false, min_size: Some(min_size) }
    }

    /// Size sanity check shared by resume and finalize.
    pub fn accepts_size(&self, size: u64) -> bool {
        size >= self.min_size.unwrap_or(1).max(1)
    }
}

/// Resolved plan: files in fetch order plus the format actually used.
#[derive(Debug, Clone)]
pub struct Plan {
    pub format: DetectedFormat,
    pub files: Vec<FileSpec>,
}

impl Plan {
    pub fn required(&self) -> impl Iterator<Item = &FileSpec> {
        self.files.iter().filter(|f| f.required)
    }

    pub fn optional(&self) -> impl Iterator<Item = &FileSpec> {
        self.files.iter().filter(|f| !f.required)
    }
}

#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    fn format(&self) -> DetectedFormat;

    /// Resolve the ordered file plan for `model`.
    async fn plan_files(&self, model: &ModelRef, origin: &dyn RemoteOrigin) -> Result<Plan, FetchError>;

    /// Shard files listed by the format's manifest. `None` for formats without one.
    async fn resolve_manifest(
        &self,
        _model: &ModelRef,
        _origin: &dyn RemoteOrigin,
    ) -> Result<Option<Vec<FileSpec>>, FetchError> {
        Ok(None)
    }
}

/// Pick the strategy for a detected format.
pub fn strategy_for(format: DetectedFormat, min_weight_bytes: u64) -> Option<Arc<dyn DownloadStrategy>> {
    match format {
        DetectedFormat::SingleSafetensors => Some(Arc::new(SingleFileStrategy::new(min_weight_bytes))),
        DetectedFormat::MultiPartSafetensors => Some(Arc::new(MultiPartStrategy::new(min_weight_bytes))),
        DetectedFormat::SelfContainedQuantized => Some(Arc::new(SelfContainedStrategy::new(min_weight_bytes))),
        DetectedFormat::Unknown => None,
    }
}

/// Required before optional, declaration order within each tier, first
/// occurrence of a path wins (but a later required listing upgrades it).
pub fn order_plan(files: Vec<FileSpec>) -> Vec<FileSpec> {
    let mut unique: Vec<FileSpec> = Vec::with_capacity(files.len());
    for spec in files {
        match unique.iter_mut().find(|f| f.path == spec.path) {
            Some(existing) => existing.required |= spec.required,
            None => unique.push(spec),
        }
    }
    let (mut required, optional): (Vec<_>, Vec<_>) = unique.into_iter().partition(|f| f.required);
    required.extend(optional);
    required
}

fn sidecars() -> impl Iterator<Item = FileSpec> {
    SIDECARS.iter().map(|s| FileSpec::optional(*s, MIN_JSON_BYTES))
}

/// `model.safetensors` plus config and tokenizer sidecars.
#[derive(Debug, Clone)]
pub struct SingleFileStrategy {
    min_weight_bytes: u64,
}

impl SingleFileStrategy {
    pub fn new(min_weight_bytes: u64) -> Self {
        Self { min_weight_bytes }
    }

    fn plan(&self, model: &ModelRef) -> Result<Plan, FetchError> {
        let primary = resolve_primary(model, SAFETENSORS_WEIGHTS)
            .filter(|p| is_safe_relative_path(p))
            .ok_or_else(|| FetchError::NoFilesResolved(model.id().to_string()))?;

        let mut files = vec![
            FileSpec::required(primary, self.min_weight_bytes),
            FileSpec::required(CONFIG_FILE, MIN_JSON_BYTES),
        ];
        files.extend(sidecars());
        Ok(Plan { format: DetectedFormat::SingleSafetensors, files: order_plan(files) })
    }
}

#[async_trait]
impl DownloadStrategy for SingleFileStrategy {
    fn format(&self) -> DetectedFormat {
        DetectedFormat::SingleSafetensors
    }

    async fn plan_files(&self, model: &ModelRef, _origin: &dyn RemoteOrigin) -> Result<Plan, FetchError> {
        self.plan(model)
    }
}

/// Sharded safetensors assembled from the index manifest.
#[derive(Debug, Clone)]
pub struct MultiPartStrategy {
    min_weight_bytes: u64,
    fallback: SingleFileStrategy,
}

impl MultiPartStrategy {
    pub fn new(min_weight_bytes: u64) -> Self {
        Self { min_weight_bytes, fallback: SingleFileStrategy::new(min_weight_bytes) }
    }

    /// Probe for the manifest, then fetch and parse it.
    ///
    /// `Ok(None)` when the repository has no manifest. Once the probe has
    /// seen one, any failure to read or parse it is `Corrupt`.
    pub async fn fetch_index(
        &self,
        model: &ModelRef,
        origin: &dyn RemoteOrigin,
    ) -> Result<Option<ShardIndex>, FetchError> {
        let (repo, rev) = (model.repository(), model.revision());
        if !origin.probe(repo, rev, INDEX_MANIFEST).await? {
            return Ok(None);
        }

        let raw = async {
            let body = origin.open(repo, rev, INDEX_MANIFEST).await?;
            read_to_end(INDEX_MANIFEST, body, MAX_INDEX_BYTES).await
        }
        .await
        .map_err(|e| match e {
            FetchError::Cancelled => e,
            e @ FetchError::Corrupt { .. } => e,
            e => FetchError::corrupt(INDEX_MANIFEST, format!("manifest advertised but unreadable: {e}")),
        })?;

        ShardIndex::parse(&raw).map(Some)
    }

    fn shard_specs(&self, index: &ShardIndex) -> Vec<FileSpec> {
        index
            .shards
            .iter()
            .map(|s| FileSpec::required(s.clone(), self.min_weight_bytes))
            .collect()
    }
}

#[async_trait]
impl DownloadStrategy for MultiPartStrategy {
    fn format(&self) -> DetectedFormat {
        DetectedFormat::MultiPartSafetensors
    }

    async fn plan_files(&self, model: &ModelRef, origin: &dyn RemoteOrigin) -> Result<Plan, FetchError> {
        let Some(index) = self.fetch_index(model, origin).await? else {
            tracing::info!(model_id = model.id(), "no shard index, treating as single file");
            return self.fallback.plan(model);
        };
        tracing::debug!(model_id = model.id(), shards = index.shards.len(), "shard index resolved");

        let mut files = vec![FileSpec::required(INDEX_MANIFEST, MIN_JSON_BYTES)];
        files.extend(self.shard_specs(&index));
        files.push(FileSpec::required(CONFIG_FILE, MIN_JSON_BYTES));
        files.extend(sidecars());
        Ok(Plan { format: DetectedFormat::MultiPartSafetensors, files: order_plan(files) })
    }

    async fn resolve_manifest(
        &self,
        model: &ModelRef,
        origin: &dyn RemoteOrigin,
    ) -> Result<Option<Vec<FileSpec>>, FetchError> {
        Ok(self.fetch_index(model, origin).await?.map(|i| self.shard_specs(&i)))
    }
}

/// One `.gguf` file, optionally with a config.
#[derive(Debug, Clone)]
pub struct SelfContainedStrategy {
    min_weight_bytes: u64,
}

impl SelfContainedStrategy {
    pub fn new(min_weight_bytes: u64) -> Self {
        Self { min_weight_bytes }
    }
}

#[async_trait]
impl DownloadStrategy for SelfContainedStrategy {
    fn format(&self) -> DetectedFormat {
        DetectedFormat::SelfContainedQuantized
    }

    async fn plan_files(&self, model: &ModelRef, _origin: &dyn RemoteOrigin) -> Result<Plan, FetchError> {
        let primary = model
            .filename()
            .filter(|f| f.to_ascii_lowercase().ends_with(".gguf"))
            .filter(|f| is_safe_relative_path(f) && !f.contains(['*', '?', '[']))
            .ok_or_else(|| FetchError::NoFilesResolved(model.id().to_string()))?;

        let files = vec![
            FileSpec::required(primary, self.min_weight_bytes),
            FileSpec::optional(CONFIG_FILE, MIN_JSON_BYTES),
        ];
        Ok(Plan { format: DetectedFormat::SelfContainedQuantized, files: order_plan(files) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fetch::origin::{Fault, MemoryOrigin};

    fn paths(plan: &Plan) -> Vec<(&str, bool)> {
        plan.files.iter().map(|f| (f.path.as_str(), f.required)).collect()
    }

    #[tokio::test]
    async fn test_single_file_plan_for_gpt2() {
        let origin = MemoryOrigin::new();
        let model = ModelRef::from_repository("openai-community/gpt2").unwrap();
        let plan = SingleFileStrategy::new(1024).plan_files(&model, &origin).await.unwrap();
        assert_eq!(
            paths(&plan),
            vec![
                ("model.safetensors", true),
                ("config.json", true),
                ("tokenizer.json", false),
                ("tokenizer_config.json", false),
            ]
        );
        assert_eq!(origin.request_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_part_plan_uses_index() {
        let origin = MemoryOrigin::new();
        let index = r#"{"weight_map": {
            "a": "model-00001-of-00003.safetensors",
            "b": "model-00002-of-00003.safetensors",
            "c": "model-00001-of-00003.safetensors",
            "d": "model-00003-of-00003.safetensors"
        }}"#;
        origin.insert("Qwen/Qwen2.5-7B-Instruct", INDEX_MANIFEST, index.as_bytes().to_vec());
        let model = ModelRef::from_repository("Qwen/Qwen2.5-7B-Instruct").unwrap();
        let plan = MultiPartStrategy::new(1024).plan_files(&model, &origin).await.unwrap();
        assert_eq!(plan.format, DetectedFormat::MultiPartSafetensors);
        assert_eq!(
            paths(&plan),
            vec![
                (INDEX_MANIFEST, true),
                ("model-00001-of-00003.safetensors", true),
                ("model-00002-of-00003.safetensors", true),
                ("model-00003-of-00003.safetensors", true),
                ("config.json", true),
                ("tokenizer.json", false),
                ("tokenizer_config.json", false),
            ]
        );
    }

    #[tokio::test]
    async fn test_multi_part_falls_back_without_index() {
        let origin = MemoryOrigin::new();
        let model = ModelRef::from_repository("org/big").unwrap();
        let strategy = MultiPartStrategy::new(1024);
        let plan = strategy.plan_files(&model, &origin).await.unwrap();
        assert_eq!(plan.format, DetectedFormat::SingleSafetensors);
        assert_eq!(plan.files[0].path, SAFETENSORS_WEIGHTS);
        assert!(strategy.resolve_manifest(&model, &origin).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multi_part_unreadable_index_fails_fast() {
        let origin = MemoryOrigin::new();
        origin.insert("org/big", INDEX_MANIFEST, &b"{\"weight_map\": "[..]);
        let model = ModelRef::from_repository("org/big").unwrap();
        let err = MultiPartStrategy::new(1024).plan_files(&model, &origin).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        origin.insert("org/big", INDEX_MANIFEST, &b"{}"[..]);
        origin.set_fault("org/big", INDEX_MANIFEST, Fault::FailTimes(5));
        let err = MultiPartStrategy::new(1024).plan_files(&model, &origin).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn test_self_contained_plan() {
        let origin = MemoryOrigin::new();
        let model = ModelRef::from_repository("TheBloke/TinyLlama-GGUF")
            .unwrap()
            .with_filename("tinyllama.Q4_K_M.gguf");
        let plan = SelfContainedStrategy::new(1024).plan_files(&model, &origin).await.unwrap();
        assert_eq!(paths(&plan), vec![("tinyllama.Q4_K_M.gguf", true), ("config.json", false)]);

        let no_file = ModelRef::from_repository("org/x").unwrap();
        assert!(SelfContainedStrategy::new(1024).plan_files(&no_file, &origin).await.is_err());
    }

    #[test]
    fn test_order_plan_dedupes_and_partitions() {
        let files = vec![
            FileSpec::optional("tokenizer.json", 2),
            FileSpec::required("a", 1),
            FileSpec::optional("b", 1),
            FileSpec::required("tokenizer.json", 2),
            FileSpec::required("a", 1),
            FileSpec::required("c", 1),
        ];
        let ordered = order_plan(files);
        let got: Vec<_> = ordered.iter().map(|f| (f.path.as_str(), f.required)).collect();
        assert_eq!(got, vec![("tokenizer.json", true), ("a", true), ("c", true), ("b", false)]);
    }

    #[test]
    fn test_unknown_has_no_strategy() {
        assert!(strategy_for(DetectedFormat::Unknown, 1).is_none());
        for f in [
            DetectedFormat::SingleSafetensors,
            DetectedFormat::MultiPartSafetensors,
            DetectedFormat::SelfContainedQuantized,
        ] {
            assert_eq!(strategy_for(f, 1).unwrap().format(), f);
        }
    }
}
