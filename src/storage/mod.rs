//! Local model layout and bookkeeping.
//!
//! ```text
//! <root>/<model_id>/<remote file names>
//! <root>/<model_id>/.gg-depot.json      install marker, written last
//! <root>/.staging/<model_id>/...        in-flight transfers
//! ```
//!
//! A model is installed if and only if its marker exists and every required
//! file the marker lists is present with at least its minimum size.

mod marker;

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use marker::{InstallMarker, InstalledArtifact, InstalledFile, MARKER_FILE, MARKER_VERSION};

use crate::catalog::{validate_model_id, DetectedFormat, InvalidModelId};
use crate::error::ErrorKind;
use crate::fetch::manifest::is_safe_relative_path;
use crate::fetch::strategy::{FileSpec, INDEX_MANIFEST};

pub const STAGING_DIR: &str = ".staging";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unreadable install marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidModelId(#[from] InvalidModelId),

    #[error("Unsafe file path: {0:?}")]
    UnsafePath(String),

    #[error("{file}: {reason}")]
    Incomplete { file: String, reason: String },

    #[error("Model not installed: {0}")]
    NotInstalled(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Marker { .. } | Self::Incomplete { .. } => ErrorKind::Corrupt,
            Self::InvalidModelId(_) | Self::UnsafePath(_) => ErrorKind::InvalidInput,
            Self::NotInstalled(_) => ErrorKind::NotInstalled,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io { path: path.to_path_buf(), source }
}

/// Extra facts recorded in the marker.
#[derive(Debug, Clone, Default)]
pub struct MarkerDetails {
    pub repository: String,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub model_id: String,
    pub bytes: u64,
    pub installed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub models: Vec<ModelUsage>,
}

/// Diagnostic view of one model directory, installed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    pub model_id: String,
    pub root: PathBuf,
    pub marker_present: bool,
    pub installed: bool,
    /// `(relative path, size)` of files in the model directory.
    pub files: Vec<(String, u64)>,
    /// `(relative path, size)` of leftovers in staging.
    pub staging_files: Vec<(String, u64)>,
}

/// Owner of the on-disk model tree.
#[derive(Debug, Clone)]
pub struct StorageManager {
    root: PathBuf,
}

impl StorageManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.root).map_err(io_err(&self.root))
    }

    pub fn path_for(&self, model_id: &str) -> Result<PathBuf, StorageError> {
        validate_model_id(model_id)?;
        Ok(self.root.join(model_id))
    }

    /// Final location of `file` inside a model directory.
    pub fn file_path(&self, model_id: &str, file: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_relative_path(file) || file == MARKER_FILE {
            return Err(StorageError::UnsafePath(file.to_string()));
        }
        Ok(self.path_for(model_id)?.join(file))
    }

    pub fn staging_dir(&self, model_id: &str) -> Result<PathBuf, StorageError> {
        validate_model_id(model_id)?;
        Ok(self.root.join(STAGING_DIR).join(model_id))
    }

    pub fn staging_path(&self, model_id: &str, file: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_relative_path(file) {
            return Err(StorageError::UnsafePath(file.to_string()));
        }
        Ok(self.staging_dir(model_id)?.join(format!("{file}.part")))
    }

    pub fn marker_path(&self, model_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.path_for(model_id)?.join(MARKER_FILE))
    }

    pub fn is_installed(&self, model_id: &str) -> bool {
        matches!(self.installed(model_id), Ok(Some(_)))
    }

    /// The verified artifact, or `None` when the model is not installed.
    pub fn installed(&self, model_id: &str) -> Result<Option<InstalledArtifact>, StorageError> {
        let root = self.path_for(model_id)?;
        let marker_path = root.join(MARKER_FILE);
        let marker = match InstallMarker::read(&marker_path) {
            Ok(m) => m,
            Err(StorageError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e @ StorageError::Marker { .. }) => {
                tracing::warn!(model_id, error = %e, "ignoring unreadable install marker");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if marker.model_id != model_id {
            tracing::warn!(model_id, marker_id = %marker.model_id, "install marker belongs to another model");
            return Ok(None);
        }
        if let Some(missing) = marker.files.iter().filter(|f| f.required).find(|f| !f.verify(&root)) {
            tracing::debug!(model_id, file = %missing.name, "required file missing or undersized");
            return Ok(None);
        }
        Ok(Some(InstalledArtifact::from_marker(root, marker)))
    }

    pub fn require_installed(&self, model_id: &str) -> Result<InstalledArtifact, StorageError> {
        self.installed(model_id)?
            .ok_or_else(|| StorageError::NotInstalled(model_id.to_string()))
    }

    /// Verify the planned files and write the marker.
    ///
    /// Every required file must be present and pass its minimum size. Optional
    /// files are recorded when present. The marker is the last thing written.
    pub fn finalize(
        &self,
        model_id: &str,
        format: DetectedFormat,
        files: &[FileSpec],
        details: MarkerDetails,
    ) -> Result<InstalledArtifact, StorageError> {
        let root = self.path_for(model_id)?;
        let mut recorded = Vec::with_capacity(files.len());
        let mut index_sha256 = None;

        for spec in files {
            let path = self.file_path(model_id, &spec.path)?;
            let size = std::fs::metadata(&path).ok().filter(|m| m.is_file()).map(|m| m.len());
            match size {
                Some(size) if spec.accepts_size(size) => {
                    if format == DetectedFormat::MultiPartSafetensors && spec.path == INDEX_MANIFEST {
                        index_sha256 = Some(sha256_file(&path)?);
                    }
                    recorded.push(InstalledFile {
                        name: spec.path.clone(),
                        size,
                        required: spec.required,
                        min_size: spec.min_size,
                    });
                }
                Some(size) if spec.required => {
                    return Err(StorageError::Incomplete {
                        file: spec.path.clone(),
                        reason: format!("{size} bytes is below the minimum"),
                    });
                }
                None if spec.required => {
                    return Err(StorageError::Incomplete {
                        file: spec.path.clone(),
                        reason: "missing".to_string(),
                    });
                }
                _ => {}
            }
        }

        let marker = InstallMarker {
            version: MARKER_VERSION,
            model_id: model_id.to_string(),
            repository: details.repository,
            revision: details.revision,
            format,
            files: recorded,
            installed_at: Utc::now(),
            index_sha256,
        };
        marker.write_atomic(&root)?;
        tracing::info!(model_id, files = marker.files.len(), "install marker written");

        if let Err(e) = self.clear_staging(model_id) {
            tracing::warn!(model_id, error = %e, "failed to clear staging after install");
        }
        Ok(InstalledArtifact::from_marker(root, marker))
    }

    /// Delete a model: marker first, then files, then staging leftovers.
    ///
    /// Returns whether anything was removed. Absent models are not an error.
    pub fn remove(&self, model_id: &str) -> Result<bool, StorageError> {
        let root = self.path_for(model_id)?;
        let mut removed = false;

        let marker = root.join(MARKER_FILE);
        match std::fs::remove_file(&marker) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&marker)(e)),
        }
        match std::fs::remove_dir_all(&root) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&root)(e)),
        }
        let staging = self.staging_dir(model_id)?;
        if staging.exists() {
            self.clear_staging(model_id)?;
            removed = true;
        }

        if removed {
            tracing::info!(model_id, "model removed");
        }
        Ok(removed)
    }

    /// Delete only the install marker, leaving files in place for resume.
    /// Returns whether a marker existed.
    pub fn clear_marker(&self, model_id: &str) -> Result<bool, StorageError> {
        let marker = self.marker_path(model_id)?;
        match std::fs::remove_file(&marker) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&marker)(e)),
        }
    }

    pub fn clear_staging(&self, model_id: &str) -> Result<(), StorageError> {
        let dir = self.staging_dir(model_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    /// Model directory names under the root, sorted. Staging and hidden entries excluded.
    fn model_dirs(&self) -> Result<Vec<String>, StorageError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| validate_model_id(name).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledArtifact>, StorageError> {
        let mut out = Vec::new();
        for id in self.model_dirs()? {
            if let Some(artifact) = self.installed(&id)? {
                out.push(artifact);
            }
        }
        Ok(out)
    }

    /// Real on-disk bytes per model directory. Staging and markers excluded.
    pub fn usage(&self) -> Result<StorageUsage, StorageError> {
        let mut usage = StorageUsage::default();
        for id in self.model_dirs()? {
            let mut files = Vec::new();
            collect_files(&self.root.join(&id), "", &mut files)?;
            let bytes = files.iter().map(|(_, size)| size).sum();
            usage.total_bytes += bytes;
            usage.models.push(ModelUsage { installed: self.is_installed(&id), model_id: id, bytes });
        }
        Ok(usage)
    }

    pub fn inspect(&self, model_id: &str) -> Result<ArtifactReport, StorageError> {
        let root = self.path_for(model_id)?;
        let mut files = Vec::new();
        if root.is_dir() {
            collect_files(&root, "", &mut files)?;
        }
        let mut staging_files = Vec::new();
        let staging = self.staging_dir(model_id)?;
        if staging.is_dir() {
            collect_files(&staging, "", &mut staging_files)?;
        }
        Ok(ArtifactReport {
            model_id: model_id.to_string(),
            marker_present: root.join(MARKER_FILE).is_file(),
            installed: self.is_installed(model_id),
            root,
            files,
            staging_files,
        })
    }
}

/// Regular files under `dir`, skipping the marker and its temp file.
fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<(String, u64)>) -> Result<(), StorageError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(Result::ok)
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if prefix.is_empty() && name.starts_with(MARKER_FILE) {
            continue;
        }
        let rel = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path).map_err(io_err(&path))?;
        if meta.is_dir() {
            collect_files(&path, &rel, out)?;
        } else if meta.is_file() {
            out.push((rel, meta.len()));
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, StorageError> {
    let mut file = std::fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err(path))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, len: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![b'x'; len]).unwrap();
    }

    fn gpt2_plan() -> Vec<FileSpec> {
        vec![
            FileSpec::required("model.safetensors", 1024),
            FileSpec::required("config.json", 2),
            FileSpec::optional("tokenizer.json", 2),
            FileSpec::optional("tokenizer_config.json", 2),
        ]
    }

    #[test]
    fn test_not_installed_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        write(&storage.file_path("gpt2", "model.safetensors").unwrap(), 4096);
        write(&storage.file_path("gpt2", "config.json").unwrap(), 10);
        assert!(!storage.is_installed("gpt2"));
    }

    #[test]
    fn test_finalize_records_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        write(&storage.file_path("gpt2", "model.safetensors").unwrap(), 4096);
        write(&storage.file_path("gpt2", "config.json").unwrap(), 10);
        write(&storage.file_path("gpt2", "tokenizer.json").unwrap(), 20);

        let artifact = storage
            .finalize("gpt2", DetectedFormat::SingleSafetensors, &gpt2_plan(), MarkerDetails::default())
            .unwrap();
        assert_eq!(artifact.files.len(), 3);
        assert!(storage.is_installed("gpt2"));
        assert_eq!(storage.usage().unwrap().total_bytes, 4096 + 10 + 20);
    }

    #[test]
    fn test_finalize_rejects_missing_or_small_required() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        write(&storage.file_path("gpt2", "model.safetensors").unwrap(), 10);
        write(&storage.file_path("gpt2", "config.json").unwrap(), 10);
        let err = storage
            .finalize("gpt2", DetectedFormat::SingleSafetensors, &gpt2_plan(), MarkerDetails::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(!storage.marker_path("gpt2").unwrap().exists());
    }

    #[test]
    fn test_deleting_required_file_uninstalls() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        write(&storage.file_path("gpt2", "model.safetensors").unwrap(), 4096);
        write(&storage.file_path("gpt2", "config.json").unwrap(), 10);
        storage
            .finalize("gpt2", DetectedFormat::SingleSafetensors, &gpt2_plan(), MarkerDetails::default())
            .unwrap();
        std::fs::remove_file(storage.file_path("gpt2", "config.json").unwrap()).unwrap();
        assert!(!storage.is_installed("gpt2"));
        assert!(storage.list_installed().unwrap().is_empty());
    }

    #[test]
    fn test_remove_is_safe_on_partial_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        assert!(!storage.remove("ghost").unwrap());

        write(&storage.file_path("half", "model.safetensors").unwrap(), 100);
        write(&storage.staging_path("half", "config.json").unwrap(), 3);
        assert!(storage.remove("half").unwrap());
        assert!(!storage.path_for("half").unwrap().exists());
        assert!(!storage.staging_dir("half").unwrap().exists());
    }

    #[test]
    fn test_usage_excludes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        write(&storage.file_path("a", "w.safetensors").unwrap(), 1000);
        write(&storage.staging_path("a", "x.safetensors").unwrap(), 5000);
        let usage = storage.usage().unwrap();
        assert_eq!(usage.total_bytes, 1000);
        assert_eq!(usage.models.len(), 1);
        assert!(!usage.models[0].installed);
    }

    #[test]
    fn test_inspect_partial() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        write(&storage.file_path("m", "config.json").unwrap(), 12);
        write(&storage.staging_path("m", "model.safetensors").unwrap(), 7);
        let report = storage.inspect("m").unwrap();
        assert!(!report.marker_present);
        assert!(!report.installed);
        assert_eq!(report.files, vec![("config.json".to_string(), 12)]);
        assert_eq!(report.staging_files, vec![("model.safetensors.part".to_string(), 7)]);
    }

    #[test]
    fn test_rejects_unsafe_paths() {
        let storage = StorageManager::new("/tmp/models");
        assert!(storage.path_for("../etc").is_err());
        assert!(storage.file_path("m", "../x").is_err());
        assert!(storage.file_path("m", MARKER_FILE).is_err());
        assert!(storage.staging_path("m", "/abs").is_err());
    }

    #[test]
    fn test_multipart_marker_records_index_digest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        let index = storage.file_path("big", INDEX_MANIFEST).unwrap();
        std::fs::create_dir_all(index.parent().unwrap()).unwrap();
        std::fs::write(&index, br#"{"weight_map":{"a":"s1.safetensors"}}"#).unwrap();
        write(&storage.file_path("big", "s1.safetensors").unwrap(), 2048);
        write(&storage.file_path("big", "config.json").unwrap(), 4);
        let plan = vec![
            FileSpec::required(INDEX_MANIFEST, 2),
            FileSpec::required("s1.safetensors", 1024),
            FileSpec::required("config.json", 2),
        ];
        let artifact = storage
            .finalize("big", DetectedFormat::MultiPartSafetensors, &plan, MarkerDetails::default())
            .unwrap();
        assert_eq!(artifact.index_sha256.as_deref().map(str::len), Some(64));
    }
}
