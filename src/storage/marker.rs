//! Install marker: the record whose presence means "fully verified".

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StorageError;
use crate::catalog::DetectedFormat;

pub const MARKER_FILE: &str = ".gg-depot.json";
pub const MARKER_VERSION: u32 = 1;

const MARKER_TMP: &str = ".gg-depot.json.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledFile {
    pub name: String,
    pub size: u64,
    pub required: bool,
    #[serde(default)]
    pub min_size: Option<u64>,
}

impl InstalledFile {
    /// Present on disk with a size that still passes the minimum.
    pub(crate) fn verify(&self, root: &Path) -> bool {
        std::fs::metadata(root.join(&self.name))
            .map(|m| m.is_file() && m.len() >= self.min_size.unwrap_or(1).max(1))
            .unwrap_or(false)
    }
}

/// On-disk marker document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMarker {
    pub version: u32,
    pub model_id: String,
    pub repository: String,
    pub revision: String,
    pub format: DetectedFormat,
    pub files: Vec<InstalledFile>,
    pub installed_at: DateTime<Utc>,
    /// SHA-256 of the shard index, for multi-part artifacts.
    #[serde(default)]
    pub index_sha256: Option<String>,
}

impl InstallMarker {
    pub fn read(path: &Path) -> Result<Self, StorageError> {
        let raw = std::fs::read(path).map_err(|source| StorageError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_slice(&raw).map_err(|source| StorageError::Marker { path: path.to_path_buf(), source })
    }

    /// Write via a temp file and rename so readers never see a partial marker.
    pub fn write_atomic(&self, dir: &Path) -> Result<PathBuf, StorageError> {
        let tmp = dir.join(MARKER_TMP);
        let path = dir.join(MARKER_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|source| StorageError::Marker { path: path.clone(), source })?;

        let io = |p: &Path| {
            let p = p.to_path_buf();
            move |source: std::io::Error| StorageError::Io { path: p, source }
        };
        let mut file = std::fs::File::create(&tmp).map_err(io(&tmp))?;
        file.write_all(&json).map_err(io(&tmp))?;
        file.sync_all().map_err(io(&tmp))?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(io(&path))?;
        Ok(path)
    }
}

/// A verified, installed model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub model_id: String,
    pub root: PathBuf,
    pub repository: String,
    pub revision: String,
    pub format: DetectedFormat,
    pub files: Vec<InstalledFile>,
    pub installed_at: DateTime<Utc>,
    pub index_sha256: Option<String>,
}

impl InstalledArtifact {
    pub(crate) fn from_marker(root: PathBuf, marker: InstallMarker) -> Self {
        Self {
            model_id: marker.model_id,
            root,
            repository: marker.repository,
            revision: marker.revision,
            format: marker.format,
            files: marker.files,
            installed_at: marker.installed_at,
            index_sha256: marker.index_sha256,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Weight files (`.safetensors` / `.gguf`) in install order.
    pub fn weight_files(&self) -> impl Iterator<Item = &InstalledFile> {
        self.files.iter().filter(|f| {
            let name = f.name.to_ascii_lowercase();
            name.ends_with(".safetensors") || name.ends_with(".gguf")
        })
    }

    pub fn path_of(&self, file: &InstalledFile) -> PathBuf {
        self.root.join(&file.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstallMarker {
        InstallMarker {
            version: MARKER_VERSION,
            model_id: "gpt2".into(),
            repository: "openai-community/gpt2".into(),
            revision: "main".into(),
            format: DetectedFormat::SingleSafetensors,
            files: vec![InstalledFile { name: "model.safetensors".into(), size: 4096, required: true, min_size: Some(1024) }],
            installed_at: Utc::now(),
            index_sha256: None,
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let marker = sample();
        let path = marker.write_atomic(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(MARKER_FILE));
        assert!(!dir.path().join(MARKER_TMP).exists());
        assert_eq!(InstallMarker::read(&path).unwrap(), marker);
    }

    #[test]
    fn test_garbage_marker_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MARKER_FILE);
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(InstallMarker::read(&path), Err(StorageError::Marker { .. })));
    }

    #[test]
    fn test_weight_files_filter() {
        let mut marker = sample();
        marker.files.push(InstalledFile { name: "config.json".into(), size: 10, required: true, min_size: Some(2) });
        let artifact = InstalledArtifact::from_marker(PathBuf::from("/m/gpt2"), marker);
        let weights: Vec<_> = artifact.weight_files().map(|f| f.name.as_str()).collect();
        assert_eq!(weights, vec!["model.safetensors"]);
        assert_eq!(artifact.total_bytes(), 4106);
    }
}
