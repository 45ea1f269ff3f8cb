//! Sharded safetensors index (`model.safetensors.index.json`).

use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::error::FetchError;
use super::strategy::INDEX_MANIFEST;

#[derive(Debug, Deserialize)]
struct RawIndex {
    #[serde(default)]
    metadata: Option<RawMetadata>,
    weight_map: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    total_size: Option<u64>,
}

/// Parsed shard index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIndex {
    /// Unique shard files in first-appearance order.
    pub shards: Vec<String>,
    /// `metadata.total_size`, when present.
    pub total_size: Option<u64>,
    /// Hex SHA-256 of the raw manifest bytes.
    pub sha256: String,
}

impl ShardIndex {
    pub fn parse(raw: &[u8]) -> Result<Self, FetchError> {
        let index: RawIndex = serde_json::from_slice(raw)
            .map_err(|e| FetchError::corrupt(INDEX_MANIFEST, format!("invalid index: {e}")))?;

        let mut shards: Vec<String> = Vec::new();
        for (tensor, shard) in &index.weight_map {
            let shard = shard.as_str().ok_or_else(|| {
                FetchError::corrupt(INDEX_MANIFEST, format!("tensor {tensor} maps to a non-string shard"))
            })?;
            if !is_safe_relative_path(shard) {
                return Err(FetchError::corrupt(INDEX_MANIFEST, format!("unsafe shard path {shard:?}")));
            }
            if !shards.iter().any(|s| s == shard) {
                shards.push(shard.to_string());
            }
        }

        if shards.is_empty() {
            return Err(FetchError::corrupt(INDEX_MANIFEST, "weight_map lists no shards"));
        }

        Ok(Self {
            shards,
            total_size: index.metadata.and_then(|m| m.total_size),
            sha256: hex::encode(Sha256::digest(raw)),
        })
    }
}

/// Relative path made of plain components only.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains(['\\', '\0', ':'])
        && path.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const QWEN_LIKE: &str = r#"{
        "metadata": {"total_size": 15231233024},
        "weight_map": {
            "lm_head.weight": "model-00003-of-00003.safetensors",
            "model.embed_tokens.weight": "model-00001-of-00003.safetensors",
            "model.layers.0.mlp.down_proj.weight": "model-00001-of-00003.safetensors",
            "model.layers.14.mlp.up_proj.weight": "model-00002-of-00003.safetensors",
            "model.norm.weight": "model-00003-of-00003.safetensors"
        }
    }"#;

    #[test]
    fn test_dedup_in_first_appearance_order() {
        let index = ShardIndex::parse(QWEN_LIKE.as_bytes()).unwrap();
        assert_eq!(
            index.shards,
            vec![
                "model-00003-of-00003.safetensors",
                "model-00001-of-00003.safetensors",
                "model-00002-of-00003.safetensors",
            ]
        );
        assert_eq!(index.total_size, Some(15_231_233_024));
        assert_eq!(index.sha256.len(), 64);
    }

    #[test]
    fn test_rejects_traversal() {
        let raw = r#"{"weight_map": {"a": "../../etc/passwd"}}"#;
        let err = ShardIndex::parse(raw.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let raw = r#"{"weight_map": {"a": "/abs.safetensors"}}"#;
        assert!(ShardIndex::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_rejects_garbage_and_empty_maps() {
        assert!(ShardIndex::parse(b"not json").is_err());
        assert!(ShardIndex::parse(br#"{"weight_map": {}}"#).is_err());
        assert!(ShardIndex::parse(br#"{"weight_map": {"a": 3}}"#).is_err());
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative_path("model-00001-of-00002.safetensors"));
        assert!(is_safe_relative_path("weights/part1.safetensors"));
        assert!(!is_safe_relative_path(""));
        assert!(!is_safe_relative_path("a//b"));
        assert!(!is_safe_relative_path("./a"));
        assert!(!is_safe_relative_path("C:\\x"));
    }
}
