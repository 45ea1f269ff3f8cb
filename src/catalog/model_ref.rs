//! Immutable reference to a model in the remote registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::format::DetectedFormat;

/// Default revision when none is pinned.
pub const DEFAULT_REVISION: &str = "main";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid model id {0:?}: must be a single path component")]
pub struct InvalidModelId(pub String);

/// Reject ids that could escape the models directory.
pub fn validate_model_id(id: &str) -> Result<(), InvalidModelId> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0'])
        || id.len() > 200;
    if bad {
        return Err(InvalidModelId(id.to_string()));
    }
    Ok(())
}

/// Identifier for a remote model artifact. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    id: String,
    repository: String,
    revision: String,
    filename: Option<String>,
    declared_size: Option<u64>,
    format_hint: Option<DetectedFormat>,
}

impl ModelRef {
    /// Create a reference with an explicit local id.
    pub fn new(id: impl Into<String>, repository: impl Into<String>) -> Result<Self, InvalidModelId> {
        let id = id.into();
        validate_model_id(&id)?;
        Ok(Self {
            id,
            repository: repository.into(),
            revision: DEFAULT_REVISION.to_string(),
            filename: None,
            declared_size: None,
            format_hint: None,
        })
    }

    /// Create a reference whose id is the last segment of the repository path
    /// (`openai-community/gpt2` → `gpt2`).
    pub fn from_repository(repository: &str) -> Result<Self, InvalidModelId> {
        let id = repository.rsplit('/').next().unwrap_or(repository);
        Self::new(id, repository)
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_declared_size(mut self, bytes: u64) -> Self {
        self.declared_size = Some(bytes);
        self
    }

    pub fn with_format_hint(mut self, format: DetectedFormat) -> Self {
        self.format_hint = Some(format);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Declared primary filename or glob, if the catalog supplied one.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn format_hint(&self) -> Option<DetectedFormat> {
        self.format_hint
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}@{})", self.id, self.repository, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_repository() {
        let r = ModelRef::from_repository("openai-community/gpt2").unwrap();
        assert_eq!(r.id(), "gpt2");
        assert_eq!(r.repository(), "openai-community/gpt2");
        assert_eq!(r.revision(), DEFAULT_REVISION);
    }

    #[test]
    fn test_rejects_traversal_ids() {
        for id in ["", ".", "..", "../etc", "a/b", "a\\b", ".hidden"] {
            assert!(ModelRef::new(id, "x/y").is_err(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn test_builder_sets_fields() {
        let r = ModelRef::new("m", "org/m")
            .unwrap()
            .with_filename("m.gguf")
            .with_declared_size(42)
            .with_revision("v2")
            .with_format_hint(DetectedFormat::SelfContainedQuantized);
        assert_eq!(r.filename(), Some("m.gguf"));
        assert_eq!(r.declared_size(), Some(42));
        assert_eq!(r.revision(), "v2");
        assert_eq!(r.format_hint(), Some(DetectedFormat::SelfContainedQuantized));
    }
}
