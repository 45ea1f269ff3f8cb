//! Packaging format detection.
//!
//! Detection is advisory. The strategy picked from the result performs its own
//! authoritative check (the multi-part strategy probes for the index manifest).

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::model_ref::ModelRef;
use crate::fetch::strategy::{INDEX_MANIFEST, SAFETENSORS_WEIGHTS};
use crate::fetch::RemoteOrigin;

/// Default size above which a model is assumed to be sharded.
pub const DEFAULT_LARGE_MODEL_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Repository naming conventions for pre-quantized single-file packagings.
pub const DEFAULT_QUANTIZED_REPO_PATTERNS: &[&str] =
    &[r"^mlx-community/", r"(?i)[-_](2|3|4|6|8)-?bit$"];

const SELF_CONTAINED_EXTENSION: &str = ".gguf";

/// Closed set of packaging formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedFormat {
    /// One `model.safetensors` plus sidecars.
    SingleSafetensors,
    /// Weights sharded across files listed in an index manifest.
    MultiPartSafetensors,
    /// Single GGUF file carrying weights, tokenizer and metadata.
    SelfContainedQuantized,
    Unknown,
}

impl DetectedFormat {
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleSafetensors => "single_safetensors",
            Self::MultiPartSafetensors => "multi_part_safetensors",
            Self::SelfContainedQuantized => "self_contained_quantized",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DetectedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies model references into a [`DetectedFormat`].
#[derive(Debug, Clone)]
pub struct FormatDetector {
    large_model_bytes: u64,
    quantized_repos: Vec<Regex>,
}

impl FormatDetector {
    /// Build a detector from a threshold and a list of repository patterns.
    pub fn new(large_model_bytes: u64, patterns: &[String]) -> Result<Self, regex::Error> {
        let quantized_repos = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { large_model_bytes, quantized_repos })
    }

    pub fn large_model_bytes(&self) -> u64 {
        self.large_model_bytes
    }

    /// Pure detection over the reference's metadata. First match wins.
    pub fn detect(&self, model: &ModelRef) -> DetectedFormat {
        if !is_valid_repository(model.repository()) {
            return DetectedFormat::Unknown;
        }

        if self.quantized_repos.iter().any(|re| re.is_match(model.repository())) {
            return DetectedFormat::SingleSafetensors;
        }

        if model
            .filename()
            .map(|f| f.to_ascii_lowercase().ends_with(SELF_CONTAINED_EXTENSION))
            .unwrap_or(false)
        {
            return DetectedFormat::SelfContainedQuantized;
        }

        if model.declared_size().map_or(false, |s| s > self.large_model_bytes) {
            return DetectedFormat::MultiPartSafetensors;
        }

        if let Some(hint) = model.format_hint().filter(|h| h.is_known()) {
            return hint;
        }

        match resolve_primary(model, SAFETENSORS_WEIGHTS) {
            Some(_) => DetectedFormat::SingleSafetensors,
            None => DetectedFormat::Unknown,
        }
    }

    /// Detection plus a lightweight existence probe for the default case.
    ///
    /// When metadata alone lands on the single-file default, confirm the primary
    /// file exists; otherwise look for an index manifest before giving up.
    pub async fn detect_with_probe(&self, model: &ModelRef, origin: &dyn RemoteOrigin) -> DetectedFormat {
        let detected = self.detect(model);
        if detected != DetectedFormat::SingleSafetensors {
            return detected;
        }
        let Some(primary) = resolve_primary(model, SAFETENSORS_WEIGHTS) else {
            return DetectedFormat::Unknown;
        };

        let repo = model.repository();
        let rev = model.revision();
        match origin.probe(repo, rev, &primary).await {
            Ok(true) => DetectedFormat::SingleSafetensors,
            Ok(false) => match origin.probe(repo, rev, INDEX_MANIFEST).await {
                Ok(true) => DetectedFormat::MultiPartSafetensors,
                Ok(false) => DetectedFormat::Unknown,
                Err(e) => {
                    tracing::debug!(model_id = model.id(), error = %e, "manifest probe failed");
                    detected
                }
            },
            Err(e) => {
                tracing::debug!(model_id = model.id(), error = %e, "primary probe failed");
                detected
            }
        }
    }
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self {
            large_model_bytes: DEFAULT_LARGE_MODEL_BYTES,
            quantized_repos: DEFAULT_QUANTIZED_REPO_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }
}

/// `owner/name` or `name`, each segment made of the usual hub characters.
fn is_valid_repository(repository: &str) -> bool {
    let mut segments = repository.split('/');
    let valid = |s: &str| {
        !s.is_empty()
            && s != "."
            && s != ".."
            && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    match (segments.next(), segments.next(), segments.next()) {
        (Some(a), None, None) => valid(a),
        (Some(a), Some(b), None) => valid(a) && valid(b),
        _ => false,
    }
}

/// Resolve the declared filename (or glob) to a concrete remote filename.
///
/// No filename means `fallback`. A glob resolves to `fallback` only when the
/// fallback matches it, since the origin offers no listing endpoint.
pub(crate) fn resolve_primary(model: &ModelRef, fallback: &str) -> Option<String> {
    match model.filename() {
        None => Some(fallback.to_string()),
        Some(name) if is_glob(name) => glob_matches(name, fallback).then(|| fallback.to_string()),
        Some(name) if name.trim().is_empty() => None,
        Some(name) => Some(name.to_string()),
    }
}

fn is_glob(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// Minimal `*` / `?` wildcard match.
fn glob_matches(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
