//! Depot configuration from environment variables and an optional TOML file.
//!
//! Values are layered: built-in defaults, then the TOML file (if any), then
//! `GG_DEPOT_*` environment variables. Invalid environment values fall back to
//! the layer below without crashing; every value is clamped to a sane range.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_DEPOT_MODELS_DIR` | platform data dir + `/models` | Root of the model tree |
//! | `GG_DEPOT_ORIGIN` | `https://huggingface.co` | Remote origin base URL |
//! | `GG_DEPOT_REVISION` | `main` | Default revision for new references |
//! | `GG_DEPOT_TOKEN` / `HF_TOKEN` | unset | Bearer token for gated repositories |
//! | `GG_DEPOT_LARGE_MODEL_BYTES` | 5368709120 | Size above which weights are sharded |
//! | `GG_DEPOT_MAX_ATTEMPTS` | 3 | Attempts per file before giving up |
//! | `GG_DEPOT_ATTEMPT_TIMEOUT` | 60 | Per-attempt inactivity timeout (secs) |
//! | `GG_DEPOT_OPTIONAL_CONCURRENCY` | 2 | Concurrent optional-file transfers |
//! | `GG_DEPOT_PROGRESS_INTERVAL_MS` | 100 | Minimum gap between progress snapshots |
//! | `GG_DEPOT_SPEED_WINDOW_MS` | 2000 | Sliding window for speed estimates |
//! | `GG_DEPOT_MIN_WEIGHT_BYTES` | 1024 | Smallest plausible weights file |
//! | `GG_DEPOT_MEMORY_THRESHOLD` | 0.85 | Pressure at which memory counts as settled |
//! | `GG_DEPOT_CLEANUP_PASSES` | 3 | Trim passes per cleanup round |
//! | `GG_DEPOT_CLEANUP_RETRIES` | 3 | Cleanup rounds before giving up |
//! | `GG_DEPOT_MEMORY_BUDGET` | 8589934592 | Resident budget of the mapped runtime (bytes) |
//! | `GG_DEPOT_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `GG_DEPOT_LOG_LEVEL` | `info` | `EnvFilter` directive |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activation::CleanupPolicy;
use crate::catalog::format::DEFAULT_QUANTIZED_REPO_PATTERNS;
use crate::catalog::{FormatDetector, DEFAULT_LARGE_MODEL_BYTES, DEFAULT_REVISION};
use crate::fetch::http::DEFAULT_ORIGIN;
use crate::fetch::FetchConfig;
use crate::telemetry::{LogConfig, LogFormat};

pub const DEFAULT_MEMORY_BUDGET: u64 = 8 * 1024 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid repository pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Flat summary of the effective values, in `GG_DEPOT_*` terms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    pub models_dir: PathBuf,
    pub origin: String,
    pub revision: String,
    pub token_set: bool,
    pub large_model_bytes: u64,
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    pub optional_concurrency: usize,
    pub progress_interval_ms: u64,
    pub speed_window_ms: u64,
    pub min_weight_bytes: u64,
    pub memory_threshold: f64,
    pub cleanup_passes: u32,
    pub cleanup_retries: u32,
    pub memory_budget: u64,
    pub log_format: &'static str,
    pub log_level: String,
}

/// All depot configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub models_dir: PathBuf,
    pub origin: String,
    pub revision: String,
    pub token: Option<String>,
    pub large_model_bytes: u64,
    pub quantized_repo_patterns: Vec<String>,
    pub fetch: FetchConfig,
    pub cleanup: CleanupPolicy,
    pub memory_budget: u64,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            origin: DEFAULT_ORIGIN.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            token: None,
            large_model_bytes: DEFAULT_LARGE_MODEL_BYTES,
            quantized_repo_patterns: DEFAULT_QUANTIZED_REPO_PATTERNS.iter().map(|p| p.to_string()).collect(),
            fetch: FetchConfig::default(),
            cleanup: CleanupPolicy::default(),
            memory_budget: DEFAULT_MEMORY_BUDGET,
            log_format: LogFormat::Json,
            log_level: "info".to_string(),
        }
    }
}

/// `<platform data dir>/models`, or `./models` when the platform has none.
pub fn default_models_dir() -> PathBuf {
    directories::ProjectDirs::from("ai", "gg-core", "gg-depot")
        .map(|dirs| dirs.data_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

/// On-disk layer. Keys mirror the environment variables in lower case.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    models_dir: Option<PathBuf>,
    origin: Option<String>,
    revision: Option<String>,
    token: Option<String>,
    large_model_bytes: Option<u64>,
    quantized_repo_patterns: Option<Vec<String>>,
    max_attempts: Option<u32>,
    attempt_timeout_secs: Option<u64>,
    optional_concurrency: Option<usize>,
    progress_interval_ms: Option<u64>,
    speed_window_ms: Option<u64>,
    min_weight_bytes: Option<u64>,
    memory_threshold: Option<f64>,
    cleanup_passes: Option<u32>,
    cleanup_retries: Option<u32>,
    memory_budget: Option<u64>,
    log_format: Option<String>,
    log_level: Option<String>,
}

impl FileConfig {
    fn apply(self, cfg: &mut EnvConfig) -> Result<(), ConfigError> {
        if let Some(v) = self.models_dir {
            cfg.models_dir = v;
        }
        if let Some(v) = self.origin {
            cfg.origin = v;
        }
        if let Some(v) = self.revision {
            cfg.revision = v;
        }
        if let Some(v) = self.token {
            cfg.token = Some(v);
        }
        if let Some(v) = self.large_model_bytes {
            cfg.large_model_bytes = v;
        }
        if let Some(v) = self.quantized_repo_patterns {
            cfg.quantized_repo_patterns = v;
        }
        if let Some(v) = self.max_attempts {
            cfg.fetch.retry.max_attempts = v;
        }
        if let Some(v) = self.attempt_timeout_secs {
            cfg.fetch.attempt_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.optional_concurrency {
            cfg.fetch.optional_concurrency = v;
        }
        if let Some(v) = self.progress_interval_ms {
            cfg.fetch.progress_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.speed_window_ms {
            cfg.fetch.speed_window = Duration::from_millis(v);
        }
        if let Some(v) = self.min_weight_bytes {
            cfg.fetch.min_weight_bytes = v;
        }
        if let Some(v) = self.memory_threshold {
            cfg.cleanup.threshold = v;
        }
        if let Some(v) = self.cleanup_passes {
            cfg.cleanup.passes = v;
        }
        if let Some(v) = self.cleanup_retries {
            cfg.cleanup.retries = v;
        }
        if let Some(v) = self.memory_budget {
            cfg.memory_budget = v;
        }
        if let Some(v) = self.log_format {
            cfg.log_format = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key: "log_format", value: v.clone() })?;
        }
        if let Some(v) = self.log_level {
            cfg.log_level = v;
        }
        Ok(())
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a finite `f64` env var, returning `default` on missing or invalid.
fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(default),
        Err(_) => default,
    }
}

/// Non-empty string env var.
fn parse_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env(cfg: &mut EnvConfig) {
    if let Some(dir) = parse_string("GG_DEPOT_MODELS_DIR") {
        cfg.models_dir = PathBuf::from(dir);
    }
    if let Some(origin) = parse_string("GG_DEPOT_ORIGIN") {
        cfg.origin = origin;
    }
    if let Some(revision) = parse_string("GG_DEPOT_REVISION") {
        cfg.revision = revision;
    }
    if let Some(token) = parse_string("GG_DEPOT_TOKEN").or_else(|| parse_string("HF_TOKEN")) {
        cfg.token = Some(token);
    }
    cfg.large_model_bytes = parse_u64("GG_DEPOT_LARGE_MODEL_BYTES", cfg.large_model_bytes);

    let fetch = &mut cfg.fetch;
    fetch.retry.max_attempts = parse_u32("GG_DEPOT_MAX_ATTEMPTS", fetch.retry.max_attempts);
    fetch.attempt_timeout =
        Duration::from_secs(parse_u64("GG_DEPOT_ATTEMPT_TIMEOUT", fetch.attempt_timeout.as_secs()));
    fetch.optional_concurrency = parse_usize("GG_DEPOT_OPTIONAL_CONCURRENCY", fetch.optional_concurrency);
    fetch.progress_interval = Duration::from_millis(parse_u64(
        "GG_DEPOT_PROGRESS_INTERVAL_MS",
        fetch.progress_interval.as_millis() as u64,
    ));
    fetch.speed_window =
        Duration::from_millis(parse_u64("GG_DEPOT_SPEED_WINDOW_MS", fetch.speed_window.as_millis() as u64));
    fetch.min_weight_bytes = parse_u64("GG_DEPOT_MIN_WEIGHT_BYTES", fetch.min_weight_bytes);

    cfg.cleanup.threshold = parse_f64("GG_DEPOT_MEMORY_THRESHOLD", cfg.cleanup.threshold);
    cfg.cleanup.passes = parse_u32("GG_DEPOT_CLEANUP_PASSES", cfg.cleanup.passes);
    cfg.cleanup.retries = parse_u32("GG_DEPOT_CLEANUP_RETRIES", cfg.cleanup.retries);
    cfg.memory_budget = parse_u64("GG_DEPOT_MEMORY_BUDGET", cfg.memory_budget);

    if let Some(format) = parse_string("GG_DEPOT_LOG_FORMAT").and_then(|v| v.parse().ok()) {
        cfg.log_format = format;
    }
    if let Some(level) = parse_string("GG_DEPOT_LOG_LEVEL") {
        cfg.log_level = level;
    }
}

/// Pull every value into its supported range.
fn clamp(cfg: &mut EnvConfig) {
    cfg.large_model_bytes = cfg.large_model_bytes.max(MIB);
    cfg.fetch.retry.max_attempts = cfg.fetch.retry.max_attempts.clamp(1, 20);
    cfg.fetch.attempt_timeout = cfg.fetch.attempt_timeout.clamp(Duration::from_secs(1), Duration::from_secs(3600));
    cfg.fetch.optional_concurrency = cfg.fetch.optional_concurrency.clamp(1, 16);
    cfg.fetch.progress_interval = cfg.fetch.progress_interval.max(Duration::from_millis(10));
    cfg.fetch.speed_window = cfg.fetch.speed_window.max(Duration::from_millis(100));
    cfg.fetch.min_weight_bytes = cfg.fetch.min_weight_bytes.max(1);
    cfg.cleanup.threshold = cfg.cleanup.threshold.clamp(0.05, 1.0);
    cfg.cleanup.passes = cfg.cleanup.passes.clamp(1, 10);
    cfg.cleanup.retries = cfg.cleanup.retries.clamp(1, 10);
    cfg.memory_budget = cfg.memory_budget.max(MIB);
    if cfg.revision.trim().is_empty() {
        cfg.revision = DEFAULT_REVISION.to_string();
    }
}

/// Load configuration from defaults and environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let mut cfg = EnvConfig::default();
    apply_env(&mut cfg);
    clamp(&mut cfg);
    cfg
}

/// Load configuration with a TOML file layered between defaults and the environment.
pub fn load_file(path: &Path) -> Result<EnvConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let file: FileConfig =
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

    let mut cfg = EnvConfig::default();
    file.apply(&mut cfg)?;
    apply_env(&mut cfg);
    clamp(&mut cfg);
    Ok(cfg)
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            models_dir: self.models_dir.clone(),
            origin: self.origin.clone(),
            revision: self.revision.clone(),
            token_set: self.token.is_some(),
            large_model_bytes: self.large_model_bytes,
            max_attempts: self.fetch.retry.max_attempts,
            attempt_timeout_secs: self.fetch.attempt_timeout.as_secs(),
            optional_concurrency: self.fetch.optional_concurrency,
            progress_interval_ms: self.fetch.progress_interval.as_millis() as u64,
            speed_window_ms: self.fetch.speed_window.as_millis() as u64,
            min_weight_bytes: self.fetch.min_weight_bytes,
            memory_threshold: self.cleanup.threshold,
            cleanup_passes: self.cleanup.passes,
            cleanup_retries: self.cleanup.retries,
            memory_budget: self.memory_budget,
            log_format: self.log_format.as_str(),
            log_level: self.log_level.clone(),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        self.fetch.clone()
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.cleanup.clone()
    }

    pub fn detector(&self) -> Result<FormatDetector, ConfigError> {
        Ok(FormatDetector::new(self.large_model_bytes, &self.quantized_repo_patterns)?)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            level: self.log_level.clone(),
            output_path: None,
        }
    }

    /// Problems that clamping cannot fix. Empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(self.origin.starts_with("https://") || self.origin.starts_with("http://")) {
            warnings.push(format!("GG_DEPOT_ORIGIN ({}) is not an http(s) URL", self.origin));
        }
        if let Err(e) = self.detector() {
            warnings.push(e.to_string());
        }
        if self.models_dir.as_os_str().is_empty() {
            warnings.push("GG_DEPOT_MODELS_DIR is empty".to_string());
        }
        if self.models_dir.is_file() {
            warnings.push(format!("GG_DEPOT_MODELS_DIR ({}) is a file", self.models_dir.display()));
        }
        warnings
    }
}
