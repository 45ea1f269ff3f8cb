// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.

use crate::cli::{EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};
use crate::config::{EffectiveConfig, EnvConfig};

/// Print effective config as key-value pairs, or JSON with `json`.
pub fn run_show(cfg: &EnvConfig, json: bool) -> i32 {
    let eff = cfg.effective_config();
    if json {
        match serde_json::to_string_pretty(&eff) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing config: {}", e);
                return EXIT_FAILURE;
            }
        }
    } else {
        print_config(&eff);
    }
    EXIT_OK
}

/// Print built-in defaults, ignoring the environment and any config file.
pub fn run_defaults() -> i32 {
    print_config(&EnvConfig::default().effective_config());
    EXIT_OK
}

/// Validate configuration for problems clamping cannot fix.
///
/// Returns 0 if valid, 2 if any warnings are found.
pub fn run_validate(cfg: &EnvConfig) -> i32 {
    let warnings = cfg.validate();
    for w in &warnings {
        eprintln!("WARNING: {}", w);
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        EXIT_OK
    } else {
        EXIT_CONFIG
    }
}

fn print_config(cfg: &EffectiveConfig) {
    println!("GG_DEPOT_MODELS_DIR={}", cfg.models_dir.display());
    println!("GG_DEPOT_ORIGIN={}", cfg.origin);
    println!("GG_DEPOT_REVISION={}", cfg.revision);
    println!("GG_DEPOT_TOKEN={}", if cfg.token_set { "<set>" } else { "<unset>" });
    println!("GG_DEPOT_LARGE_MODEL_BYTES={}", cfg.large_model_bytes);
    println!("GG_DEPOT_MAX_ATTEMPTS={}", cfg.max_attempts);
    println!("GG_DEPOT_ATTEMPT_TIMEOUT={}", cfg.attempt_timeout_secs);
    println!("GG_DEPOT_OPTIONAL_CONCURRENCY={}", cfg.optional_concurrency);
    println!("GG_DEPOT_PROGRESS_INTERVAL_MS={}", cfg.progress_interval_ms);
    println!("GG_DEPOT_SPEED_WINDOW_MS={}", cfg.speed_window_ms);
    println!("GG_DEPOT_MIN_WEIGHT_BYTES={}", cfg.min_weight_bytes);
    println!("GG_DEPOT_MEMORY_THRESHOLD={}", cfg.memory_threshold);
    println!("GG_DEPOT_CLEANUP_PASSES={}", cfg.cleanup_passes);
    println!("GG_DEPOT_CLEANUP_RETRIES={}", cfg.cleanup_retries);
    println!("GG_DEPOT_MEMORY_BUDGET={}", cfg.memory_budget);
    println!("GG_DEPOT_LOG_FORMAT={}", cfg.log_format);
    println!("GG_DEPOT_LOG_LEVEL={}", cfg.log_level);
}
