// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI module for GG-DEPOT commands.
//!
//! Every command runs in-process against the local models directory; there is
//! no server to connect to. Network access is limited to the remote origin.
//!
//! ## Usage
//!
//! ```bash
//! gg-depot pull gpt2          # Download and install a model
//! gg-depot list               # Show installed models
//! gg-depot activate gpt2      # Load it once to prove it is usable
//! gg-depot rm gpt2            # Delete it
//! ```

pub mod config_cmd;
pub mod models_cmd;

use std::path::PathBuf;

use crate::config::{self, ConfigError, EnvConfig};
use crate::error::ErrorKind;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_CONNECTION: i32 = 3;

/// Config file from `--config FILE` or `GG_DEPOT_CONFIG`.
pub fn config_path(args: &[String]) -> Option<PathBuf> {
    let from_flag = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);
    from_flag.or_else(|| std::env::var("GG_DEPOT_CONFIG").ok().filter(|v| !v.is_empty()).map(PathBuf::from))
}

/// Load configuration, layering the config file when one is given.
pub fn load_config(args: &[String]) -> Result<EnvConfig, ConfigError> {
    match config_path(args) {
        Some(path) => config::load_file(&path),
        None => Ok(config::load()),
    }
}

/// Drop `--config FILE` so positional arguments line up.
pub fn strip_global_flags(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if arg == "--config" {
            skip = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Map an error class to the process exit code.
pub fn exit_code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Transient => EXIT_CONNECTION,
        ErrorKind::InvalidInput => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_path_from_flag() {
        let a = args(&["gg-depot", "list", "--config", "/etc/depot.toml"]);
        assert_eq!(config_path(&a), Some(PathBuf::from("/etc/depot.toml")));
    }

    #[test]
    fn test_strip_global_flags() {
        let a = args(&["gg-depot", "--config", "x.toml", "pull", "gpt2"]);
        assert_eq!(strip_global_flags(&a), args(&["gg-depot", "pull", "gpt2"]));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(ErrorKind::Transient), 3);
        assert_eq!(exit_code_for(ErrorKind::InvalidInput), 2);
        assert_eq!(exit_code_for(ErrorKind::NotFound), 1);
        assert_eq!(exit_code_for(ErrorKind::ConcurrencyConflict), 1);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 5), "hello");
        assert_eq!(truncate("hello world", 5), "hello");
        assert_eq!(truncate("héllo", 2), "h");
    }
}
