// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Model CLI subcommands: list, catalog, detect, pull, rm, usage, activate.
//!
//! All commands operate on the local models directory through a [`Depot`].

use std::io::Write;
use std::sync::Arc;

use crate::catalog::{self, CatalogEntry};
use crate::cli::{exit_code_for, format_bytes, truncate, EXIT_FAILURE, EXIT_OK};
use crate::fetch::{DownloadState, DownloadStatus, FileStatus};
use crate::storage::{InstalledArtifact, StorageUsage};
use crate::Depot;

/// Run `list`: installed models, one per row.
pub fn run_list(depot: &Depot) -> i32 {
    match depot.list_installed() {
        Ok(models) => {
            print_installed(&models);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Error listing models: {}", e);
            exit_code_for(e.kind())
        }
    }
}

/// Format and print installed artifacts to stdout.
pub fn print_installed(models: &[InstalledArtifact]) {
    if models.is_empty() {
        println!("No models installed.");
        return;
    }

    println!("{:<30} {:<26} {:>12} {:>6} {:<20}", "ID", "FORMAT", "SIZE", "FILES", "INSTALLED");
    println!("{}", "-".repeat(98));

    for m in models {
        println!(
            "{:<30} {:<26} {:>12} {:>6} {:<20}",
            truncate(&m.model_id, 29),
            m.format.as_str(),
            format_bytes(m.total_bytes()),
            m.files.len(),
            m.installed_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    let total: u64 = models.iter().map(InstalledArtifact::total_bytes).sum();
    println!("{}", "-".repeat(98));
    println!("Total: {}  |  {} model(s) installed", format_bytes(total), models.len());
}

/// Run `catalog`: the built-in entries.
pub fn run_catalog() -> i32 {
    print_catalog(catalog::builtin());
    EXIT_OK
}

pub fn print_catalog(entries: &[CatalogEntry]) {
    println!("{:<28} {:<42} {:>12}", "ID", "REPOSITORY", "SIZE");
    println!("{}", "-".repeat(84));
    for e in entries {
        println!(
            "{:<28} {:<42} {:>12}",
            truncate(e.id, 27),
            truncate(e.repository, 41),
            format_bytes(e.size_bytes),
        );
    }
}

/// Run `detect <ref>`: print the detected format.
pub async fn run_detect(depot: &Depot, reference: &str) -> i32 {
    let model = match depot.resolve(reference) {
        Ok(model) => model,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_code_for(e.kind());
        }
    };
    let format = depot.detect(&model).await;
    println!("{} ({}@{}): {}", model.id(), model.repository(), model.revision(), format);
    if format.is_known() {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

/// Run `pull <ref>`: download with live progress. Ctrl+C cancels.
pub async fn run_pull(depot: &Depot, reference: &str) -> i32 {
    let model = match depot.resolve(reference) {
        Ok(model) => model,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_code_for(e.kind());
        }
    };
    let stream = match depot.download(model) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_code_for(e.kind());
        }
    };

    let orchestrator = Arc::clone(depot.orchestrator());
    let model_id = stream.model_id().to_string();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            orchestrator.cancel(&model_id);
        }
    });

    let mut last_status = DownloadStatus::Pending;
    let result = stream.finish_with(|state| print_progress(state, &mut last_status)).await;
    interrupt.abort();
    eprintln!();

    match result {
        Ok(artifact) => {
            println!(
                "Installed {} ({}, {}) at {}",
                artifact.model_id,
                artifact.format,
                format_bytes(artifact.total_bytes()),
                artifact.root.display()
            );
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Download failed: {}", e);
            exit_code_for(e.kind())
        }
    }
}

/// One progress line on stderr, rewritten in place.
fn print_progress(state: &DownloadState, last_status: &mut DownloadStatus) {
    if state.status != *last_status {
        if *last_status == DownloadStatus::Downloading {
            eprintln!();
        }
        *last_status = state.status;
    }
    let done = state
        .files
        .iter()
        .filter(|f| matches!(f.status, FileStatus::Completed | FileStatus::Skipped))
        .count();
    eprint!(
        "\r{:<12} {:>5.1}%  {:>12}/s  {}/{} files",
        state.status.as_str(),
        state.overall_fraction * 100.0,
        format_bytes(state.speed_bytes_per_sec as u64),
        done,
        state.files.len(),
    );
    if let Some(failure) = &state.failure {
        eprint!("\n{} ({:?})", failure.message, failure.remediation);
    }
    let _ = std::io::stderr().flush();
}

/// Run `rm <id>`.
pub async fn run_rm(depot: &Depot, model_id: &str) -> i32 {
    match depot.delete(model_id).await {
        Ok(true) => {
            println!("Removed {}", model_id);
            EXIT_OK
        }
        Ok(false) => {
            println!("{} is not installed", model_id);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Error removing {}: {}", model_id, e);
            exit_code_for(e.kind())
        }
    }
}

/// Run `usage`: on-disk bytes per model directory.
pub fn run_usage(depot: &Depot) -> i32 {
    match depot.usage() {
        Ok(usage) => {
            print_usage_table(&usage);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Error computing usage: {}", e);
            exit_code_for(e.kind())
        }
    }
}

pub fn print_usage_table(usage: &StorageUsage) {
    println!("{:<30} {:>12} {:<10}", "ID", "SIZE", "STATE");
    println!("{}", "-".repeat(54));
    for m in &usage.models {
        println!(
            "{:<30} {:>12} {:<10}",
            truncate(&m.model_id, 29),
            format_bytes(m.bytes),
            if m.installed { "installed" } else { "partial" },
        );
    }
    println!("{}", "-".repeat(54));
    println!("Total: {}", format_bytes(usage.total_bytes));
}

/// Run `activate <id>`: load the model into the reference runtime, report, unload.
pub async fn run_activate(depot: &Depot, model_id: &str) -> i32 {
    let handle = match depot.activate(model_id).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Activation failed: {}", e);
            return exit_code_for(e.kind());
        }
    };
    println!(
        "Activated {} ({}, runtime handle {}, generation {})",
        handle.model_id(),
        handle.format(),
        handle.runtime_handle(),
        handle.generation()
    );
    match depot.deactivate().await {
        Ok(_) => EXIT_OK,
        Err(e) => {
            eprintln!("Deactivation failed: {}", e);
            exit_code_for(e.kind())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::MappedRuntime;
    use crate::config::EnvConfig;
    use crate::fetch::MemoryOrigin;

    fn depot(dir: &std::path::Path, origin: Arc<MemoryOrigin>) -> Depot {
        let mut config = EnvConfig { models_dir: dir.to_path_buf(), ..EnvConfig::default() };
        config.fetch.retry.base_delay = std::time::Duration::from_millis(1);
        Depot::new(config, origin, Arc::new(MappedRuntime::new(1 << 20))).unwrap()
    }

    fn safetensors(total: usize) -> Vec<u8> {
        let header = br#"{"__metadata__":{}}"#;
        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(header);
        out.resize(total, 0);
        out
    }

    #[test]
    fn test_print_installed_empty() {
        // Smoke-test: must not panic.
        print_installed(&[]);
    }

    #[test]
    fn test_print_catalog_builtin() {
        print_catalog(catalog::builtin());
    }

    #[tokio::test]
    async fn test_pull_list_activate_rm() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(MemoryOrigin::new());
        origin.insert("acme/tiny", "model.safetensors", safetensors(4096));
        origin.insert("acme/tiny", "config.json", "{}");
        let depot = depot(dir.path(), Arc::clone(&origin));

        assert_eq!(run_pull(&depot, "acme/tiny").await, EXIT_OK);
        assert_eq!(run_list(&depot), EXIT_OK);
        assert_eq!(run_usage(&depot), EXIT_OK);
        assert_eq!(run_activate(&depot, "tiny").await, EXIT_OK);
        assert!(depot.active().is_none());
        assert_eq!(run_rm(&depot, "tiny").await, EXIT_OK);
        assert!(depot.list_installed().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_missing_weights_fails() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(MemoryOrigin::new());
        origin.insert("acme/tiny", "config.json", "{}");
        let depot = depot(dir.path(), origin);
        assert_eq!(run_pull(&depot, "acme/tiny").await, EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let depot = depot(dir.path(), Arc::new(MemoryOrigin::new()));
        assert_eq!(run_pull(&depot, "nonsense").await, crate::cli::EXIT_CONFIG);
        assert_eq!(run_activate(&depot, "tiny").await, EXIT_FAILURE);
    }
}
