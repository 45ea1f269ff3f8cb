//! GG-DEPOT entry point.
//!
//! ## CLI Subcommands
//!
//! - `gg-depot list` - Installed models
//! - `gg-depot catalog` - Built-in model catalog
//! - `gg-depot detect <REF>` - Detect a model's packaging format
//! - `gg-depot pull <REF>` - Download and install a model
//! - `gg-depot rm <ID>` - Delete an installed model
//! - `gg-depot usage` - Disk usage per model
//! - `gg-depot activate <ID>` - Load a model once into the reference runtime
//! - `gg-depot config show|defaults|validate`

use std::process::ExitCode;

use gg_depot::cli::{
    config_cmd, exit_code_for, load_config, models_cmd, strip_global_flags, EXIT_CONFIG, EXIT_FAILURE,
};
use gg_depot::config::EnvConfig;
use gg_depot::telemetry::init_logging;
use gg_depot::Depot;

#[tokio::main]
async fn main() -> ExitCode {
    let raw: Vec<String> = std::env::args().collect();
    let args = strip_global_flags(&raw);
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            return ExitCode::SUCCESS;
        }
        "version" | "--version" | "-V" => {
            println!("gg-depot {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        "catalog" => return exit(models_cmd::run_catalog()),
        "config" if args.get(2).map(|s| s.as_str()) == Some("defaults") => {
            return exit(config_cmd::run_defaults());
        }
        _ => {}
    }

    let config = match load_config(&raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = init_logging(&config.log_config()) {
        eprintln!("Logging disabled: {}", e);
    }

    if command == "config" {
        let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
        let code = match subcommand {
            "show" => config_cmd::run_show(&config, has_flag(&args, "--json")),
            "validate" => config_cmd::run_validate(&config),
            _ => {
                eprintln!("Unknown config subcommand: {}", subcommand);
                print_command_help("config");
                EXIT_FAILURE
            }
        };
        return exit(code);
    }

    let code = match command {
        "list" | "ls" => with_depot(config, |depot| async move { models_cmd::run_list(&depot) }).await,
        "usage" | "du" => with_depot(config, |depot| async move { models_cmd::run_usage(&depot) }).await,
        "detect" | "pull" | "rm" | "activate" => {
            let Some(target) = args.get(2).cloned() else {
                eprintln!("Missing argument for {}", command);
                print_command_help(command);
                return exit(EXIT_FAILURE);
            };
            match command {
                "detect" => {
                    with_depot(config, |depot| async move { models_cmd::run_detect(&depot, &target).await }).await
                }
                "pull" => {
                    with_depot(config, |depot| async move { models_cmd::run_pull(&depot, &target).await }).await
                }
                "rm" => with_depot(config, |depot| async move { models_cmd::run_rm(&depot, &target).await }).await,
                _ => {
                    with_depot(config, |depot| async move { models_cmd::run_activate(&depot, &target).await })
                        .await
                }
            }
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            EXIT_FAILURE
        }
    };
    exit(code)
}

/// Build the production depot and hand it to `run`.
async fn with_depot<F, Fut>(config: EnvConfig, run: F) -> i32
where
    F: FnOnce(Depot) -> Fut,
    Fut: std::future::Future<Output = i32>,
{
    match Depot::with_http(config) {
        Ok(depot) => run(depot).await,
        Err(e) => {
            eprintln!("Failed to open depot: {}", e);
            exit_code_for(e.kind())
        }
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gg-depot - model acquisition and activation v{}

USAGE:
    gg-depot [--config FILE] <COMMAND> [ARGS]

COMMANDS:
    list         Show installed models
    catalog      Show the built-in model catalog
    detect REF   Detect a model's packaging format
    pull REF     Download and install a model
    rm ID        Delete an installed model
    usage        Show disk usage per model
    activate ID  Load a model into the reference runtime, then unload it
    config       Manage configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

REFERENCES:
    A catalog id (gpt2), a repository (owner/name) or a pinned
    repository (owner/name@revision).

EXAMPLES:
    gg-depot pull gpt2
    gg-depot pull Qwen/Qwen2.5-7B-Instruct
    gg-depot detect mlx-community/Llama-3.2-1B-Instruct-4bit
    gg-depot list
    gg-depot rm gpt2
    gg-depot config show --json

ENVIRONMENT:
    GG_DEPOT_MODELS_DIR  Models directory (default: platform data dir)
    GG_DEPOT_ORIGIN      Remote origin (default: https://huggingface.co)
    GG_DEPOT_TOKEN       Bearer token for gated repositories (or HF_TOKEN)
    GG_DEPOT_CONFIG      TOML config file (same as --config)
    GG_DEPOT_LOG_LEVEL   Log filter (default: info)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
    3  Connection error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "pull" => {
            eprintln!(
                "gg-depot pull - Download and install a model

USAGE:
    gg-depot pull <REF>

DESCRIPTION:
    Detects the model's packaging format, fetches required files in
    order and optional sidecars concurrently, then writes the install
    marker. Files already present and sane are not fetched again.
    Ctrl+C cancels and discards partial files.

EXIT CODES:
    0  Installed
    1  A required file was missing, corrupt or unauthorized
    3  The origin stayed unreachable after retries

EXAMPLES:
    gg-depot pull gpt2
    gg-depot pull openai-community/gpt2@main
"
            );
        }
        "detect" => {
            eprintln!(
                "gg-depot detect - Detect packaging format

USAGE:
    gg-depot detect <REF>

DESCRIPTION:
    Prints single_safetensors, multi_part_safetensors,
    self_contained_quantized or unknown. Probes the origin when the
    reference alone is inconclusive. Exits 1 for unknown.
"
            );
        }
        "rm" => {
            eprintln!(
                "gg-depot rm - Delete a model

USAGE:
    gg-depot rm <ID>

DESCRIPTION:
    Cancels any in-flight download of the model, then deletes its
    marker, files and staging leftovers. Removing an absent model
    succeeds.
"
            );
        }
        "activate" => {
            eprintln!(
                "gg-depot activate - Verify a model loads

USAGE:
    gg-depot activate <ID>

DESCRIPTION:
    Memory-maps the model's weights within GG_DEPOT_MEMORY_BUDGET,
    checks their headers, reports the runtime handle and unloads.
"
            );
        }
        "config" => {
            eprintln!(
                "gg-depot config - Manage configuration

USAGE:
    gg-depot config <SUBCOMMAND> [OPTIONS]

SUBCOMMANDS:
    show           Show effective configuration (--json for JSON)
    validate       Check configuration for unusable values
    defaults       Show built-in defaults

OPTIONS:
    --config FILE  TOML file layered under environment variables

EXAMPLES:
    gg-depot config show
    gg-depot --config depot.toml config validate
    gg-depot config defaults
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'gg-depot help' for general usage.",
                command
            );
        }
    }
}
