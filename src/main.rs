// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use modeldock::catalog::{ModuleCatalog, ModuleSpec};
use modeldock::config::Settings;
use modeldock::fetch::HttpFetcher;
use modeldock::server::Server;
use modeldock::status::TransferPhase;
use modeldock::worker::TransferWorker;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Data error - invalid input data format
    pub const DATA_ERR: i32 = 65;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

#[derive(Parser)]
#[command(name = "modeldock")]
#[command(version = VERSION)]
#[command(about = "Local AI model dock. Background downloads, one loaded model, simple HTTP API.")]
#[command(long_about = "modeldock - Local AI model dock\n\n\
    Start the server:    modeldock\n\
    List the catalog:    modeldock list\n\n\
    Downloads run in isolated worker processes and survive slow networks \
    with retry and resume. One model is loaded at a time.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server (default when no subcommand is given)
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind to (default 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
        /// Data directory for models and state
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Show the module catalog with download state
    List {
        /// Data directory for models and state
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Transfer worker entry point; spawned by the orchestrator, one
    /// process per in-flight artifact.
    #[command(hide = true)]
    Worker {
        /// Module descriptor, JSON-encoded
        #[arg(long)]
        spec_json: String,
        /// Final artifact path
        #[arg(long)]
        model_file: PathBuf,
        /// Status record path
        #[arg(long)]
        status_file: PathBuf,
        /// Transfer ownership lock path
        #[arg(long)]
        lock_file: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Worker {
            spec_json,
            model_file,
            status_file,
            lock_file,
        }) => run_worker(&spec_json, &model_file, &status_file, &lock_file),
        Some(Commands::List { data_dir }) => run_list(data_dir),
        Some(Commands::Serve {
            port,
            bind,
            data_dir,
        }) => run_serve(port, bind, data_dir),
        None => run_serve(None, None, None),
    };
    exit(code);
}

/// Run the API server on a fresh tokio runtime.
///
/// The runtime is built here rather than via `#[tokio::main]` so the worker
/// subcommand stays a plain synchronous process.
fn run_serve(port: Option<u16>, bind: Option<String>, data_dir: Option<PathBuf>) -> i32 {
    let settings = match load_settings(port, bind, data_dir) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            return CONFIG;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} Failed to start async runtime: {}", "[X]".red(), e);
            return ERROR;
        }
    };

    match runtime.block_on(Server::new(settings).start()) {
        Ok(()) => SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            ERROR
        }
    }
}

/// Run one transfer to a terminal state inside this process.
///
/// All outcomes are reported through the status record; the exit code is
/// advisory only (the orchestrator tracks liveness, not exit status).
fn run_worker(
    spec_json: &str,
    model_file: &std::path::Path,
    status_file: &std::path::Path,
    lock_file: &std::path::Path,
) -> i32 {
    let spec: ModuleSpec = match serde_json::from_str(spec_json) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("{} Invalid module spec: {}", "[X]".red(), e);
            return DATA_ERR;
        }
    };

    let fetcher = match HttpFetcher::new() {
        Ok(fetcher) => fetcher,
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            return ERROR;
        }
    };

    tracing::info!(module_id = %spec.id, "Transfer worker starting");
    let status = TransferWorker::new(fetcher).run(&spec, model_file, status_file, lock_file);
    tracing::info!(module_id = %spec.id, phase = ?status.phase, "Transfer worker exiting");

    match status.phase {
        TransferPhase::Completed => SUCCESS,
        _ => ERROR,
    }
}

/// Print the catalog with downloaded markers.
fn run_list(data_dir: Option<PathBuf>) -> i32 {
    let settings = match load_settings(None, None, data_dir) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            return CONFIG;
        }
    };

    let catalog = match &settings.catalog_file {
        Some(path) => match ModuleCatalog::from_file(path) {
            Ok(catalog) => catalog,
            Err(e) => {
                eprintln!("{} {:#}", "[X]".red(), e);
                return DATA_ERR;
            }
        },
        None => ModuleCatalog::builtin(),
    };
    let paths = settings.storage();

    println!("{}", "Available modules".bold());
    for module in catalog.all() {
        let downloaded = paths.module_file(&module.id).is_file();
        let marker = if downloaded {
            "[OK]".green()
        } else {
            "[ ]".dimmed()
        };
        let recommended = if module.recommended {
            " (recommended)".cyan().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} {:24} {:10} {}{}",
            marker,
            module.id,
            module.size,
            module.display_name,
            recommended
        );
    }
    SUCCESS
}

fn load_settings(
    port: Option<u16>,
    bind: Option<String>,
    data_dir: Option<PathBuf>,
) -> Result<Settings> {
    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(port) = port {
        settings.port = port;
    }
    if let Some(bind) = bind {
        settings.bind_address = bind;
    }
    if let Some(data_dir) = data_dir {
        settings.data_dir = data_dir;
    }
    Ok(settings)
}
