#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
// Disable with `--no-default-features` if debugging allocator issues.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;
mod exit_code;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stowage_core::error::{ConfigError, PathError, ServiceError, StorageError};
use stowage_core::{PathValidator, StorageConfig};

use crate::commands::{Context, cat, check, cp, mkdir, mv, put, rm, stats, sweep};

/// Command-line interface for a stowage root
#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Store a file read from stdin
    echo hello | stowage --root /srv/stowage put /docs/hello.txt

    # Store a local file and read it back
    stowage --root /srv/stowage put /docs/report.pdf --input report.pdf
    stowage --root /srv/stowage cat /docs/report.pdf > copy.pdf

    # Check user-supplied paths without touching storage
    stowage --root /srv/stowage check 'a/../../etc/passwd' '/docs/ok.txt'

    # Remove temp files orphaned for more than 30 minutes
    STOWAGE_ROOT=/srv/stowage stowage sweep --retention 30m
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Storage root directory (overrides the config file's root)
    #[arg(long, env = "STOWAGE_ROOT", value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// TOML config file
    #[arg(long, env = "STOWAGE_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store stdin or a local file atomically
    Put(put::Args),

    /// Write a stored file to stdout
    Cat(cat::Args),

    /// Copy a file within the root
    Cp(cp::Args),

    /// Move or rename a file or directory
    Mv(mv::Args),

    /// Remove a file or directory
    Rm(rm::Args),

    /// Create a directory
    Mkdir(mkdir::Args),

    /// Validate paths and print their normalized form
    Check(check::Args),

    /// Remove orphaned temp files
    Sweep(sweep::Args),

    /// Show storage statistics
    Stats(stats::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let quiet = cli.quiet;

    match run(cli) {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            let code = categorize_error(&e);
            if !quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    let config = load_config(cli.root.as_deref(), cli.config.as_deref())?;

    // One-shot commands: no background sweeper, one thread is plenty
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Commands, config: StorageConfig) -> Result<()> {
    // Checking paths never creates the root
    let command = match command {
        Commands::Check(args) => {
            let validator = PathValidator::new(&config.root)
                .with_max_length(config.max_path_length)
                .with_reserved_dir(config.temp_dir_name.clone());
            return check::execute(&validator, &args);
        }
        command => command,
    };

    let ctx = Context::open(config).await?;
    let result = match command {
        Commands::Put(args) => put::execute(&ctx, args).await,
        Commands::Cat(args) => cat::execute(&ctx, args).await,
        Commands::Cp(args) => cp::execute(&ctx, args).await,
        Commands::Mv(args) => mv::execute(&ctx, args).await,
        Commands::Rm(args) => rm::execute(&ctx, args).await,
        Commands::Mkdir(args) => mkdir::execute(&ctx, args).await,
        Commands::Sweep(args) => sweep::execute(&ctx, args).await,
        Commands::Stats(args) => stats::execute(&ctx, args).await,
        Commands::Check(args) => check::execute(&ctx.validator, &args),
    };
    ctx.storage.close().await?;
    result
}

/// Build the config from `--config` and/or `--root`; `--root` wins when both are given.
fn load_config(root: Option<&Path>, config_file: Option<&Path>) -> Result<StorageConfig> {
    let mut config = match (config_file, root) {
        (Some(file), _) => StorageConfig::from_file(file)?,
        (None, Some(root)) => StorageConfig::new(root),
        (None, None) => {
            return Err(ConfigError::Invalid(
                "no storage root: pass --root, set STOWAGE_ROOT, or use --config".into(),
            )
            .into());
        }
    };
    if let Some(root) = root {
        config.root = root.to_path_buf();
    }

    let config = config.sweeper_enabled(false);
    config.validate()?;
    Ok(config)
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if cause.downcast_ref::<PathError>().is_some() || cause.downcast_ref::<ConfigError>().is_some() {
            return exit_code::REJECTED_INPUT;
        }

        if let Some(service_err) = cause.downcast_ref::<ServiceError>() {
            if service_err.is_not_found() {
                return exit_code::NOT_FOUND;
            }
            if service_err.is_rejected_input() {
                return exit_code::REJECTED_INPUT;
            }
        }

        if let Some(storage_err) = cause.downcast_ref::<StorageError>()
            && storage_err.is_not_found()
        {
            return exit_code::NOT_FOUND;
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::NotFound
        {
            return exit_code::NOT_FOUND;
        }
    }

    exit_code::GENERAL_ERROR
}
