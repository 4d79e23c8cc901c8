//! # ORT Orchestrator
//!
//! Runs the orchestrator of ORT runs as a standalone service.
//!
//! ## Overview
//!
//! - **Scheduling**: derives the eligible pipeline stages of each run and
//!   requests them from the stage workers
//! - **Run lifecycle**: drives runs from `ACTIVE` to a terminal status
//! - **Maintenance**: periodic sweeps that recover stuck runs and time out
//!   silent workers
//!
//! ## Architecture
//!
//! Runs and jobs are persisted in PostgreSQL (or in memory with
//! `--in-memory`); messages travel over named endpoints.

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use ort_server::infra::{
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    orchestration::{OrchestratorService, StoreBackend},
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "ort-orchestrator")]
#[command(about = "Orchestrator driving ORT runs through their pipeline stages")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the orchestrator TOML configuration
    #[arg(long, env = "ORT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, env = "ORT_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Keep runs and jobs in memory instead of PostgreSQL
    #[arg(long, env = "ORT_IN_MEMORY", default_value_t = false)]
    in_memory: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Print the effective configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(&cli.serve).await,
        Command::Migrate => run_migrate(&cli.serve).await,
        Command::CheckConfig => run_check_config(&cli.serve),
    }
}

async fn run_server(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;

    let backend = if args.in_memory {
        warn!("running with the in-memory store; state is lost on exit");
        StoreBackend::in_memory()
    } else {
        StoreBackend::connect(&config)
            .await
            .context("failed to prepare the orchestrator store")?
    };

    let service = OrchestratorService::new(config.orchestrator.clone(), backend)
        .context("failed to build the orchestrator runtime")?;
    service
        .start()
        .await
        .context("failed to start the orchestrator")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("shutdown signal received");

    service
        .shutdown()
        .await
        .context("orchestrator shutdown failed")?;
    info!("orchestrator stopped");
    Ok(())
}

async fn run_migrate(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    StoreBackend::connect(&config)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

fn run_check_config(args: &ServeArgs) -> anyhow::Result<()> {
    let ConfigLoad { config, warnings } = loader(args)
        .load()
        .context("failed to load configuration")?;

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => eprintln!("warning: {} ({hint})", warning.message),
            None => eprintln!("warning: {}", warning.message),
        }
    }
    let rendered = config
        .to_toml()
        .context("failed to render the effective configuration")?;
    println!("{rendered}");
    Ok(())
}

fn loader(args: &ServeArgs) -> ConfigLoader {
    ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = loader(args)
        .load()
        .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
                |_| {
                    // Override via RUST_LOG.
                    "info,ort_core=debug,sqlx=warn".into()
                },
            ),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    let monitor = &config.orchestrator.monitor;
    info!(
        orchestrator.config_worker = config.orchestrator.config_worker,
        stuck_runs.enabled = monitor.stuck_runs.enabled,
        stuck_runs.interval_secs = monitor.stuck_runs.interval_secs,
        stuck_runs.min_age_secs = monitor.stuck_runs.min_age_secs,
        job_timeouts.enabled = monitor.job_timeouts.enabled,
        job_timeouts.interval_secs = monitor.job_timeouts.interval_secs,
        "orchestrator configuration in effect"
    );

    Ok(config)
}
