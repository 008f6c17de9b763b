//! # COB Configuration Validator
//!
//! Command-line tool for validating close-of-business configuration across
//! environments before starting a batch or serving inline requests.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cob_core::config::{CobConfig, ConfigManager};
use cob_core::models::ExecutionMapRegistry;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cob-config-validator")]
#[command(about = "Validate close-of-business configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config/cob)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load, merge and validate the configuration
    All,

    /// Print the execution map of every job
    Jobs,

    /// List available environment overrides
    Environments,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all(&cli),
        Some(Commands::Jobs) => show_jobs(&cli),
        Some(Commands::Environments) => list_environments(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn config_dir(cli: &Cli) -> PathBuf {
    cli.config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("config").join("cob"))
}

fn load(cli: &Cli) -> anyhow::Result<CobConfig> {
    let manager = ConfigManager::load_from_directory_with_env(Some(config_dir(cli)), &cli.environment)
        .with_context(|| format!("loading environment '{}'", cli.environment))?;
    Ok(manager.config().clone())
}

fn validate_all(cli: &Cli) -> anyhow::Result<()> {
    println!("🔧 Validating COB Configuration");
    println!("Environment: {}", cli.environment);
    println!("Config Directory: {}", config_dir(cli).display());
    println!();

    let config = load(cli)?;
    println!("✅ Configuration loaded and validated");

    let policy = config.fault_tolerance()?;
    println!(
        "✅ Batch: chunk_size={} worker_count={} fault_tolerance={policy:?}",
        config.batch.chunk_size, config.batch.worker_count
    );
    println!(
        "✅ Locking: inline_overrule={:?} reclaim_failed_inline_locks={}",
        config.locking.inline_overrule, config.locking.reclaim_failed_inline_locks
    );
    match &config.database {
        Some(database) => println!(
            "✅ Database: durable lock store, max_connections={}",
            database.max_connections
        ),
        None => println!("⚠️  Database: not configured, locks are held in memory"),
    }

    ExecutionMapRegistry::from_jobs(&config.jobs)?;
    if config.jobs.is_empty() {
        bail!("no jobs are configured");
    }
    println!("✅ {} job(s) with valid execution maps", config.jobs.len());

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn show_jobs(cli: &Cli) -> anyhow::Result<()> {
    let config = load(cli)?;
    let maps = ExecutionMapRegistry::from_jobs(&config.jobs)?;

    for job_name in maps.job_names() {
        println!(
            "📋 {job_name} (chunk_size={})",
            config.chunk_size_for(job_name)
        );
        for (order, step) in maps.get(job_name)?.iter() {
            println!("  {order:>4}  {step}");
        }
    }
    Ok(())
}

fn list_environments(cli: &Cli) -> anyhow::Result<()> {
    let environments_dir = config_dir(cli).join("environments");
    println!("📋 Available Environments:");

    if !environments_dir.exists() {
        println!(
            "❌ Configuration environments directory not found: {}",
            environments_dir.display()
        );
        return Ok(());
    }

    let mut environments = Vec::new();
    for entry in std::fs::read_dir(&environments_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                environments.push(name.to_string());
            }
        }
    }
    environments.sort();

    for environment in environments {
        println!("  • {environment}");
    }
    Ok(())
}
