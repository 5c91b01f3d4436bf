//! Procflow CLI - validate, compile and execute process manifests
//!
//! Instances are kept in state files holding the engine's persisted bytes,
//! so a run can stop at a user task or message wait and be resumed by a
//! later invocation.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod output;

use commands::{instance, manifest};
use config::CliConfig;

/// Procflow CLI application
#[derive(Parser)]
#[command(name = "procflow")]
#[command(about = "Procflow - manifest compiler and process engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PROCFLOW_CONFIG")]
    config: Option<String>,

    /// Directory of published subflows
    #[arg(long, env = "PROCFLOW_CATALOG_DIR")]
    catalog: Option<std::path::PathBuf>,

    /// Log level
    #[arg(long, env = "PROCFLOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json: bool,

    /// Print engine events after each command
    #[arg(long)]
    events: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Check a manifest for structural errors
    Validate {
        /// Manifest file
        manifest: String,
    },

    /// Compile a manifest against the catalog
    Compile {
        /// Manifest file
        manifest: String,

        /// Write the compiled process here instead of stdout
        #[arg(short, long)]
        out: Option<String>,
    },

    /// Create an instance from a manifest and advance it
    Run(instance::RunArgs),

    /// Resume an instance, optionally completing a waiting task
    Resume(instance::ResumeArgs),

    /// Deliver a message to an instance and advance it
    Correlate(instance::CorrelateArgs),

    /// Cancel an instance
    Cancel(instance::CancelArgs),

    /// Show the tasks of an instance
    Show {
        /// State file
        #[arg(short, long)]
        state: String,
    },

    /// Show the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level.clone() {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if cli.catalog.is_some() {
        config.catalog.dir = cli.catalog.clone();
    }

    // Logs go to stderr; stdout carries command output
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command {
        Commands::Validate { manifest } => manifest::validate(&manifest),
        Commands::Compile { manifest, out } => {
            manifest::compile(&manifest, out.as_deref(), &config)
        }
        Commands::Run(args) => instance::run(args, &config, cli.events),
        Commands::Resume(args) => instance::resume(args, &config, cli.events),
        Commands::Correlate(args) => instance::correlate(args, &config, cli.events),
        Commands::Cancel(args) => instance::cancel(args, &config, cli.events),
        Commands::Show { state } => instance::show(&state, &config),
        Commands::Config => output::print_json(&config),
    }
}
