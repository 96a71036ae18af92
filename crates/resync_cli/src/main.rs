//! resync CLI
//!
//! Command-line front end reconciling SQLite databases from a JSON
//! configuration.
//!
//! # Commands
//!
//! - `run` - Reconcile the configured entities into a target database
//! - `plan` - Show which entities would run, in order
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use commands::Selection;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Policy-driven source to target reconciliation.
#[derive(Parser)]
#[command(name = "resync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the configured entities into a target database
    Run {
        /// Target database file
        #[arg(short, long)]
        target: PathBuf,

        /// Source database file, attached under --source-schema
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Schema name of the attached source database
        #[arg(long, default_value = "src")]
        source_schema: String,

        /// Stage every source row instead of changes since the checkpoint
        #[arg(long)]
        full: bool,

        /// Do not record checkpoints
        #[arg(long)]
        no_checkpoint: bool,

        /// Keep staging tables after the run
        #[arg(long)]
        keep_staging: bool,

        /// Report stages that affected no rows
        #[arg(long)]
        debug: bool,

        #[command(flatten)]
        selection: Selection,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show which entities would run, in order
    Plan {
        #[command(flatten)]
        selection: Selection,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            target,
            source,
            source_schema,
            full,
            no_checkpoint,
            keep_staging,
            debug,
            selection,
            format,
        } => {
            let config = cli.config.ok_or("Configuration file required for run")?;
            let args = commands::run::RunArgs {
                target,
                source,
                source_schema,
                full,
                no_checkpoint,
                keep_staging,
                debug,
                selection,
            };
            commands::run::run(&config, &args, &format)?;
        }
        Commands::Plan { selection, format } => {
            let config = cli.config.ok_or("Configuration file required for plan")?;
            commands::plan::run(&config, &selection, &format)?;
        }
        Commands::Version => {
            println!("resync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
