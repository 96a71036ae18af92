//! Run command implementation.

use super::{CliError, Selection};
use resync_core::{EntityReport, StageOutcome, SyncConfig, SyncEngine, SyncReport, TracingListener};
use resync_sqlite::SqliteStore;
use std::path::{Path, PathBuf};

/// Arguments of the run command.
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Target database file.
    pub target: PathBuf,
    /// Source database file to attach.
    pub source: Option<PathBuf>,
    /// Schema name the source is attached under.
    pub source_schema: String,
    /// Force a full run.
    pub full: bool,
    /// Skip checkpoint recording.
    pub no_checkpoint: bool,
    /// Keep staging tables.
    pub keep_staging: bool,
    /// Report unaffected stages.
    pub debug: bool,
    /// Entity selection.
    pub selection: Selection,
}

/// Runs the reconciliation and prints the report.
pub fn run(config: &Path, args: &RunArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = execute(config, args)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }

    if let Some(entity) = &report.aborted {
        return Err(CliError::Aborted(entity.clone()).into());
    }
    let failed = report.failures().count();
    if failed > 0 {
        return Err(CliError::Failed(failed).into());
    }
    Ok(())
}

fn execute(config: &Path, args: &RunArgs) -> Result<SyncReport, Box<dyn std::error::Error>> {
    let config = SyncConfig::from_path(config)?;
    let policies = config.policies()?;

    let mut options = args.selection.apply(config.options.clone());
    if args.full {
        options.incremental = false;
    }
    if args.no_checkpoint {
        options.save_checkpoints = false;
    }
    options.keep_staging |= args.keep_staging;
    options.debug |= args.debug;

    let mut store = SqliteStore::open(&args.target)?
        .with_name(config.name.clone())
        .with_persistent_staging(options.keep_staging);
    if let Some(source) = &args.source {
        store.attach_source(source, &args.source_schema)?;
    }

    tracing::debug!(database = %args.target.display(), name = %config.name, "store opened");
    let mut engine = SyncEngine::new(options).with_listener(TracingListener);
    Ok(engine.run(policies, &mut store)?)
}

fn print_text_output(report: &SyncReport) {
    println!("Reconciliation Report");
    println!("=====================");
    println!();

    for entity in &report.entities {
        print_entity(entity);
    }

    println!("Total affected: {}", report.total_affected());
    if let Some(entity) = &report.aborted {
        println!("Aborted on conflicts in '{}'", entity);
    } else if report.success() {
        println!("Status: OK");
    } else {
        println!("Status: FAILED");
    }
}

fn print_entity(entity: &EntityReport) {
    println!("{}:", entity.name);
    if let Some(error) = &entity.error {
        println!("  error: {}", error);
    }
    if let Some(summary) = &entity.summary {
        for (kind, outcome) in &summary.stages {
            match outcome {
                StageOutcome::Skipped => println!("  {:<12} skipped", kind.as_str()),
                StageOutcome::Affected(n) => println!("  {:<12} {}", kind.as_str(), n),
            }
        }
    }
    println!();
}
