//! Plan command implementation.

use super::Selection;
use resync_core::{EntityPolicy, SyncConfig, SyncEngine};
use serde::Serialize;
use std::path::Path;

/// One planned entity.
#[derive(Debug, Serialize)]
pub struct PlannedEntity {
    /// Entity name.
    pub name: String,
    /// Source table.
    pub source: String,
    /// Entities reconciled before this one.
    pub requires: Vec<String>,
}

impl From<EntityPolicy> for PlannedEntity {
    fn from(policy: EntityPolicy) -> Self {
        Self {
            name: policy.name,
            source: policy.source_name,
            requires: policy.requires,
        }
    }
}

/// Prints the entities a run would reconcile, in order.
pub fn run(
    config: &Path,
    selection: &Selection,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let plan = resolve(config, selection)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
        _ => print_text_output(&plan),
    }
    Ok(())
}

fn resolve(
    config: &Path,
    selection: &Selection,
) -> Result<Vec<PlannedEntity>, Box<dyn std::error::Error>> {
    let config = SyncConfig::from_path(config)?;
    let options = selection.apply(config.options.clone());
    let plan = SyncEngine::new(options).plan(config.policies()?)?;
    Ok(plan.into_iter().map(PlannedEntity::from).collect())
}

fn print_text_output(plan: &[PlannedEntity]) {
    println!("Reconciliation Plan");
    println!("===================");
    println!();

    for (i, entity) in plan.iter().enumerate() {
        if entity.requires.is_empty() {
            println!("{:>3}. {} <- {}", i + 1, entity.name, entity.source);
        } else {
            println!(
                "{:>3}. {} <- {} (after {})",
                i + 1,
                entity.name,
                entity.source,
                entity.requires.join(", ")
            );
        }
    }
    println!();
    println!("Entities: {}", plan.len());
}
