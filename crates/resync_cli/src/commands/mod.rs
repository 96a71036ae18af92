//! CLI command implementations.

pub mod plan;
pub mod run;

use clap::Args;
use resync_core::SyncOptions;
use thiserror::Error;

/// Entity selection shared by `run` and `plan`.
#[derive(Debug, Clone, Default, Args)]
pub struct Selection {
    /// Only these entities (plus their dependencies)
    #[arg(short, long, value_delimiter = ',')]
    pub include: Vec<String>,

    /// Skip these entities (plus their dependents)
    #[arg(short = 'x', long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Also run dependents of included entities
    #[arg(long)]
    pub add_relations: bool,
}

impl Selection {
    /// Overrides the configured selection where flags were given.
    pub fn apply(&self, mut options: SyncOptions) -> SyncOptions {
        if !self.include.is_empty() {
            options.include = self.include.clone();
        }
        if !self.exclude.is_empty() {
            options.exclude = self.exclude.clone();
        }
        if self.add_relations {
            options.add_relations = true;
        }
        options
    }
}

/// Failures reported through the exit status.
#[derive(Debug, Error)]
pub enum CliError {
    /// A conflict policy aborted the run.
    #[error("reconciliation aborted on conflicts in '{0}'")]
    Aborted(String),

    /// Some entities failed.
    #[error("reconciliation finished with {0} failed entities")]
    Failed(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_configuration() {
        let configured = SyncOptions::new()
            .with_include(["users"])
            .with_exclude(["logs"]);

        let untouched = Selection::default().apply(configured.clone());
        assert_eq!(untouched, configured);

        let selection = Selection {
            include: vec!["posts".into()],
            exclude: Vec::new(),
            add_relations: true,
        };
        let options = selection.apply(configured);
        assert_eq!(options.include, vec!["posts"]);
        assert_eq!(options.exclude, vec!["logs"]);
        assert!(options.add_relations);
    }
}
