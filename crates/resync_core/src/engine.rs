//! The reconciliation engine.
//!
//! A run resolves the dependency graph of the configured entities, then
//! reconciles them one at a time, dependencies first:
//!
//! 1. `before_entity` notification (may adjust the policy for this cycle)
//! 2. read the checkpoint (incremental runs only)
//! 3. stage the source rows
//! 4. run the pipeline
//! 5. release staging, unless kept
//! 6. record the checkpoint
//!
//! Foreign-key enforcement is off for the whole run and restored afterwards,
//! whichever way the run ends.

use crate::config::SyncOptions;
use crate::error::SyncResult;
use crate::events::{Dispatcher, SyncListener};
use crate::graph::EntityGraph;
use crate::pipeline::{PipelineSummary, ReconciliationPipeline};
use crate::policy::EntityPolicy;
use crate::stage::StageContext;
use crate::store::{CheckpointStore, ForeignKeyGuard, Staging, TargetStore};
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;

/// Result of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    /// Entity name.
    pub name: String,
    /// Stage outcomes, when the entity completed.
    pub summary: Option<PipelineSummary>,
    /// Failure message, when the entity failed.
    pub error: Option<String>,
}

impl EntityReport {
    /// Returns true if the entity completed.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Entities attempted, in order.
    pub entities: Vec<EntityReport>,
    /// Entity whose conflicts aborted the run.
    pub aborted: Option<String>,
}

impl SyncReport {
    /// Returns true if every attempted entity completed and nothing aborted.
    pub fn success(&self) -> bool {
        self.aborted.is_none() && self.entities.iter().all(EntityReport::succeeded)
    }

    /// Entities that failed.
    pub fn failures(&self) -> impl Iterator<Item = &EntityReport> {
        self.entities.iter().filter(|e| !e.succeeded())
    }

    /// Report of one entity.
    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Total rows affected over all entities.
    pub fn total_affected(&self) -> usize {
        self.entities
            .iter()
            .filter_map(|e| e.summary.as_ref())
            .map(PipelineSummary::total_affected)
            .sum()
    }
}

/// Drives reconciliation runs.
#[derive(Debug)]
pub struct SyncEngine {
    options: SyncOptions,
    pipeline: ReconciliationPipeline,
    listeners: Dispatcher,
}

impl SyncEngine {
    /// Creates an engine.
    pub fn new(options: SyncOptions) -> Self {
        let pipeline = ReconciliationPipeline::new().with_debug(options.debug);
        Self {
            options,
            pipeline,
            listeners: Dispatcher::new(),
        }
    }

    /// Registers a listener.
    pub fn with_listener(mut self, listener: impl SyncListener + 'static) -> Self {
        self.listeners.add(Box::new(listener));
        self
    }

    /// Run options.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Resolves which entities run, in dependency order.
    pub fn plan(&self, policies: Vec<EntityPolicy>) -> SyncResult<Vec<EntityPolicy>> {
        let mut graph = EntityGraph::from_policies(policies)?;
        if !self.options.include.is_empty() {
            let mut keys = self.options.include.clone();
            if self.options.add_relations {
                keys = graph.expand_descendants(&keys);
            }
            graph = graph.filter_to_keys_and_ancestors(&keys);
        }
        if !self.options.exclude.is_empty() {
            graph = graph.exclude_with_descendants(&self.options.exclude);
        }
        graph.into_ordered()
    }

    /// Reconciles every planned entity.
    ///
    /// Configuration errors fail the call before anything runs; entity
    /// failures are recorded in the report.
    pub fn run<S>(&mut self, policies: Vec<EntityPolicy>, store: &mut S) -> SyncResult<SyncReport>
    where
        S: Staging + TargetStore + CheckpointStore,
    {
        let plan = self.plan(policies)?;
        tracing::info!(
            entities = plan.len(),
            incremental = self.options.incremental,
            "reconciliation starting"
        );

        let mut store = ForeignKeyGuard::acquire(store, false)?;
        let mut report = SyncReport::default();
        for planned in plan {
            let mut policy = planned;
            self.listeners.before_entity(&mut policy);

            match self.reconcile(&policy, &mut *store) {
                Ok(summary) => {
                    tracing::info!(
                        entity = %policy.name,
                        affected = summary.total_affected(),
                        "entity reconciled"
                    );
                    self.listeners.after_entity(&policy, &summary);
                    report.entities.push(EntityReport {
                        name: policy.name.clone(),
                        summary: Some(summary),
                        error: None,
                    });
                }
                Err(error) => {
                    tracing::error!(entity = %policy.name, error = %error, "entity failed");
                    self.listeners.entity_failed(&policy, &error);
                    report.entities.push(EntityReport {
                        name: policy.name.clone(),
                        summary: None,
                        error: Some(error.to_string()),
                    });
                    if error.is_run_fatal() {
                        report.aborted = Some(policy.name.clone());
                        break;
                    }
                }
            }
        }
        if let Err(e) = store.release() {
            tracing::warn!(error = %e, "failed to restore foreign key enforcement");
        }

        tracing::info!(
            success = report.success(),
            affected = report.total_affected(),
            "reconciliation finished"
        );
        Ok(report)
    }

    fn reconcile<S>(&mut self, policy: &EntityPolicy, store: &mut S) -> SyncResult<PipelineSummary>
    where
        S: Staging + TargetStore + CheckpointStore,
    {
        let checkpoint = if self.options.incremental {
            store.load_checkpoint(&policy.name)?
        } else {
            None
        };
        let started = now();
        let snapshot = store.stage(policy, checkpoint)?;
        tracing::debug!(
            entity = %policy.name,
            rows = snapshot.rows,
            since = ?checkpoint,
            "source rows staged"
        );

        let outcome = {
            let mut ctx = StageContext {
                policy,
                snapshot: &snapshot,
                store: &mut *store,
                listener: &mut self.listeners,
                checkpoint,
                incremental: self.options.incremental,
            };
            self.pipeline.run(&mut ctx)
        };

        if !self.options.keep_staging {
            if let Err(e) = store.release(&snapshot) {
                tracing::warn!(entity = %policy.name, error = %e, "failed to release staging");
            }
        }
        let summary = outcome?;

        if self.options.save_checkpoints {
            store.save_checkpoint(&policy.name, started)?;
        }
        Ok(summary)
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}
