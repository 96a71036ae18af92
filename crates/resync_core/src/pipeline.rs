//! Per-entity reconciliation pipeline.

use crate::error::SyncResult;
use crate::events::AffectedEvent;
use crate::stage::{
    ConflictStage, DeleteStage, InsertStage, SoftDeleteStage, Stage, StageContext, StageKind,
    StageOutcome, UpdateStage,
};
use serde::Serialize;
use std::fmt;

/// Outcome of every stage for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    /// Stage outcomes in execution order.
    pub stages: Vec<(StageKind, StageOutcome)>,
}

impl PipelineSummary {
    /// Sum of affected rows over all stages.
    pub fn total_affected(&self) -> usize {
        self.stages.iter().map(|(_, o)| o.affected()).sum()
    }

    /// Outcome of one stage, if it ran.
    pub fn outcome(&self, kind: StageKind) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, o)| *o)
    }

    /// Affected rows of one stage.
    pub fn affected(&self, kind: StageKind) -> usize {
        self.outcome(kind).map(StageOutcome::affected).unwrap_or(0)
    }
}

/// Runs the five stages in order for one entity.
pub struct ReconciliationPipeline {
    stages: Vec<Box<dyn Stage>>,
    debug: bool,
}

impl ReconciliationPipeline {
    /// Creates the standard pipeline:
    /// Conflict → Delete → SoftDelete → Update → Insert.
    pub fn new() -> Self {
        Self {
            stages: vec![
                Box::new(ConflictStage),
                Box::new(DeleteStage),
                Box::new(SoftDeleteStage),
                Box::new(UpdateStage),
                Box::new(InsertStage),
            ],
            debug: false,
        }
    }

    /// Reports every stage, including those that affected nothing.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Stage order.
    pub fn stages(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Runs every stage against `ctx`. The first failing stage ends the
    /// entity's cycle.
    pub fn run(&self, ctx: &mut StageContext<'_>) -> SyncResult<PipelineSummary> {
        let mut summary = PipelineSummary::default();
        for stage in &self.stages {
            let kind = stage.kind();
            let outcome = stage.process(ctx)?;
            tracing::debug!(entity = %ctx.policy.name, stage = %kind, ?outcome, "stage finished");

            let affected = outcome.affected();
            if affected > 0 || self.debug {
                ctx.listener.rows_affected(&AffectedEvent {
                    policy: ctx.policy,
                    stage: kind,
                    affected,
                });
            }
            summary.stages.push((kind, outcome));
        }
        Ok(summary)
    }
}

impl fmt::Debug for ReconciliationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationPipeline")
            .field("stages", &self.stages())
            .field("debug", &self.debug)
            .finish()
    }
}

impl Default for ReconciliationPipeline {
    fn default() -> Self {
        Self::new()
    }
}
