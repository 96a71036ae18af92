//! Reconciliation stages.
//!
//! Each entity runs five stages in a fixed order:
//! Conflict → Delete → SoftDelete → Update → Insert.
//! Later stages rely on what earlier ones did: Update and Insert skip staged
//! rows the Conflict stage marked.

mod conflict;
mod delete;
mod insert;
mod soft_delete;
mod update;

pub use conflict::ConflictStage;
pub use delete::DeleteStage;
pub use insert::InsertStage;
pub use soft_delete::SoftDeleteStage;
pub use update::UpdateStage;

use crate::error::SyncResult;
use crate::events::{OperationEvent, OperationPhase, SyncListener};
use crate::expr::Assignment;
use crate::operation::{Comparison, Operand, Operation, Predicate};
use crate::policy::EntityPolicy;
use crate::store::{ForeignKeyGuard, StagedSnapshot, TargetStore};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// Identifies a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Conflict detection and handling.
    Conflict,
    /// Removal of rows missing from the source.
    Delete,
    /// Deactivation of rows missing from the source.
    SoftDelete,
    /// Update of matched rows.
    Update,
    /// Insertion of new rows.
    Insert,
}

impl StageKind {
    /// Stage name.
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Conflict => "conflict",
            StageKind::Delete => "delete",
            StageKind::SoftDelete => "soft_delete",
            StageKind::Update => "update",
            StageKind::Insert => "insert",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage did not apply to this entity or run.
    Skipped,
    /// The stage ran and affected this many rows.
    Affected(usize),
}

impl StageOutcome {
    /// Affected rows, zero when skipped.
    pub fn affected(self) -> usize {
        match self {
            StageOutcome::Skipped => 0,
            StageOutcome::Affected(n) => n,
        }
    }

    /// Returns true if the stage was skipped.
    pub fn is_skipped(self) -> bool {
        self == StageOutcome::Skipped
    }
}

/// Everything a stage works with.
pub struct StageContext<'a> {
    /// Policy in effect for this entity.
    pub policy: &'a EntityPolicy,
    /// Staged source rows.
    pub snapshot: &'a StagedSnapshot,
    /// Target store.
    pub store: &'a mut dyn TargetStore,
    /// Notification sink.
    pub listener: &'a mut dyn SyncListener,
    /// Last successful synchronisation, when running incrementally.
    pub checkpoint: Option<NaiveDateTime>,
    /// Whether only changed source rows were staged.
    pub incremental: bool,
}

impl StageContext<'_> {
    /// Returns true if any source row was staged.
    pub fn staging_non_empty(&self) -> bool {
        self.snapshot.is_non_empty()
    }

    /// Runs an operation with before/after notifications.
    pub fn run(&mut self, phase: OperationPhase, operation: Operation) -> SyncResult<usize> {
        execute(
            &mut *self.store,
            &mut *self.listener,
            self.policy,
            self.snapshot,
            phase,
            operation,
        )
    }

    /// Runs an operation with foreign-key enforcement switched on, so
    /// physical deletes cascade.
    pub fn run_enforced(
        &mut self,
        phase: OperationPhase,
        operation: Operation,
    ) -> SyncResult<usize> {
        let mut guard = ForeignKeyGuard::acquire(&mut *self.store, true)?;
        let affected = execute(
            &mut *guard,
            &mut *self.listener,
            self.policy,
            self.snapshot,
            phase,
            operation,
        );
        let restored = guard.release();
        let affected = affected?;
        restored?;
        Ok(affected)
    }
}

fn execute(
    store: &mut dyn TargetStore,
    listener: &mut dyn SyncListener,
    policy: &EntityPolicy,
    snapshot: &StagedSnapshot,
    phase: OperationPhase,
    operation: Operation,
) -> SyncResult<usize> {
    let mut event = OperationEvent {
        policy,
        phase,
        operation,
        affected: None,
    };
    listener.before_operation(&mut event);
    let affected = store.execute(policy, snapshot, &event.operation)?;
    tracing::debug!(
        entity = %policy.name,
        %phase,
        operation = event.operation.kind(),
        affected,
        "operation executed"
    );
    event.affected = Some(affected);
    listener.after_operation(&event);
    Ok(affected)
}

/// One reconciliation stage.
pub trait Stage {
    /// Which stage this is.
    fn kind(&self) -> StageKind;

    /// Runs the stage for the entity in `ctx`.
    fn process(&self, ctx: &mut StageContext<'_>) -> SyncResult<StageOutcome>;
}

/// Overrides replace base assignments of the same field and extend the rest.
fn merge_assignments(mut base: Vec<Assignment>, overrides: Vec<Assignment>) -> Vec<Assignment> {
    for assignment in overrides {
        match base.iter_mut().find(|a| a.field == assignment.field) {
            Some(existing) => *existing = assignment,
            None => base.push(assignment),
        }
    }
    base
}

fn target_field(field: &str) -> Operand {
    Operand::Target(field.to_string())
}

fn staged_field(field: &str) -> Operand {
    Operand::Staged(field.to_string())
}

/// `_s.<conflicts> = 0`
fn not_conflicted(policy: &EntityPolicy) -> Predicate {
    Predicate::staged_is(&policy.conflicts_field, 0i64)
}

/// `_t.<date> <op> _s.<date>`
fn compare_dates(policy: &EntityPolicy, op: Comparison) -> Predicate {
    Predicate::compare(
        target_field(&policy.date_check_field),
        op,
        staged_field(&policy.date_check_field),
    )
}
