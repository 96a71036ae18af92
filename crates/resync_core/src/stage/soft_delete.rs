//! Soft-delete stage.
//!
//! An active target row is deactivated when its staged counterpart is
//! flagged inactive, or, on full runs, when it has no staged counterpart.
//! With the `delete` action, full runs first remove tombstones: rows that
//! were already inactive and are no longer in the source. A row that just
//! vanished is therefore only deactivated; the next full run reaps it.

use super::{merge_assignments, staged_field, Stage, StageContext, StageKind, StageOutcome};
use crate::error::SyncResult;
use crate::events::OperationPhase;
use crate::expr::{normalize_set, Assignment, Expr};
use crate::operation::{Comparison, Operand, Operation, Predicate, Scope};
use crate::policy::{DeleteAction, EntityPolicy};
use crate::value::Value;

/// Flags vanished or source-deactivated rows inactive.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftDeleteStage;

impl SoftDeleteStage {
    fn staged_inactive(policy: &EntityPolicy) -> Predicate {
        Predicate::compare(
            staged_field(&policy.soft_delete_field),
            Comparison::Eq,
            Operand::Value(Value::from(false)),
        )
    }

    fn deactivation_filter(policy: &EntityPolicy, incremental: bool) -> Predicate {
        let qualifies = if incremental {
            Predicate::All(vec![Predicate::StagedPresent, Self::staged_inactive(policy)])
        } else {
            Predicate::Any(vec![Predicate::StagedMissing, Self::staged_inactive(policy)])
        };
        Predicate::All(vec![
            qualifies,
            Predicate::target_is(&policy.soft_delete_field, true),
        ])
    }
}

impl Stage for SoftDeleteStage {
    fn kind(&self) -> StageKind {
        StageKind::SoftDelete
    }

    fn process(&self, ctx: &mut StageContext<'_>) -> SyncResult<StageOutcome> {
        let policy = ctx.policy;
        if !policy.soft_deletable || policy.on_delete == DeleteAction::Ignore {
            return Ok(StageOutcome::Skipped);
        }
        let scope = Scope::Outer {
            identifier: policy.identifier.clone(),
        };
        let assignments = merge_assignments(
            vec![Assignment::new(
                policy.soft_delete_field.clone(),
                Expr::literal(false),
            )],
            normalize_set(&policy.on_delete_set)?,
        );

        let mut affected = 0;
        if policy.on_delete == DeleteAction::Delete && !ctx.incremental {
            affected += ctx.run(
                OperationPhase::Reap,
                Operation::Delete {
                    scope: scope.clone(),
                    filter: Predicate::All(vec![
                        Predicate::target_is(&policy.soft_delete_field, false),
                        Predicate::StagedMissing,
                    ]),
                },
            )?;
        }

        affected += ctx.run(
            OperationPhase::SoftDelete,
            Operation::Update {
                scope,
                filter: Self::deactivation_filter(policy, ctx.incremental),
                assignments,
            },
        )?;
        Ok(StageOutcome::Affected(affected))
    }
}
