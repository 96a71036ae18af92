//! Conflict stage.
//!
//! A conflict is a target row modified after its staged counterpart, i.e.
//! changed locally since the source was read. When incremental, only target
//! changes after the last checkpoint count. For soft-deletable entities only
//! active target rows count.

use super::{compare_dates, Stage, StageContext, StageKind, StageOutcome};
use crate::error::{SyncError, SyncResult};
use crate::events::OperationPhase;
use crate::expr::normalize_set;
use crate::operation::{Comparison, Operand, Operation, Predicate, Scope};
use crate::policy::{ConflictAction, MatchRule};
use crate::value::Value;

/// Detects and handles conflicting rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictStage;

impl ConflictStage {
    fn filter(ctx: &StageContext<'_>) -> Predicate {
        let policy = ctx.policy;
        let mut filter = Predicate::always().and(compare_dates(policy, Comparison::Gt));
        if ctx.incremental {
            if let Some(checkpoint) = ctx.checkpoint {
                filter = filter.and(Predicate::compare(
                    Operand::Target(policy.date_check_field.clone()),
                    Comparison::Gt,
                    Operand::Value(Value::timestamp(checkpoint)),
                ));
            }
        }
        if policy.soft_deletable {
            filter = filter.and(Predicate::target_is(&policy.soft_delete_field, true));
        }
        filter
    }
}

impl ConflictStage {
    /// Counts conflicting rows and reports whether there are any.
    fn detected(
        ctx: &mut StageContext<'_>,
        rule: &MatchRule,
        filter: &Predicate,
    ) -> SyncResult<bool> {
        let policy = ctx.policy;
        let conflicts = ctx.run(
            OperationPhase::ConflictCheck,
            Operation::Count {
                rule: rule.clone(),
                filter: filter.clone(),
            },
        )?;
        if conflicts > 0 {
            tracing::warn!(
                entity = %policy.name,
                conflicts,
                action = %policy.on_conflict,
                "target rows changed since the source was read"
            );
        }
        Ok(conflicts > 0)
    }
}

impl Stage for ConflictStage {
    fn kind(&self) -> StageKind {
        StageKind::Conflict
    }

    fn process(&self, ctx: &mut StageContext<'_>) -> SyncResult<StageOutcome> {
        let policy = ctx.policy;
        if !ctx.staging_non_empty() {
            return Ok(StageOutcome::Skipped);
        }

        let rule = policy.match_rule();
        let filter = Self::filter(ctx);
        let mark = Operation::MarkConflicts {
            rule: rule.clone(),
            filter: filter.clone(),
            marker: policy.conflicts_field.clone(),
        };
        match policy.on_conflict {
            ConflictAction::Ignore => Ok(StageOutcome::Skipped),
            ConflictAction::Abort => {
                if !Self::detected(ctx, &rule, &filter)? {
                    return Ok(StageOutcome::Skipped);
                }
                Err(SyncError::Aborted {
                    entity: policy.name.clone(),
                })
            }
            ConflictAction::Update => {
                if !Self::detected(ctx, &rule, &filter)? {
                    return Ok(StageOutcome::Skipped);
                }
                let assignments = normalize_set(&policy.on_conflict_set)?;
                let marked = ctx.run(OperationPhase::ConflictUpdate, mark)?;
                if assignments.is_empty() {
                    return Ok(StageOutcome::Affected(marked));
                }
                let updated = ctx.run(
                    OperationPhase::ConflictUpdate,
                    Operation::Update {
                        scope: Scope::Matched(rule),
                        filter,
                        assignments,
                    },
                )?;
                Ok(StageOutcome::Affected(updated))
            }
            ConflictAction::Delete => {
                if !Self::detected(ctx, &rule, &filter)? {
                    return Ok(StageOutcome::Skipped);
                }
                ctx.run(OperationPhase::ConflictDelete, mark)?;
                let deleted = ctx.run(
                    OperationPhase::ConflictDelete,
                    Operation::Delete {
                        scope: Scope::Matched(rule),
                        filter,
                    },
                )?;
                Ok(StageOutcome::Affected(deleted))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{policy, run_stage, ScriptedStore};
    use super::*;
    use crate::policy::OverrideSet;
    use serde_json::json;

    #[test]
    fn skipped_on_ignore_or_empty_staging() {
        let mut store = ScriptedStore::default();
        let (outcome, _) = run_stage(&ConflictStage, &policy(), 5, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);

        let policy = policy().with_on_conflict(ConflictAction::Abort, OverrideSet::new());
        let (outcome, _) = run_stage(&ConflictStage, &policy, 0, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);
        assert!(store.executed.is_empty());
    }

    #[test]
    fn ignore_never_counts() {
        let mut store = ScriptedStore {
            answers: vec![4],
            ..Default::default()
        };
        let (outcome, phases) = run_stage(&ConflictStage, &policy(), 3, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);
        assert!(phases.is_empty());
        assert!(store.executed.is_empty());
    }

    #[test]
    fn no_conflicts_skips() {
        let policy = policy().with_on_conflict(ConflictAction::Abort, OverrideSet::new());
        let mut store = ScriptedStore {
            answers: vec![0],
            ..Default::default()
        };
        let (outcome, phases) = run_stage(&ConflictStage, &policy, 3, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);
        assert_eq!(phases, vec![OperationPhase::ConflictCheck]);
    }

    #[test]
    fn abort_raises() {
        let policy = policy().with_on_conflict(ConflictAction::Abort, OverrideSet::new());
        let mut store = ScriptedStore {
            answers: vec![2],
            ..Default::default()
        };
        let (outcome, _) = run_stage(&ConflictStage, &policy, 3, false, &mut store);
        assert!(outcome.unwrap_err().is_run_fatal());
    }

    #[test]
    fn update_marks_before_touching_target() {
        let mut set = OverrideSet::new();
        set.insert("title".into(), json!(null));
        let policy = policy()
            .with_soft_delete("title")
            .with_on_conflict(ConflictAction::Update, set);
        let mut store = ScriptedStore {
            answers: vec![2, 2, 2],
            ..Default::default()
        };
        let (outcome, phases) = run_stage(&ConflictStage, &policy, 3, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Affected(2));
        assert_eq!(
            phases,
            vec![
                OperationPhase::ConflictCheck,
                OperationPhase::ConflictUpdate,
                OperationPhase::ConflictUpdate
            ]
        );
        assert!(matches!(store.executed[1], Operation::MarkConflicts { .. }));
        match &store.executed[2] {
            Operation::Update { filter, .. } => {
                assert_eq!(
                    filter.to_string(),
                    "(_t.date_updated > _s.date_updated AND _t.title = 1)"
                );
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn delete_marks_then_deletes() {
        let policy = policy().with_on_conflict(ConflictAction::Delete, OverrideSet::new());
        let mut store = ScriptedStore {
            answers: vec![1, 1, 1],
            ..Default::default()
        };
        let (outcome, phases) = run_stage(&ConflictStage, &policy, 3, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Affected(1));
        assert_eq!(phases.len(), 3);
        assert!(matches!(store.executed[2], Operation::Delete { .. }));
    }
}
