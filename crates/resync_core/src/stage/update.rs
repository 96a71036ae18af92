//! Update stage.

use super::{
    compare_dates, merge_assignments, not_conflicted, staged_field, Stage, StageContext,
    StageKind, StageOutcome,
};
use crate::error::SyncResult;
use crate::events::OperationPhase;
use crate::expr::{normalize_set, Assignment, Expr};
use crate::operation::{Comparison, Operand, Operation, Predicate, Scope};
use crate::policy::UpdateAction;
use crate::value::Value;

/// Applies the update override set to matched rows that are not newer on
/// the target side. Fields outside the set are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateStage;

impl Stage for UpdateStage {
    fn kind(&self) -> StageKind {
        StageKind::Update
    }

    fn process(&self, ctx: &mut StageContext<'_>) -> SyncResult<StageOutcome> {
        let policy = ctx.policy;
        if !ctx.staging_non_empty()
            || policy.on_update == UpdateAction::Ignore
            || policy.on_update_set.is_empty()
        {
            return Ok(StageOutcome::Skipped);
        }

        let mut filter = Predicate::All(vec![
            not_conflicted(policy),
            compare_dates(policy, Comparison::Le),
        ]);
        let mut base = Vec::new();
        if policy.soft_deletable {
            filter = filter.and(Predicate::compare(
                staged_field(&policy.soft_delete_field),
                Comparison::Eq,
                Operand::Value(Value::from(true)),
            ));
            // Rows active again in the source come back to life.
            base.push(Assignment::new(
                policy.soft_delete_field.clone(),
                Expr::staged(policy.soft_delete_field.clone()),
            ));
        }
        let assignments = merge_assignments(base, normalize_set(&policy.on_update_set)?);

        let updated = ctx.run(
            OperationPhase::Update,
            Operation::Update {
                scope: Scope::Matched(policy.match_rule()),
                filter,
                assignments,
            },
        )?;
        Ok(StageOutcome::Affected(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{policy, run_stage, ScriptedStore};
    use super::*;
    use crate::policy::OverrideSet;
    use serde_json::json;

    fn title_set() -> OverrideSet {
        let mut set = OverrideSet::new();
        set.insert("title".into(), json!(null));
        set
    }

    #[test]
    fn sync_by_exception() {
        let mut store = ScriptedStore::default();
        let empty = policy().with_on_update(UpdateAction::Update, OverrideSet::new());
        let (outcome, _) = run_stage(&UpdateStage, &empty, 5, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);

        let ignored = policy().with_on_update(UpdateAction::Ignore, title_set());
        let (outcome, _) = run_stage(&UpdateStage, &ignored, 5, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);

        let nothing_staged = policy().with_on_update(UpdateAction::Update, title_set());
        let (outcome, _) = run_stage(&UpdateStage, &nothing_staged, 0, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);
        assert!(store.executed.is_empty());
    }

    #[test]
    fn update_filter_and_assignments() {
        let policy = policy()
            .map_field("active", "active")
            .with_soft_delete("active")
            .with_unique(["title"])
            .with_on_update(UpdateAction::Update, title_set());
        let mut store = ScriptedStore {
            answers: vec![7],
            ..Default::default()
        };
        let (outcome, _) = run_stage(&UpdateStage, &policy, 9, true, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Affected(7));

        match &store.executed[0] {
            Operation::Update {
                scope: Scope::Matched(rule),
                filter,
                assignments,
            } => {
                assert_eq!(rule.alternates, vec![vec!["title".to_string()]]);
                assert_eq!(
                    filter.to_string(),
                    "(_s.conflicts = 0 AND _t.date_updated <= _s.date_updated AND _s.active = 1)"
                );
                let rendered: Vec<_> = assignments.iter().map(ToString::to_string).collect();
                assert_eq!(rendered, vec!["active = _s.active", "title = _s.title"]);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }
}
