//! Insert stage.

use super::{
    merge_assignments, not_conflicted, staged_field, Stage, StageContext, StageKind, StageOutcome,
};
use crate::error::SyncResult;
use crate::events::OperationPhase;
use crate::expr::{normalize_set, Assignment, Expr};
use crate::operation::{Comparison, Operand, Operation, Predicate};
use crate::policy::InsertAction;
use crate::value::Value;

/// Inserts staged rows without a target counterpart. Rows colliding with a
/// uniqueness constraint are skipped by the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsertStage;

impl Stage for InsertStage {
    fn kind(&self) -> StageKind {
        StageKind::Insert
    }

    fn process(&self, ctx: &mut StageContext<'_>) -> SyncResult<StageOutcome> {
        let policy = ctx.policy;
        if !ctx.staging_non_empty() || policy.on_insert == InsertAction::Ignore {
            return Ok(StageOutcome::Skipped);
        }

        let mut filter = Predicate::All(vec![not_conflicted(policy)]);
        if policy.soft_deletable {
            filter = filter.and(Predicate::compare(
                staged_field(&policy.soft_delete_field),
                Comparison::Eq,
                Operand::Value(Value::from(true)),
            ));
        }

        let copies = policy
            .target_fields()
            .map(|field| Assignment::new(field, Expr::staged(field)))
            .collect();
        let assignments = merge_assignments(copies, normalize_set(&policy.on_insert_set)?);

        let inserted = ctx.run(
            OperationPhase::Insert,
            Operation::Insert {
                rule: policy.match_rule(),
                filter,
                assignments,
            },
        )?;
        Ok(StageOutcome::Affected(inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{policy, run_stage, ScriptedStore};
    use super::*;
    use crate::policy::OverrideSet;
    use serde_json::json;

    #[test]
    fn skipped_on_ignore_or_empty() {
        let mut store = ScriptedStore::default();
        let (outcome, _) = run_stage(&InsertStage, &policy(), 0, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);

        let ignored = policy().with_on_insert(InsertAction::Ignore, OverrideSet::new());
        let (outcome, _) = run_stage(&InsertStage, &ignored, 3, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Skipped);
        assert!(store.executed.is_empty());
    }

    #[test]
    fn overrides_replace_and_extend_mapping() {
        let mut set = OverrideSet::new();
        set.insert("title".into(), json!("IFNULL(,'untitled')"));
        set.insert("date_created".into(), json!("NOW()"));
        let policy = policy().with_on_insert(InsertAction::Update, set);
        let mut store = ScriptedStore {
            answers: vec![2],
            ..Default::default()
        };
        let (outcome, phases) = run_stage(&InsertStage, &policy, 3, false, &mut store);
        assert_eq!(outcome.unwrap(), StageOutcome::Affected(2));
        assert_eq!(phases, vec![OperationPhase::Insert]);

        match &store.executed[0] {
            Operation::Insert {
                filter,
                assignments,
                ..
            } => {
                assert_eq!(filter.to_string(), "(_s.conflicts = 0)");
                let rendered: Vec<_> = assignments.iter().map(ToString::to_string).collect();
                assert_eq!(
                    rendered,
                    vec![
                        "id = _s.id",
                        "title = IFNULL(_s.title, 'untitled')",
                        "date_updated = _s.date_updated",
                        "date_created = NOW()",
                    ]
                );
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }
}
