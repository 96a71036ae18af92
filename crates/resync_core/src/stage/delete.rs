//! Delete stage: target rows whose identifier vanished from the source.
//!
//! Only full runs know which rows vanished, so incremental runs skip the
//! stage. Soft-deletable entities are handled by the soft-delete stage.

use super::{Stage, StageContext, StageKind, StageOutcome};
use crate::error::SyncResult;
use crate::events::OperationPhase;
use crate::expr::normalize_set;
use crate::operation::{Operation, Predicate, Scope};
use crate::policy::DeleteAction;

/// Removes (or rewrites) rows missing from the source.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteStage;

impl Stage for DeleteStage {
    fn kind(&self) -> StageKind {
        StageKind::Delete
    }

    fn process(&self, ctx: &mut StageContext<'_>) -> SyncResult<StageOutcome> {
        let policy = ctx.policy;
        if policy.soft_deletable || ctx.incremental {
            return Ok(StageOutcome::Skipped);
        }
        let scope = Scope::Outer {
            identifier: policy.identifier.clone(),
        };

        match policy.on_delete {
            DeleteAction::Ignore => Ok(StageOutcome::Skipped),
            DeleteAction::Delete => {
                let deleted = ctx.run_enforced(
                    OperationPhase::Delete,
                    Operation::Delete {
                        scope,
                        filter: Predicate::StagedMissing,
                    },
                )?;
                Ok(StageOutcome::Affected(deleted))
            }
            DeleteAction::Update => {
                let assignments = normalize_set(&policy.on_delete_set)?;
                if assignments.is_empty() {
                    return Ok(StageOutcome::Skipped);
                }
                let updated = ctx.run(
                    OperationPhase::Delete,
                    Operation::Update {
                        scope,
                        filter: Predicate::StagedMissing,
                        assignments,
                    },
                )?;
                Ok(StageOutcome::Affected(updated))
            }
        }
    }
}
