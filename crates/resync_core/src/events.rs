//! Reconciliation notifications.
//!
//! Listeners observe every entity and every store operation. The
//! `before_*` hooks receive mutable access: `before_entity` may adjust the
//! policy used for that entity's cycle and `before_operation` may replace
//! the operation about to run.

use crate::error::SyncError;
use crate::operation::Operation;
use crate::pipeline::PipelineSummary;
use crate::policy::EntityPolicy;
use crate::stage::StageKind;
use std::fmt;

/// Point in the pipeline an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationPhase {
    /// Counting conflicting rows.
    ConflictCheck,
    /// Marking conflicts and applying conflict overrides.
    ConflictUpdate,
    /// Marking conflicts and removing conflicting target rows.
    ConflictDelete,
    /// Handling rows missing from the source.
    Delete,
    /// Flagging rows inactive.
    SoftDelete,
    /// Removing stale tombstones.
    Reap,
    /// Updating matched rows.
    Update,
    /// Inserting new rows.
    Insert,
}

impl OperationPhase {
    /// Event-style name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationPhase::ConflictCheck => "conflict_check",
            OperationPhase::ConflictUpdate => "conflict_update",
            OperationPhase::ConflictDelete => "conflict_delete",
            OperationPhase::Delete => "delete",
            OperationPhase::SoftDelete => "soft_delete",
            OperationPhase::Reap => "reap",
            OperationPhase::Update => "update",
            OperationPhase::Insert => "insert",
        }
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation about to run, or that just ran.
#[derive(Debug, Clone)]
pub struct OperationEvent<'a> {
    /// Policy in effect.
    pub policy: &'a EntityPolicy,
    /// Pipeline phase.
    pub phase: OperationPhase,
    /// The operation. Listeners may replace it before execution.
    pub operation: Operation,
    /// Rows affected; `None` before execution.
    pub affected: Option<usize>,
}

/// Rows affected by one stage.
#[derive(Debug, Clone)]
pub struct AffectedEvent<'a> {
    /// Policy in effect.
    pub policy: &'a EntityPolicy,
    /// Stage.
    pub stage: StageKind,
    /// Affected rows.
    pub affected: usize,
}

/// Receives reconciliation notifications. Every hook defaults to a no-op.
pub trait SyncListener {
    /// Before an entity is staged. May adjust the policy for this cycle.
    fn before_entity(&mut self, _policy: &mut EntityPolicy) {}

    /// After an entity completed.
    fn after_entity(&mut self, _policy: &EntityPolicy, _summary: &PipelineSummary) {}

    /// An entity failed.
    fn entity_failed(&mut self, _policy: &EntityPolicy, _error: &SyncError) {}

    /// Before an operation runs. May replace `event.operation`.
    fn before_operation(&mut self, _event: &mut OperationEvent<'_>) {}

    /// After an operation ran.
    fn after_operation(&mut self, _event: &OperationEvent<'_>) {}

    /// A stage affected rows (or debug reporting is on).
    fn rows_affected(&mut self, _event: &AffectedEvent<'_>) {}
}

/// Fans notifications out to listeners in registration order.
#[derive(Default)]
pub struct Dispatcher {
    listeners: Vec<Box<dyn SyncListener>>,
}

impl Dispatcher {
    /// Creates a dispatcher without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add(&mut self, listener: Box<dyn SyncListener>) {
        self.listeners.push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl SyncListener for Dispatcher {
    fn before_entity(&mut self, policy: &mut EntityPolicy) {
        for l in &mut self.listeners {
            l.before_entity(policy);
        }
    }

    fn after_entity(&mut self, policy: &EntityPolicy, summary: &PipelineSummary) {
        for l in &mut self.listeners {
            l.after_entity(policy, summary);
        }
    }

    fn entity_failed(&mut self, policy: &EntityPolicy, error: &SyncError) {
        for l in &mut self.listeners {
            l.entity_failed(policy, error);
        }
    }

    fn before_operation(&mut self, event: &mut OperationEvent<'_>) {
        for l in &mut self.listeners {
            l.before_operation(event);
        }
    }

    fn after_operation(&mut self, event: &OperationEvent<'_>) {
        for l in &mut self.listeners {
            l.after_operation(event);
        }
    }

    fn rows_affected(&mut self, event: &AffectedEvent<'_>) {
        for l in &mut self.listeners {
            l.rows_affected(event);
        }
    }
}

/// Logs every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl SyncListener for TracingListener {
    fn before_entity(&mut self, policy: &mut EntityPolicy) {
        tracing::debug!(entity = %policy.name, "entity starting");
    }

    fn after_entity(&mut self, policy: &EntityPolicy, summary: &PipelineSummary) {
        tracing::info!(
            entity = %policy.name,
            affected = summary.total_affected(),
            "entity reconciled"
        );
    }

    fn entity_failed(&mut self, policy: &EntityPolicy, error: &SyncError) {
        tracing::error!(entity = %policy.name, error = %error, "entity failed");
    }

    fn before_operation(&mut self, event: &mut OperationEvent<'_>) {
        tracing::trace!(
            entity = %event.policy.name,
            phase = %event.phase,
            operation = %event.operation,
            "operation starting"
        );
    }

    fn after_operation(&mut self, event: &OperationEvent<'_>) {
        tracing::debug!(
            entity = %event.policy.name,
            phase = %event.phase,
            affected = ?event.affected,
            "operation finished"
        );
    }

    fn rows_affected(&mut self, event: &AffectedEvent<'_>) {
        tracing::info!(
            entity = %event.policy.name,
            stage = %event.stage,
            affected = event.affected,
            "rows affected"
        );
    }
}
