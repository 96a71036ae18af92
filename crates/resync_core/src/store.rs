//! Collaborator traits implemented by storage backends.

use crate::error::SyncResult;
use crate::operation::Operation;
use crate::policy::EntityPolicy;
use chrono::NaiveDateTime;
use std::ops::{Deref, DerefMut};

/// Handle to the staged copy of one entity's source rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSnapshot {
    /// Entity name.
    pub entity: String,
    /// Backend name of the staging table.
    pub table: String,
    /// Number of rows staged.
    pub rows: usize,
}

impl StagedSnapshot {
    /// Returns true if at least one source row was staged.
    pub fn is_non_empty(&self) -> bool {
        self.rows > 0
    }
}

/// Copies source rows into an entity-scoped staging area.
pub trait Staging {
    /// Stages the source rows of `policy`, only those changed after `since`
    /// when given. Staged rows carry the mapped target columns plus the
    /// conflict marker column set to `0`.
    fn stage(
        &mut self,
        policy: &EntityPolicy,
        since: Option<NaiveDateTime>,
    ) -> SyncResult<StagedSnapshot>;

    /// Drops the staging area.
    fn release(&mut self, snapshot: &StagedSnapshot) -> SyncResult<()>;
}

/// The store being reconciled.
pub trait TargetStore {
    /// Executes an operation, returning the number of rows affected
    /// (or counted, for [`Operation::Count`]).
    fn execute(
        &mut self,
        policy: &EntityPolicy,
        snapshot: &StagedSnapshot,
        operation: &Operation,
    ) -> SyncResult<usize>;

    /// Returns whether foreign-key enforcement is on.
    fn foreign_keys_enabled(&mut self) -> SyncResult<bool>;

    /// Turns foreign-key enforcement on or off.
    fn set_foreign_keys(&mut self, enabled: bool) -> SyncResult<()>;
}

/// Per-entity checkpoint records.
pub trait CheckpointStore {
    /// Last successful synchronisation of `entity`.
    fn load_checkpoint(&mut self, entity: &str) -> SyncResult<Option<NaiveDateTime>>;

    /// Records a successful synchronisation of `entity`.
    fn save_checkpoint(&mut self, entity: &str, at: NaiveDateTime) -> SyncResult<()>;
}

/// Scoped foreign-key enforcement.
///
/// Sets enforcement on acquisition and puts the previous state back when
/// released or dropped, whichever comes first.
pub struct ForeignKeyGuard<'a, S: TargetStore + ?Sized> {
    store: &'a mut S,
    previous: bool,
    restored: bool,
}

impl<'a, S: TargetStore + ?Sized> ForeignKeyGuard<'a, S> {
    /// Sets enforcement to `enabled` for the lifetime of the guard.
    pub fn acquire(store: &'a mut S, enabled: bool) -> SyncResult<Self> {
        let previous = store.foreign_keys_enabled()?;
        if previous != enabled {
            store.set_foreign_keys(enabled)?;
        }
        tracing::debug!(previous, enabled, "foreign key enforcement switched");
        Ok(Self {
            store,
            previous,
            restored: false,
        })
    }

    /// Enforcement state before the guard was acquired.
    pub fn previous(&self) -> bool {
        self.previous
    }

    /// Restores the previous state, reporting failures.
    pub fn release(mut self) -> SyncResult<()> {
        self.restore()
    }

    fn restore(&mut self) -> SyncResult<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        self.store.set_foreign_keys(self.previous)
    }
}

impl<S: TargetStore + ?Sized> Deref for ForeignKeyGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: TargetStore + ?Sized> DerefMut for ForeignKeyGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

impl<S: TargetStore + ?Sized> Drop for ForeignKeyGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!(error = %e, "failed to restore foreign key enforcement");
        }
    }
}
