//! # Resync Core
//!
//! Policy-driven reconciliation of staged source rows into target tables.
//!
//! This crate provides:
//! - Entity policies and their JSON configuration
//! - The entity dependency graph and its filters
//! - Override expressions for update, insert and conflict assignments
//! - The five-stage reconciliation pipeline
//! - The run engine with checkpoints and notifications
//! - Storage traits plus an in-memory backend
//!
//! ## Architecture
//!
//! Every entity is reconciled in a **stage-then-apply** cycle:
//! 1. Source rows matching the entity's filters are copied into staging
//! 2. Conflict → Delete → SoftDelete → Update → Insert run against the target
//! 3. Staging is released and the cycle start time recorded as checkpoint
//!
//! Stages never touch storage directly. They build [`Operation`] values and
//! hand them to a [`TargetStore`], which executes them in its own dialect.
//!
//! ## Key Invariants
//!
//! - Dependencies are reconciled before their dependents
//! - Staged rows marked as conflicting are never updated or inserted
//! - Deletes run before inserts within one entity
//! - Foreign-key enforcement is restored after every run, even a failed one
//! - An aborting conflict stops the run; earlier entities stay applied

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod events;
mod expr;
mod graph;
mod memory;
mod operation;
mod pipeline;
mod policy;
pub mod stage;
mod store;
mod value;

pub use config::{validate, EntityConfig, OneOrMany, SyncConfig, SyncOptions};
pub use engine::{EntityReport, SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use events::{
    AffectedEvent, Dispatcher, OperationEvent, OperationPhase, SyncListener, TracingListener,
};
pub use expr::{normalize, normalize_set, Assignment, Expr, STAGED_ALIAS};
pub use graph::{EntityGraph, EntityNode};
pub use memory::{row, ForeignKey, MemoryStore, MemoryTable};
pub use operation::{Comparison, Operand, Operation, Predicate, Scope};
pub use pipeline::{PipelineSummary, ReconciliationPipeline};
pub use policy::{
    ConflictAction, DeleteAction, EntityPolicy, FieldMapping, InsertAction, MatchRule,
    OverrideSet, PolicyAction, SourceCondition, UpdateAction,
};
pub use stage::{Stage, StageContext, StageKind, StageOutcome};
pub use store::{CheckpointStore, ForeignKeyGuard, StagedSnapshot, Staging, TargetStore};
pub use value::{Row, Value, TIMESTAMP_FORMAT};
