//! Per-entity reconciliation policies.
//!
//! An [`EntityPolicy`] is the resolved, validated form of one entity's
//! configuration. Each stage reads the slot it owns: the conflict stage reads
//! `on_conflict`, the delete stages read `on_delete` and so on. Actions are
//! closed enums per slot so that, for example, `abort` can only be expressed
//! for conflicts.

use crate::error::{SyncError, SyncResult};
use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Override set: target field to raw expression (see [`crate::expr`]).
pub type OverrideSet = BTreeMap<String, serde_json::Value>;

/// Common behaviour of the per-slot action enums.
pub trait PolicyAction: Sized + Copy + 'static {
    /// Every value the slot accepts.
    const ALLOWED: &'static [Self];

    /// Configuration name of the value.
    fn name(self) -> &'static str;

    /// Narrows a raw action value into this slot.
    fn narrow(entity: &str, slot: &str, value: &str) -> SyncResult<Self> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALLOWED
            .iter()
            .copied()
            .find(|a| a.name() == wanted)
            .ok_or_else(|| SyncError::UnexpectedPolicyValue {
                entity: entity.to_string(),
                action: slot.to_string(),
                value: value.to_string(),
            })
    }
}

macro_rules! display_action {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

/// What to do when target rows changed after the snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    /// Leave conflicts alone.
    #[default]
    Ignore,
    /// Mark conflicts and apply the conflict override set to the target.
    Update,
    /// Mark conflicts and remove the conflicting target rows.
    Delete,
    /// Stop the whole run.
    Abort,
}

impl PolicyAction for ConflictAction {
    const ALLOWED: &'static [Self] = &[Self::Ignore, Self::Update, Self::Delete, Self::Abort];

    fn name(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Abort => "abort",
        }
    }
}

/// What to do with target rows that disappeared from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteAction {
    /// Keep them.
    #[default]
    Ignore,
    /// Apply the delete override set (or flag inactive when soft-deletable).
    Update,
    /// Remove them.
    Delete,
}

impl PolicyAction for DeleteAction {
    const ALLOWED: &'static [Self] = &[Self::Ignore, Self::Update, Self::Delete];

    fn name(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// What to do with target rows that still exist in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    /// Keep them as they are.
    #[default]
    Ignore,
    /// Apply the update override set.
    Update,
}

impl PolicyAction for UpdateAction {
    const ALLOWED: &'static [Self] = &[Self::Ignore, Self::Update];

    fn name(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Update => "update",
        }
    }
}

/// What to do with source rows missing from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertAction {
    /// Do not insert.
    Ignore,
    /// Insert them.
    #[default]
    Update,
}

impl PolicyAction for InsertAction {
    const ALLOWED: &'static [Self] = &[Self::Ignore, Self::Update];

    fn name(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Update => "update",
        }
    }
}

display_action!(ConflictAction);
display_action!(DeleteAction);
display_action!(UpdateAction);
display_action!(InsertAction);

/// A source field copied into a target field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Column in the source table.
    pub source: String,
    /// Column in the target (and staging) table.
    pub target: String,
}

/// Filter applied when copying source rows into staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceCondition {
    /// Raw boolean expression over source columns.
    Raw(String),
    /// Column equality tests, all of which must hold. A list value matches
    /// any of its items.
    Equals(BTreeMap<String, serde_json::Value>),
}

/// Rule deciding whether a staged row and a target row are the same entity.
///
/// Rows match when their identifiers are equal, or when every field of any
/// alternate uniqueness set is equal. NULL never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    /// Primary identifier field.
    pub identifier: String,
    /// Alternate uniqueness sets.
    pub alternates: Vec<Vec<String>>,
}

impl MatchRule {
    /// Creates a rule matching on the identifier only.
    pub fn identifier(field: impl Into<String>) -> Self {
        Self {
            identifier: field.into(),
            alternates: Vec::new(),
        }
    }

    /// Returns true if the two rows describe the same entity.
    pub fn same_entity(&self, staged: &Row, target: &Row) -> bool {
        if fields_equal(staged, target, std::slice::from_ref(&self.identifier)) {
            return true;
        }
        self.alternates
            .iter()
            .filter(|set| !set.is_empty())
            .any(|set| fields_equal(staged, target, set))
    }
}

fn fields_equal(a: &Row, b: &Row, fields: &[String]) -> bool {
    fields.iter().all(|f| {
        let left = a.get(f).unwrap_or(&Value::Null);
        let right = b.get(f).unwrap_or(&Value::Null);
        left.sql_cmp(right) == Some(Ordering::Equal)
    })
}

/// Resolved reconciliation policy of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPolicy {
    /// Entity (and target table) name.
    pub name: String,
    /// Source table name.
    pub source_name: String,
    /// Identifier field (target naming).
    pub identifier: String,
    /// Source to target field mapping, in column order.
    pub mapping: Vec<FieldMapping>,
    /// Action for target rows missing from the source.
    pub on_delete: DeleteAction,
    /// Overrides applied by delete-as-update and soft delete.
    pub on_delete_set: OverrideSet,
    /// Action for rows present on both sides.
    pub on_update: UpdateAction,
    /// Overrides applied by the update stage.
    pub on_update_set: OverrideSet,
    /// Action for source rows missing from the target.
    pub on_insert: InsertAction,
    /// Overrides merged into inserted rows.
    pub on_insert_set: OverrideSet,
    /// Action for conflicting rows.
    pub on_conflict: ConflictAction,
    /// Overrides applied to conflicting target rows.
    pub on_conflict_set: OverrideSet,
    /// Alternate uniqueness sets.
    pub unique: Vec<Vec<String>>,
    /// Modification timestamp field.
    pub date_check_field: String,
    /// Whether rows are flagged inactive instead of removed.
    pub soft_deletable: bool,
    /// Activity flag field (`1` active, `0` deleted).
    pub soft_delete_field: String,
    /// Conflict marker column added to staging.
    pub conflicts_field: String,
    /// Entities this one depends on.
    pub requires: Vec<String>,
    /// Source filters.
    pub conditions: Vec<SourceCondition>,
    /// Raw join clauses used when reading the source.
    pub joins: Vec<String>,
}

impl EntityPolicy {
    /// Creates a policy with default settings and no mapping.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source_name: name.clone(),
            name,
            identifier: "id".to_string(),
            mapping: Vec::new(),
            on_delete: DeleteAction::Ignore,
            on_delete_set: OverrideSet::new(),
            on_update: UpdateAction::Ignore,
            on_update_set: OverrideSet::new(),
            on_insert: InsertAction::Update,
            on_insert_set: OverrideSet::new(),
            on_conflict: ConflictAction::Ignore,
            on_conflict_set: OverrideSet::new(),
            unique: Vec::new(),
            date_check_field: "date_updated".to_string(),
            soft_deletable: false,
            soft_delete_field: "active".to_string(),
            conflicts_field: "conflicts".to_string(),
            requires: Vec::new(),
            conditions: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Sets the source table name.
    pub fn with_source_name(mut self, source: impl Into<String>) -> Self {
        self.source_name = source.into();
        self
    }

    /// Sets the identifier field.
    pub fn with_identifier(mut self, field: impl Into<String>) -> Self {
        self.identifier = field.into();
        self
    }

    /// Maps fields that keep their name.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            self = self.map_field(field.clone(), field);
        }
        self
    }

    /// Maps a source field onto a target field.
    pub fn map_field(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.mapping.push(FieldMapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Sets the delete action and its override set.
    pub fn with_on_delete(mut self, action: DeleteAction, set: OverrideSet) -> Self {
        self.on_delete = action;
        self.on_delete_set = set;
        self
    }

    /// Sets the update action and its override set.
    pub fn with_on_update(mut self, action: UpdateAction, set: OverrideSet) -> Self {
        self.on_update = action;
        self.on_update_set = set;
        self
    }

    /// Sets the insert action and its override set.
    pub fn with_on_insert(mut self, action: InsertAction, set: OverrideSet) -> Self {
        self.on_insert = action;
        self.on_insert_set = set;
        self
    }

    /// Sets the conflict action and its override set.
    pub fn with_on_conflict(mut self, action: ConflictAction, set: OverrideSet) -> Self {
        self.on_conflict = action;
        self.on_conflict_set = set;
        self
    }

    /// Adds an alternate uniqueness set.
    pub fn with_unique<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique.push(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the modification timestamp field.
    pub fn with_date_check_field(mut self, field: impl Into<String>) -> Self {
        self.date_check_field = field.into();
        self
    }

    /// Enables soft deletion through `field`.
    pub fn with_soft_delete(mut self, field: impl Into<String>) -> Self {
        self.soft_deletable = true;
        self.soft_delete_field = field.into();
        self
    }

    /// Sets the conflict marker column.
    pub fn with_conflicts_field(mut self, field: impl Into<String>) -> Self {
        self.conflicts_field = field.into();
        self
    }

    /// Adds a dependency.
    pub fn requires(mut self, entity: impl Into<String>) -> Self {
        self.requires.push(entity.into());
        self
    }

    /// Adds a source filter.
    pub fn with_condition(mut self, condition: SourceCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Adds a raw source join.
    pub fn with_join(mut self, join: impl Into<String>) -> Self {
        self.joins.push(join.into());
        self
    }

    /// The rule pairing staged rows with target rows.
    pub fn match_rule(&self) -> MatchRule {
        MatchRule {
            identifier: self.identifier.clone(),
            alternates: self.unique.clone(),
        }
    }

    /// Target field names in mapping order.
    pub fn target_fields(&self) -> impl Iterator<Item = &str> {
        self.mapping.iter().map(|m| m.target.as_str())
    }

    /// Returns true if `field` is a mapped target field.
    pub fn maps_target(&self, field: &str) -> bool {
        self.mapping.iter().any(|m| m.target == field)
    }

    /// Source field feeding the given target field.
    pub fn source_field_for(&self, target: &str) -> Option<&str> {
        self.mapping
            .iter()
            .find(|m| m.target == target)
            .map(|m| m.source.as_str())
    }
}
