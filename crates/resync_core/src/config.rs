//! Run options and entity configuration.
//!
//! Configuration files are JSON documents of the form
//!
//! ```json
//! {
//!   "name": "crm",
//!   "options": { "incremental": false },
//!   "entities": {
//!     "users": {
//!       "mapping": { "id": null, "mail": "email", "date_updated": null },
//!       "onUpdate": "update",
//!       "onUpdateSet": { "email": null }
//!     }
//!   }
//! }
//! ```
//!
//! [`EntityConfig::resolve`] applies defaults and checks the declaration,
//! producing the [`EntityPolicy`] consumed by the engine.

use crate::error::{SyncError, SyncResult};
use crate::policy::{
    ConflictAction, DeleteAction, EntityPolicy, FieldMapping, InsertAction, OverrideSet,
    PolicyAction, SourceCondition, UpdateAction,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Options of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Only stage source rows changed since the last checkpoint.
    pub incremental: bool,
    /// Record a checkpoint after each successful entity.
    #[serde(alias = "saveSyncDate")]
    pub save_checkpoints: bool,
    /// Entities to run (plus their dependencies). Empty means all.
    #[serde(alias = "includeEntities")]
    pub include: Vec<String>,
    /// Entities to skip (plus their dependents).
    #[serde(alias = "excludeEntities")]
    pub exclude: Vec<String>,
    /// Also run every dependent of the included entities.
    pub add_relations: bool,
    /// Keep staging tables after each entity.
    #[serde(alias = "keepTemporaryTables")]
    pub keep_staging: bool,
    /// Report stage outcomes even when no rows were affected.
    pub debug: bool,
}

impl SyncOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self {
            incremental: true,
            save_checkpoints: true,
            include: Vec::new(),
            exclude: Vec::new(),
            add_relations: false,
            keep_staging: false,
            debug: false,
        }
    }

    /// Sets incremental mode.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Enables or disables checkpoint recording.
    pub fn with_save_checkpoints(mut self, save: bool) -> Self {
        self.save_checkpoints = save;
        self
    }

    /// Restricts the run to the given entities and their dependencies.
    pub fn with_include<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = entities.into_iter().map(Into::into).collect();
        self
    }

    /// Removes the given entities and their dependents from the run.
    pub fn with_exclude<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = entities.into_iter().map(Into::into).collect();
        self
    }

    /// Also runs dependents of included entities.
    pub fn with_add_relations(mut self, add: bool) -> Self {
        self.add_relations = add;
        self
    }

    /// Keeps staging tables after each entity.
    pub fn with_keep_staging(mut self, keep: bool) -> Self {
        self.keep_staging = keep;
        self
    }

    /// Enables debug reporting.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A value that may be written as a single item or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// Single item.
    One(T),
    /// List of items.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Flattens into a list.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// Raw declaration of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EntityConfig {
    /// Source table, defaults to the entity name.
    pub source_name: Option<String>,
    /// Identifier field, defaults to `id`.
    pub identifier: Option<String>,
    /// Source field to target field; `null` keeps the name.
    pub mapping: BTreeMap<String, Option<String>>,
    /// `ignore`, `update` or `delete`.
    pub on_delete: Option<String>,
    /// Overrides for deletes.
    pub on_delete_set: OverrideSet,
    /// `ignore` or `update`.
    pub on_update: Option<String>,
    /// Overrides for updates.
    pub on_update_set: OverrideSet,
    /// `ignore` or `update`.
    pub on_insert: Option<String>,
    /// Overrides for inserts.
    pub on_insert_set: OverrideSet,
    /// `ignore`, `update`, `delete` or `abort`.
    pub on_conflict: Option<String>,
    /// Overrides for conflicts.
    pub on_conflict_set: OverrideSet,
    /// Alternate uniqueness sets.
    pub unique: Vec<OneOrMany<String>>,
    /// Modification timestamp field.
    pub date_check_field: Option<String>,
    /// Flag rows inactive instead of deleting them.
    pub soft_deletable: bool,
    /// Activity flag field.
    pub soft_delete_field: Option<String>,
    /// Conflict marker column.
    pub conflicts_field: Option<String>,
    /// Entities this one depends on.
    #[serde(alias = "requires")]
    pub required: OneOrMany<String>,
    /// Source filters.
    pub conditions: Vec<SourceCondition>,
    /// Raw source joins.
    pub joins: Vec<String>,
}

impl EntityConfig {
    /// Applies defaults and validates the declaration.
    pub fn resolve(self, name: &str) -> SyncResult<EntityPolicy> {
        if name.trim().is_empty() {
            return Err(SyncError::UnknownEntity);
        }
        let defaults = EntityPolicy::new(name);

        let on_delete = narrow(name, "onDelete", self.on_delete, defaults.on_delete)?;
        let on_update = narrow(name, "onUpdate", self.on_update, defaults.on_update)?;
        let on_insert = narrow(name, "onInsert", self.on_insert, defaults.on_insert)?;
        let on_conflict = narrow(name, "onConflict", self.on_conflict, defaults.on_conflict)?;

        let mut policy = EntityPolicy {
            source_name: self.source_name.unwrap_or(defaults.source_name),
            identifier: self.identifier.unwrap_or(defaults.identifier),
            mapping: self
                .mapping
                .into_iter()
                .map(|(source, target)| FieldMapping {
                    target: target.unwrap_or_else(|| source.clone()),
                    source,
                })
                .collect(),
            on_delete,
            on_delete_set: self.on_delete_set,
            on_update,
            // Update and insert sets only mean something when the action runs.
            on_update_set: if on_update == UpdateAction::Update {
                self.on_update_set
            } else {
                OverrideSet::new()
            },
            on_insert,
            on_insert_set: if on_insert == InsertAction::Update {
                self.on_insert_set
            } else {
                OverrideSet::new()
            },
            on_conflict,
            on_conflict_set: self.on_conflict_set,
            unique: self
                .unique
                .into_iter()
                .map(OneOrMany::into_vec)
                .filter(|set| !set.is_empty())
                .collect(),
            date_check_field: self.date_check_field.unwrap_or(defaults.date_check_field),
            soft_deletable: self.soft_deletable,
            soft_delete_field: self.soft_delete_field.unwrap_or(defaults.soft_delete_field),
            conflicts_field: self.conflicts_field.unwrap_or(defaults.conflicts_field),
            requires: self.required.into_vec(),
            conditions: self.conditions,
            joins: self.joins,
            name: defaults.name,
        };
        let mut seen = HashSet::new();
        policy.requires.retain(|r| seen.insert(r.clone()));
        validate(&policy)?;
        Ok(policy)
    }
}

fn narrow<A: PolicyAction>(
    entity: &str,
    slot: &str,
    value: Option<String>,
    default: A,
) -> SyncResult<A> {
    match value {
        Some(value) => A::narrow(entity, slot, &value),
        None => Ok(default),
    }
}

/// Checks a resolved policy for internal consistency.
pub fn validate(policy: &EntityPolicy) -> SyncResult<()> {
    let entity = &policy.name;
    if policy.mapping.is_empty() {
        return Err(SyncError::configuration(format!(
            "entity '{entity}' has an empty mapping"
        )));
    }
    if policy.identifier.is_empty() {
        return Err(SyncError::configuration(format!(
            "entity '{entity}' has an empty identifier"
        )));
    }

    let mut required = vec![
        ("identifier", policy.identifier.as_str()),
        ("dateCheckField", policy.date_check_field.as_str()),
    ];
    if policy.soft_deletable {
        required.push(("softDeleteField", policy.soft_delete_field.as_str()));
    }
    for (slot, field) in required {
        if !policy.maps_target(field) {
            return Err(SyncError::configuration(format!(
                "{slot} '{field}' of entity '{entity}' is not a mapped field"
            )));
        }
    }

    if policy.maps_target(&policy.conflicts_field) {
        return Err(SyncError::configuration(format!(
            "conflicts field '{}' of entity '{entity}' collides with a mapped field",
            policy.conflicts_field
        )));
    }

    for set in &policy.unique {
        if let Some(field) = set.iter().find(|f| !policy.maps_target(f)) {
            return Err(SyncError::configuration(format!(
                "unique field '{field}' of entity '{entity}' is not a mapped field"
            )));
        }
    }

    let mut seen = HashSet::new();
    if let Some(dup) = policy.target_fields().find(|f| !seen.insert(*f)) {
        return Err(SyncError::configuration(format!(
            "entity '{entity}' maps two fields onto '{dup}'"
        )));
    }
    Ok(())
}

/// A complete configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Name of this synchronisation; prefixes checkpoint records.
    #[serde(default = "default_name")]
    pub name: String,
    /// Run options.
    #[serde(default)]
    pub options: SyncOptions,
    /// Entity declarations keyed by entity name.
    pub entities: BTreeMap<String, EntityConfig>,
}

fn default_name() -> String {
    "resync".to_string()
}

impl SyncConfig {
    /// Parses a configuration from JSON text.
    pub fn from_json_str(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Resolves every entity declaration.
    pub fn policies(&self) -> SyncResult<Vec<EntityPolicy>> {
        self.entities
            .iter()
            .map(|(name, config)| config.clone().resolve(name))
            .collect()
    }
}
