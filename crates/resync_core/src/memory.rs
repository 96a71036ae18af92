//! In-memory backend.
//!
//! [`MemoryStore`] implements staging, the target store and checkpoints over
//! plain row vectors. It evaluates operations directly, which makes it the
//! reference for what each operation means. Raw expression fragments and raw
//! source filters cannot be evaluated here and are reported as unsupported.

use crate::error::{SyncError, SyncResult};
use crate::expr::{Assignment, Expr};
use crate::operation::{Operand, Operation, Predicate, Scope};
use crate::policy::{EntityPolicy, MatchRule, SourceCondition};
use crate::store::{CheckpointStore, StagedSnapshot, Staging, TargetStore};
use crate::value::{Row, Value, TIMESTAMP_FORMAT};
use chrono::{NaiveDateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// Builds a row from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A target table with its constraints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    /// Rows in insertion order.
    pub rows: Vec<Row>,
    primary_key: Option<String>,
    unique: Vec<Vec<String>>,
}

impl MemoryTable {
    /// Creates an empty table without constraints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the primary key column.
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    /// Declares a unique column set.
    pub fn with_unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique.push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Adds rows.
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = Row>) -> Self {
        self.rows.extend(rows);
        self
    }

    fn constraints(&self) -> Vec<Vec<String>> {
        self.primary_key
            .iter()
            .map(|k| vec![k.clone()])
            .chain(self.unique.iter().cloned())
            .collect()
    }

    fn violates_constraint(&self, candidate: &Row) -> bool {
        self.constraints().iter().any(|columns| {
            self.rows.iter().any(|existing| {
                columns.iter().all(|c| {
                    let a = existing.get(c).unwrap_or(&Value::Null);
                    let b = candidate.get(c).unwrap_or(&Value::Null);
                    a.sql_cmp(b) == Some(Ordering::Equal)
                })
            })
        })
    }
}

/// `table.column` references `parent.parent_column`; deletes cascade while
/// enforcement is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing table.
    pub table: String,
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub parent: String,
    /// Referenced column.
    pub parent_column: String,
}

/// In-memory staging, target and checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sources: BTreeMap<String, Vec<Row>>,
    targets: BTreeMap<String, MemoryTable>,
    staging: BTreeMap<String, Vec<Row>>,
    foreign_keys: Vec<ForeignKey>,
    fk_enabled: bool,
    fk_history: Vec<bool>,
    checkpoints: BTreeMap<String, NaiveDateTime>,
    failing: HashSet<String>,
    now: Option<String>,
}

impl MemoryStore {
    /// Creates an empty store with foreign-key enforcement on.
    pub fn new() -> Self {
        Self {
            fk_enabled: true,
            ..Self::default()
        }
    }

    /// Adds (or replaces) a source table.
    pub fn with_source(mut self, table: impl Into<String>, rows: Vec<Row>) -> Self {
        self.sources.insert(table.into(), rows);
        self
    }

    /// Adds (or replaces) a target table.
    pub fn with_target(mut self, table: impl Into<String>, target: MemoryTable) -> Self {
        self.targets.insert(table.into(), target);
        self
    }

    /// Declares a foreign key.
    pub fn with_foreign_key(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        parent: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            table: table.into(),
            column: column.into(),
            parent: parent.into(),
            parent_column: parent_column.into(),
        });
        self
    }

    /// Fixes the value `NOW()` evaluates to.
    pub fn with_now(mut self, now: impl Into<String>) -> Self {
        self.now = Some(now.into());
        self
    }

    /// Makes staging of `entity` fail.
    pub fn fail_staging(&mut self, entity: impl Into<String>) {
        self.failing.insert(entity.into());
    }

    /// Replaces the rows of a source table.
    pub fn set_source(&mut self, table: impl Into<String>, rows: Vec<Row>) {
        self.sources.insert(table.into(), rows);
    }

    /// Source rows of `table`.
    pub fn source_rows_mut(&mut self, table: &str) -> Option<&mut Vec<Row>> {
        self.sources.get_mut(table)
    }

    /// Target rows of `table`.
    pub fn target_rows(&self, table: &str) -> &[Row] {
        self.targets
            .get(table)
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }

    /// Mutable target rows of `table`.
    pub fn target_rows_mut(&mut self, table: &str) -> Option<&mut Vec<Row>> {
        self.targets.get_mut(table).map(|t| &mut t.rows)
    }

    /// Target row of `table` whose `column` equals `value`.
    pub fn find_target(&self, table: &str, column: &str, value: impl Into<Value>) -> Option<&Row> {
        let value = value.into();
        self.target_rows(table).iter().find(|r| {
            r.get(column)
                .is_some_and(|v| v.sql_cmp(&value) == Some(Ordering::Equal))
        })
    }

    /// Staged rows still held for `table`.
    pub fn staged_rows(&self, table: &str) -> Option<&[Row]> {
        self.staging.get(table).map(Vec::as_slice)
    }

    /// Every foreign-key state change, in order.
    pub fn fk_history(&self) -> &[bool] {
        &self.fk_history
    }

    /// Current foreign-key enforcement.
    pub fn fk_enabled(&self) -> bool {
        self.fk_enabled
    }

    /// Stored checkpoint of `entity`.
    pub fn checkpoint(&self, entity: &str) -> Option<NaiveDateTime> {
        self.checkpoints.get(entity).copied()
    }

    /// Sets the checkpoint of `entity`.
    pub fn set_checkpoint(&mut self, entity: impl Into<String>, at: NaiveDateTime) {
        self.checkpoints.insert(entity.into(), at);
    }

    fn now_value(&self) -> Value {
        match &self.now {
            Some(now) => Value::Text(now.clone()),
            None => Value::Text(Utc::now().naive_utc().format(TIMESTAMP_FORMAT).to_string()),
        }
    }

    fn eval(&self, expr: &Expr, staged: Option<&Row>) -> SyncResult<Value> {
        Ok(match expr {
            Expr::Staged(field) => staged
                .and_then(|s| s.get(field))
                .cloned()
                .unwrap_or(Value::Null),
            Expr::Now => self.now_value(),
            Expr::Null => Value::Null,
            Expr::Literal(value) => value.clone(),
            Expr::Raw(text) => match text.trim().parse::<i64>() {
                Ok(i) => Value::Integer(i),
                Err(_) => match text.trim().parse::<f64>() {
                    Ok(f) => Value::Real(f),
                    Err(_) => {
                        return Err(SyncError::Unsupported(format!(
                            "raw fragment '{text}' in memory store"
                        )))
                    }
                },
            },
            Expr::IfNull { value, fallback } => match self.eval(value, staged)? {
                Value::Null => self.eval(fallback, staged)?,
                v => v,
            },
            Expr::If { condition, .. } => {
                return Err(SyncError::Unsupported(format!(
                    "raw condition '{condition}' in memory store"
                )))
            }
        })
    }

    fn evaluate_all(&self, assignments: &[Assignment], staged: Option<&Row>) -> SyncResult<Row> {
        assignments
            .iter()
            .map(|a| Ok((a.field.clone(), self.eval(&a.value, staged)?)))
            .collect()
    }

    /// Pairs every target row in scope with its staged row, keeping pairs
    /// that pass the filter. Returns `(target index, staged index)`.
    fn select(
        target: &[Row],
        staged: &[Row],
        scope: &Scope,
        filter: &Predicate,
    ) -> Vec<(usize, Option<usize>)> {
        let mut selected = Vec::new();
        for (ti, t) in target.iter().enumerate() {
            match scope {
                Scope::Matched(rule) => {
                    let hit = staged.iter().position(|s| {
                        rule.same_entity(s, t) && passes(filter, Some(t), Some(s))
                    });
                    if let Some(si) = hit {
                        selected.push((ti, Some(si)));
                    }
                }
                Scope::Outer { identifier } => {
                    let rule = MatchRule::identifier(identifier.clone());
                    let si = staged.iter().position(|s| rule.same_entity(s, t));
                    if passes(filter, Some(t), si.map(|i| &staged[i])) {
                        selected.push((ti, si));
                    }
                }
            }
        }
        selected
    }

    fn matched_staged(
        target: &[Row],
        staged: &[Row],
        rule: &MatchRule,
        filter: &Predicate,
    ) -> Vec<usize> {
        staged
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                target
                    .iter()
                    .any(|t| rule.same_entity(s, t) && passes(filter, Some(t), Some(s)))
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn delete_rows(&mut self, table: &str, indices: &[usize]) -> usize {
        let Some(target) = self.targets.get_mut(table) else {
            return 0;
        };
        let drop: HashSet<usize> = indices.iter().copied().collect();
        let mut removed = Vec::new();
        let mut index = 0;
        target.rows.retain(|r| {
            let keep = !drop.contains(&index);
            if !keep {
                removed.push(r.clone());
            }
            index += 1;
            keep
        });
        if self.fk_enabled {
            self.cascade(table, &removed);
        }
        removed.len()
    }

    fn cascade(&mut self, parent: &str, removed: &[Row]) {
        let children: Vec<ForeignKey> = self
            .foreign_keys
            .iter()
            .filter(|fk| fk.parent == parent)
            .cloned()
            .collect();
        for fk in children {
            let keys: Vec<&Value> = removed
                .iter()
                .filter_map(|r| r.get(&fk.parent_column))
                .collect();
            let doomed: Vec<usize> = self
                .target_rows(&fk.table)
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.get(&fk.column).is_some_and(|v| {
                        keys.iter().any(|k| v.sql_cmp(k) == Some(Ordering::Equal))
                    })
                })
                .map(|(i, _)| i)
                .collect();
            if !doomed.is_empty() {
                tracing::debug!(table = %fk.table, rows = doomed.len(), "cascading delete");
                self.delete_rows(&fk.table, &doomed);
            }
        }
    }
}

fn resolve_operand<'r>(
    operand: &'r Operand,
    target: Option<&'r Row>,
    staged: Option<&'r Row>,
) -> &'r Value {
    const NULL: &Value = &Value::Null;
    match operand {
        Operand::Target(field) => target.and_then(|t| t.get(field)).unwrap_or(NULL),
        Operand::Staged(field) => staged.and_then(|s| s.get(field)).unwrap_or(NULL),
        Operand::Value(value) => value,
    }
}

fn passes(predicate: &Predicate, target: Option<&Row>, staged: Option<&Row>) -> bool {
    match predicate {
        Predicate::Compare { left, op, right } => resolve_operand(left, target, staged)
            .sql_cmp(resolve_operand(right, target, staged))
            .is_some_and(|ordering| op.holds(ordering)),
        Predicate::StagedMissing => staged.is_none(),
        Predicate::StagedPresent => staged.is_some(),
        Predicate::All(parts) => parts.iter().all(|p| passes(p, target, staged)),
        Predicate::Any(parts) => parts.iter().any(|p| passes(p, target, staged)),
    }
}

fn condition_holds(condition: &SourceCondition, row: &Row) -> SyncResult<bool> {
    match condition {
        SourceCondition::Raw(text) => Err(SyncError::Unsupported(format!(
            "raw source condition '{text}' in memory store"
        ))),
        SourceCondition::Equals(fields) => {
            for (field, expected) in fields {
                let candidates = match expected {
                    serde_json::Value::Array(items) => items.as_slice(),
                    scalar => std::slice::from_ref(scalar),
                };
                let actual = row.get(field).unwrap_or(&Value::Null);
                let mut any = false;
                for candidate in candidates {
                    let candidate = Value::from_json(candidate).ok_or_else(|| {
                        SyncError::configuration(format!("condition on '{field}' is not a scalar"))
                    })?;
                    any |= actual.sql_cmp(&candidate) == Some(Ordering::Equal);
                }
                if !any {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

impl Staging for MemoryStore {
    fn stage(
        &mut self,
        policy: &EntityPolicy,
        since: Option<NaiveDateTime>,
    ) -> SyncResult<StagedSnapshot> {
        if self.failing.contains(&policy.name) {
            return Err(SyncError::store(format!(
                "staging of '{}' failed",
                policy.name
            )));
        }
        if !policy.joins.is_empty() {
            return Err(SyncError::Unsupported(
                "source joins in memory store".to_string(),
            ));
        }
        let source = self.sources.get(&policy.source_name).ok_or_else(|| {
            SyncError::store(format!("no source table '{}'", policy.source_name))
        })?;

        let date_source = policy.source_field_for(&policy.date_check_field);
        let since = since.map(Value::timestamp);
        let mut staged = Vec::new();
        for row in source {
            if let (Some(since), Some(field)) = (&since, date_source) {
                let changed = row.get(field).unwrap_or(&Value::Null);
                if changed.sql_cmp(since) != Some(Ordering::Greater) {
                    continue;
                }
            }
            let mut keep = true;
            for condition in &policy.conditions {
                if !condition_holds(condition, row)? {
                    keep = false;
                    break;
                }
            }
            if !keep {
                continue;
            }

            let mut projected: Row = policy
                .mapping
                .iter()
                .map(|m| {
                    let value = row.get(&m.source).cloned().unwrap_or(Value::Null);
                    (m.target.clone(), value)
                })
                .collect();
            projected.insert(policy.conflicts_field.clone(), Value::from(false));
            staged.push(projected);
        }

        let table = format!("_tmp_{}", policy.name);
        let rows = staged.len();
        self.staging.insert(table.clone(), staged);
        Ok(StagedSnapshot {
            entity: policy.name.clone(),
            table,
            rows,
        })
    }

    fn release(&mut self, snapshot: &StagedSnapshot) -> SyncResult<()> {
        self.staging.remove(&snapshot.table);
        Ok(())
    }
}

impl TargetStore for MemoryStore {
    fn execute(
        &mut self,
        policy: &EntityPolicy,
        snapshot: &StagedSnapshot,
        operation: &Operation,
    ) -> SyncResult<usize> {
        let staged = self
            .staging
            .get(&snapshot.table)
            .cloned()
            .ok_or_else(|| SyncError::store(format!("no staging table '{}'", snapshot.table)))?;
        let target = self
            .targets
            .get(&policy.name)
            .map(|t| t.rows.clone())
            .ok_or_else(|| SyncError::store(format!("no target table '{}'", policy.name)))?;

        match operation {
            Operation::Count { rule, filter } => {
                Ok(Self::matched_staged(&target, &staged, rule, filter).len())
            }
            Operation::MarkConflicts {
                rule,
                filter,
                marker,
            } => {
                let hits = Self::matched_staged(&target, &staged, rule, filter);
                if let Some(rows) = self.staging.get_mut(&snapshot.table) {
                    for &i in &hits {
                        rows[i].insert(marker.clone(), Value::from(true));
                    }
                }
                Ok(hits.len())
            }
            Operation::Update {
                scope,
                filter,
                assignments,
            } => {
                let selected = Self::select(&target, &staged, scope, filter);
                let mut changes = Vec::with_capacity(selected.len());
                for &(ti, si) in &selected {
                    changes.push((ti, self.evaluate_all(assignments, si.map(|i| &staged[i]))?));
                }
                if let Some(rows) = self.target_rows_mut(&policy.name) {
                    for (ti, values) in changes {
                        rows[ti].extend(values);
                    }
                }
                Ok(selected.len())
            }
            Operation::Delete { scope, filter } => {
                let indices: Vec<usize> = Self::select(&target, &staged, scope, filter)
                    .into_iter()
                    .map(|(ti, _)| ti)
                    .collect();
                Ok(self.delete_rows(&policy.name, &indices))
            }
            Operation::Insert {
                rule,
                filter,
                assignments,
            } => {
                let mut inserted = 0;
                for s in &staged {
                    if !passes(filter, None, Some(s))
                        || target.iter().any(|t| rule.same_entity(s, t))
                    {
                        continue;
                    }
                    let candidate = self.evaluate_all(assignments, Some(s))?;
                    let Some(table) = self.targets.get_mut(&policy.name) else {
                        break;
                    };
                    if table.violates_constraint(&candidate) {
                        tracing::debug!(entity = %policy.name, "insert skipped on unique collision");
                        continue;
                    }
                    table.rows.push(candidate);
                    inserted += 1;
                }
                Ok(inserted)
            }
        }
    }

    fn foreign_keys_enabled(&mut self) -> SyncResult<bool> {
        Ok(self.fk_enabled)
    }

    fn set_foreign_keys(&mut self, enabled: bool) -> SyncResult<()> {
        self.fk_enabled = enabled;
        self.fk_history.push(enabled);
        Ok(())
    }
}

impl CheckpointStore for MemoryStore {
    fn load_checkpoint(&mut self, entity: &str) -> SyncResult<Option<NaiveDateTime>> {
        Ok(self.checkpoints.get(entity).copied())
    }

    fn save_checkpoint(&mut self, entity: &str, at: NaiveDateTime) -> SyncResult<()> {
        self.checkpoints.insert(entity.to_string(), at);
        Ok(())
    }
}
