//! Rendering of reconciliation operations into SQLite statements.

use crate::error::{SqliteError, SqliteResult};
use chrono::NaiveDateTime;
use resync_core::{
    Assignment, EntityPolicy, Expr, MatchRule, Operand, Operation, Predicate, Scope,
    SourceCondition, Value, STAGED_ALIAS,
};

/// Alias of the target table.
pub(crate) const TARGET_ALIAS: &str = "_t";

/// Alias of the target row id carried through outer-scope subqueries.
const ROW_ID: &str = "_rid";

/// Quotes an identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a possibly schema-qualified table name.
pub(crate) fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn target_column(field: &str) -> String {
    format!("{TARGET_ALIAS}.{}", quote_ident(field))
}

fn staged_column(field: &str) -> String {
    format!("{STAGED_ALIAS}.{}", quote_ident(field))
}

/// Renders an override expression.
pub(crate) fn expression(expr: &Expr) -> String {
    match expr {
        Expr::Staged(field) => staged_column(field),
        Expr::Now => "CURRENT_TIMESTAMP".to_string(),
        Expr::Null => "NULL".to_string(),
        Expr::Literal(value) => value.to_string(),
        Expr::Raw(text) => text.clone(),
        Expr::IfNull { value, fallback } => {
            format!("IFNULL({}, {})", expression(value), expression(fallback))
        }
        Expr::If {
            condition,
            then,
            otherwise,
        } => format!(
            "CASE WHEN {condition} THEN {} ELSE {} END",
            expression(then),
            expression(otherwise)
        ),
    }
}

fn operand(operand: &Operand) -> String {
    match operand {
        Operand::Target(field) => target_column(field),
        Operand::Staged(field) => staged_column(field),
        Operand::Value(value) => value.to_string(),
    }
}

/// Renders a predicate. `identifier` is the staged column that is NULL when
/// an outer-joined staged row is missing.
pub(crate) fn predicate(predicate: &Predicate, identifier: &str) -> String {
    match predicate {
        Predicate::Compare { left, op, right } => {
            format!("{} {} {}", operand(left), op.as_sql(), operand(right))
        }
        Predicate::StagedMissing => format!("{} IS NULL", staged_column(identifier)),
        Predicate::StagedPresent => format!("{} IS NOT NULL", staged_column(identifier)),
        Predicate::All(parts) => join(parts, " AND ", "1", identifier),
        Predicate::Any(parts) => join(parts, " OR ", "0", identifier),
    }
}

fn join(parts: &[Predicate], separator: &str, empty: &str, identifier: &str) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<_> = parts.iter().map(|p| predicate(p, identifier)).collect();
    format!("({})", rendered.join(separator))
}

fn fields_equal(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| format!("{} = {}", target_column(f), staged_column(f)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Renders the ON condition pairing staged and target rows.
pub(crate) fn match_condition(rule: &MatchRule) -> String {
    let mut alternatives = vec![fields_equal(std::slice::from_ref(&rule.identifier))];
    alternatives.extend(
        rule.alternates
            .iter()
            .filter(|set| !set.is_empty())
            .map(|set| format!("({})", fields_equal(set))),
    );
    format!("({})", alternatives.join(" OR "))
}

fn assignments(list: &[Assignment]) -> SqliteResult<String> {
    if list.is_empty() {
        return Err(SqliteError::Render("no assignments".to_string()));
    }
    Ok(list
        .iter()
        .map(|a| format!("{} = {}", quote_ident(&a.field), expression(&a.value)))
        .collect::<Vec<_>>()
        .join(", "))
}

/// Statements against one entity's target and staging tables.
pub(crate) struct Statements {
    target: String,
    staged: String,
    identifier: String,
}

impl Statements {
    pub(crate) fn new(policy: &EntityPolicy, staging_table: &str) -> Self {
        Self {
            target: quote_table(&policy.name),
            staged: quote_ident(staging_table),
            identifier: policy.identifier.clone(),
        }
    }

    /// `SELECT COUNT(*)` for counts, a data-modifying statement otherwise.
    pub(crate) fn render(&self, operation: &Operation) -> SqliteResult<String> {
        let (target, staged) = (&self.target, &self.staged);
        Ok(match operation {
            Operation::Count { rule, filter } => format!(
                "SELECT COUNT(*) FROM {staged} AS {STAGED_ALIAS} WHERE {}",
                self.matched_target_exists(rule, filter)
            ),
            Operation::MarkConflicts {
                rule,
                filter,
                marker,
            } => format!(
                "UPDATE {staged} AS {STAGED_ALIAS} SET {} = 1 WHERE {}",
                quote_ident(marker),
                self.matched_target_exists(rule, filter)
            ),
            Operation::Update {
                scope: Scope::Matched(rule),
                filter,
                assignments: list,
            } => format!(
                "UPDATE {target} AS {TARGET_ALIAS} SET {} FROM {staged} AS {STAGED_ALIAS} \
                 WHERE {} AND {}",
                assignments(list)?,
                match_condition(rule),
                predicate(filter, &self.identifier)
            ),
            Operation::Update {
                scope: Scope::Outer { identifier },
                filter,
                assignments: list,
            } => format!(
                "UPDATE {target} AS {TARGET_ALIAS} SET {} FROM (SELECT _x.rowid AS {ROW_ID}, \
                 {STAGED_ALIAS}.* FROM {target} AS _x LEFT JOIN {staged} AS {STAGED_ALIAS} \
                 ON _x.{id} = {STAGED_ALIAS}.{id}) AS {STAGED_ALIAS} \
                 WHERE {TARGET_ALIAS}.rowid = {STAGED_ALIAS}.{ROW_ID} AND {}",
                assignments(list)?,
                predicate(filter, identifier),
                id = quote_ident(identifier),
            ),
            Operation::Delete {
                scope: Scope::Matched(rule),
                filter,
            } => format!(
                "DELETE FROM {target} AS {TARGET_ALIAS} WHERE EXISTS (SELECT 1 FROM {staged} \
                 AS {STAGED_ALIAS} WHERE {} AND {})",
                match_condition(rule),
                predicate(filter, &self.identifier)
            ),
            Operation::Delete {
                scope: Scope::Outer { identifier },
                filter,
            } => format!(
                "DELETE FROM {target} WHERE rowid IN (SELECT {TARGET_ALIAS}.rowid FROM {target} \
                 AS {TARGET_ALIAS} LEFT JOIN {staged} AS {STAGED_ALIAS} \
                 ON {TARGET_ALIAS}.{id} = {STAGED_ALIAS}.{id} WHERE {})",
                predicate(filter, identifier),
                id = quote_ident(identifier),
            ),
            Operation::Insert {
                rule,
                filter,
                assignments: list,
            } => {
                if list.is_empty() {
                    return Err(SqliteError::Render("no columns to insert".to_string()));
                }
                let columns: Vec<_> = list.iter().map(|a| quote_ident(&a.field)).collect();
                let values: Vec<_> = list.iter().map(|a| expression(&a.value)).collect();
                format!(
                    "INSERT OR IGNORE INTO {target} ({}) SELECT {} FROM {staged} AS {STAGED_ALIAS} \
                     WHERE {} AND NOT EXISTS (SELECT 1 FROM {target} AS {TARGET_ALIAS} WHERE {})",
                    columns.join(", "),
                    values.join(", "),
                    predicate(filter, &self.identifier),
                    match_condition(rule)
                )
            }
        })
    }

    fn matched_target_exists(&self, rule: &MatchRule, filter: &Predicate) -> String {
        format!(
            "EXISTS (SELECT 1 FROM {} AS {TARGET_ALIAS} WHERE {} AND {})",
            self.target,
            match_condition(rule),
            predicate(filter, &self.identifier)
        )
    }
}

/// Column declaration of a staging table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnDef {
    pub(crate) name: String,
    pub(crate) declared_type: String,
}

/// `CREATE [TEMP] TABLE` for a staging table.
pub(crate) fn create_staging(
    table: &str,
    columns: &[ColumnDef],
    conflicts_field: &str,
    persistent: bool,
) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| {
            if c.declared_type.is_empty() {
                quote_ident(&c.name)
            } else {
                format!("{} {}", quote_ident(&c.name), c.declared_type)
            }
        })
        .collect();
    defs.push(format!(
        "{} INTEGER NOT NULL DEFAULT 0",
        quote_ident(conflicts_field)
    ));
    format!(
        "CREATE {}TABLE {} ({})",
        if persistent { "" } else { "TEMP " },
        quote_ident(table),
        defs.join(", ")
    )
}

/// Source columns are addressed through the source alias unless already
/// qualified, e.g. by a joined table.
fn source_column(field: &str) -> String {
    if field.contains('.') {
        field.to_string()
    } else {
        staged_column(field)
    }
}

fn condition(condition: &SourceCondition, out: &mut Vec<String>) -> SqliteResult<()> {
    match condition {
        SourceCondition::Raw(text) => out.push(format!("({text})")),
        SourceCondition::Equals(fields) => {
            for (field, expected) in fields {
                let column = source_column(field);
                let scalar = |v: &serde_json::Value| {
                    Value::from_json(v).ok_or_else(|| {
                        SqliteError::Render(format!("condition on '{field}' is not a scalar"))
                    })
                };
                match expected {
                    serde_json::Value::Null => out.push(format!("{column} IS NULL")),
                    serde_json::Value::Array(items) => {
                        let values = items
                            .iter()
                            .map(|v| scalar(v).map(|v| v.to_string()))
                            .collect::<SqliteResult<Vec<_>>>()?;
                        out.push(format!("{column} IN ({})", values.join(", ")));
                    }
                    other => out.push(format!("{column} = {}", scalar(other)?)),
                }
            }
        }
    }
    Ok(())
}

/// `INSERT INTO … SELECT` copying source rows into staging.
pub(crate) fn fill_staging(
    policy: &EntityPolicy,
    table: &str,
    since: Option<NaiveDateTime>,
) -> SqliteResult<String> {
    let targets: Vec<_> = policy.mapping.iter().map(|m| quote_ident(&m.target)).collect();
    let sources: Vec<_> = policy
        .mapping
        .iter()
        .map(|m| source_column(&m.source))
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} AS {STAGED_ALIAS}",
        quote_ident(table),
        targets.join(", "),
        sources.join(", "),
        quote_table(&policy.source_name)
    );
    for join in &policy.joins {
        sql.push(' ');
        sql.push_str(join);
    }

    let mut conditions = Vec::new();
    if let (Some(since), Some(field)) = (since, policy.source_field_for(&policy.date_check_field)) {
        conditions.push(format!(
            "{} > {}",
            source_column(field),
            Value::timestamp(since)
        ));
    }
    for c in &policy.conditions {
        condition(c, &mut conditions)?;
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    Ok(sql)
}
