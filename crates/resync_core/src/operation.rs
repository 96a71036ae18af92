//! Declarative store operations.
//!
//! Stages never touch a store directly. They describe each mutation as an
//! [`Operation`] that listeners may inspect or replace before the
//! [`TargetStore`](crate::store::TargetStore) executes it. Field names are
//! target-side names; staged rows use the same names since staging mirrors
//! the mapped target columns.

use crate::expr::Assignment;
use crate::policy::MatchRule;
use crate::value::Value;
use serde::Serialize;
use std::fmt;

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    /// Field of the target row (`_t`).
    Target(String),
    /// Field of the staged row (`_s`).
    Staged(String),
    /// Constant.
    Value(Value),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Target(field) => write!(f, "_t.{field}"),
            Operand::Staged(field) => write!(f, "_s.{field}"),
            Operand::Value(value) => write!(f, "{value}"),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Comparison {
    /// SQL spelling of the operator.
    pub fn as_sql(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }

    /// Applies the operator to an ordering.
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparison::Eq => ordering == Equal,
            Comparison::Ne => ordering != Equal,
            Comparison::Lt => ordering == Less,
            Comparison::Le => ordering != Greater,
            Comparison::Gt => ordering == Greater,
            Comparison::Ge => ordering != Less,
        }
    }
}

/// Row filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    /// Compare two operands; NULL makes the comparison false.
    Compare {
        /// Left operand.
        left: Operand,
        /// Operator.
        op: Comparison,
        /// Right operand.
        right: Operand,
    },
    /// The target row has no staged counterpart.
    StagedMissing,
    /// The target row has a staged counterpart.
    StagedPresent,
    /// Every predicate holds (true when empty).
    All(Vec<Predicate>),
    /// Any predicate holds (false when empty).
    Any(Vec<Predicate>),
}

impl Predicate {
    /// Builds a comparison.
    pub fn compare(left: Operand, op: Comparison, right: Operand) -> Self {
        Predicate::Compare { left, op, right }
    }

    /// `_t.field = value`
    pub fn target_is(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(
            Operand::Target(field.into()),
            Comparison::Eq,
            Operand::Value(value.into()),
        )
    }

    /// `_s.field = value`
    pub fn staged_is(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(
            Operand::Staged(field.into()),
            Comparison::Eq,
            Operand::Value(value.into()),
        )
    }

    /// A predicate that always holds.
    pub fn always() -> Self {
        Predicate::All(Vec::new())
    }

    /// Conjunction that flattens nested conjunctions.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All(mut a), Predicate::All(b)) => {
                a.extend(b);
                Predicate::All(a)
            }
            (Predicate::All(mut a), p) => {
                a.push(p);
                Predicate::All(a)
            }
            (p, Predicate::All(mut b)) => {
                b.insert(0, p);
                Predicate::All(b)
            }
            (a, b) => Predicate::All(vec![a, b]),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { left, op, right } => {
                write!(f, "{left} {} {right}", op.as_sql())
            }
            Predicate::StagedMissing => f.write_str("_s IS MISSING"),
            Predicate::StagedPresent => f.write_str("_s IS PRESENT"),
            Predicate::All(parts) if parts.is_empty() => f.write_str("TRUE"),
            Predicate::Any(parts) if parts.is_empty() => f.write_str("FALSE"),
            Predicate::All(parts) => join(f, parts, " AND "),
            Predicate::Any(parts) => join(f, parts, " OR "),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, parts: &[Predicate], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{part}")?;
    }
    f.write_str(")")
}

/// Which target rows an operation visits and how staged rows pair with them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Scope {
    /// Target rows with a staged row matching by the rule (inner join).
    Matched(MatchRule),
    /// Every target row, paired with the staged row sharing its identifier
    /// if there is one (left join).
    Outer {
        /// Identifier field.
        identifier: String,
    },
}

/// A mutation or query against the target or staging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operation {
    /// Count distinct staged rows matched by the rule and passing the filter.
    Count {
        /// Pairing rule.
        rule: MatchRule,
        /// Filter over the pair.
        filter: Predicate,
    },
    /// Set the marker on staged rows matched by the rule and passing the filter.
    MarkConflicts {
        /// Pairing rule.
        rule: MatchRule,
        /// Filter over the pair.
        filter: Predicate,
        /// Marker column in staging.
        marker: String,
    },
    /// Update target rows in scope passing the filter.
    Update {
        /// Rows visited.
        scope: Scope,
        /// Filter over the pair.
        filter: Predicate,
        /// New values.
        assignments: Vec<Assignment>,
    },
    /// Delete target rows in scope passing the filter.
    Delete {
        /// Rows visited.
        scope: Scope,
        /// Filter over the pair.
        filter: Predicate,
    },
    /// Insert staged rows passing the filter that match no target row.
    /// Rows violating a uniqueness constraint are skipped.
    Insert {
        /// Rule used to find existing target rows.
        rule: MatchRule,
        /// Filter over the staged row.
        filter: Predicate,
        /// Column values of the new rows.
        assignments: Vec<Assignment>,
    },
}

impl Operation {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Count { .. } => "count",
            Operation::MarkConflicts { .. } => "mark_conflicts",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Insert { .. } => "insert",
        }
    }

    /// Returns true if the operation changes the target.
    pub fn mutates_target(&self) -> bool {
        matches!(
            self,
            Operation::Update { .. } | Operation::Delete { .. } | Operation::Insert { .. }
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Count { filter, .. } => write!(f, "COUNT WHERE {filter}"),
            Operation::MarkConflicts { filter, marker, .. } => {
                write!(f, "MARK {marker} WHERE {filter}")
            }
            Operation::Update {
                filter,
                assignments,
                ..
            } => {
                let sets: Vec<_> = assignments.iter().map(ToString::to_string).collect();
                write!(f, "UPDATE SET {} WHERE {filter}", sets.join(", "))
            }
            Operation::Delete { filter, .. } => write!(f, "DELETE WHERE {filter}"),
            Operation::Insert {
                filter,
                assignments,
                ..
            } => {
                let cols: Vec<_> = assignments.iter().map(|a| a.field.as_str()).collect();
                write!(f, "INSERT ({}) WHERE {filter}", cols.join(", "))
            }
        }
    }
}
