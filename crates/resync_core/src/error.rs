//! Error types for reconciliation runs.

use thiserror::Error;

/// Result type for reconciliation operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while planning or running a reconciliation.
///
/// Errors fall into three scopes:
/// - configuration errors abort the run before any entity is touched
/// - entity errors fail one entity and the run moves on
/// - [`SyncError::Aborted`] stops the run after the current entity
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An entity was referenced with an empty identity.
    #[error("entity has no identity")]
    UnknownEntity,

    /// A dependency names an entity that is not declared.
    #[error("entity '{entity}' requires unknown entity '{reference}'")]
    UnresolvedReference {
        /// Entity declaring the dependency.
        entity: String,
        /// The name that could not be resolved.
        reference: String,
    },

    /// The declared dependencies contain a cycle.
    #[error("dependency cycle between entities: {}", entities.join(", "))]
    DependencyCycle {
        /// Entities taking part in (or blocked by) the cycle.
        entities: Vec<String>,
    },

    /// An override entry could not be turned into an expression.
    #[error("invalid expression for field '{field}': {reason}")]
    InvalidExpression {
        /// Target field the override belongs to.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A policy action value is not allowed in its context.
    #[error("unexpected value '{value}' for {action} of entity '{entity}'")]
    UnexpectedPolicyValue {
        /// Entity name.
        entity: String,
        /// Action slot (`onDelete`, `onConflict`, ...).
        action: String,
        /// The offending value.
        value: String,
    },

    /// A conflict policy of `abort` fired.
    #[error("reconciliation aborted on conflicts in entity '{entity}'")]
    Aborted {
        /// Entity whose conflicts aborted the run.
        entity: String,
    },

    /// The staging or target store failed.
    #[error("store error: {0}")]
    Store(String),

    /// The store cannot evaluate the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Creates an expression error for `field`.
    pub fn invalid_expression(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidExpression {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error is detected before reconciliation starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_)
                | SyncError::UnknownEntity
                | SyncError::UnresolvedReference { .. }
                | SyncError::DependencyCycle { .. }
                | SyncError::Serialization(_)
                | SyncError::Io(_)
        )
    }

    /// Returns true if this error must stop the whole run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, SyncError::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_scopes() {
        assert!(SyncError::UnknownEntity.is_configuration());
        assert!(SyncError::DependencyCycle {
            entities: vec!["a".into()]
        }
        .is_configuration());
        assert!(!SyncError::store("disk full").is_configuration());
        assert!(!SyncError::invalid_expression("title", "bad").is_run_fatal());
        assert!(SyncError::Aborted {
            entity: "users".into()
        }
        .is_run_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::UnresolvedReference {
            entity: "posts".into(),
            reference: "users".into(),
        };
        assert_eq!(
            err.to_string(),
            "entity 'posts' requires unknown entity 'users'"
        );

        let err = SyncError::DependencyCycle {
            entities: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a, b"));

        let err = SyncError::invalid_expression("title", "expected 2 arguments");
        assert!(err.to_string().contains("title"));
    }
}
