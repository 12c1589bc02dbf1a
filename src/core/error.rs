use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Kind of a single constraint a row failed.
///
/// The declaration order is the ascending order of severity used when
/// violations are turned into field errors: a later kind overrides an
/// earlier one on the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    ColumnSize,
    Unique,
    NotNull,
    ForeignKey,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ColumnSize => "column size",
            Self::Unique => "unique",
            Self::NotNull => "not null",
            Self::ForeignKey => "foreign key",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ConstraintKind,
    pub column: String,
    pub detail: String,
}

/// Every constraint a single statement broke on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub table: String,
    pub violations: Vec<Violation>,
}

impl ConstraintViolation {
    pub fn single(
        table: impl Into<String>,
        kind: ConstraintKind,
        column: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            violations: vec![Violation {
                kind,
                column: column.into(),
                detail: detail.into(),
            }],
        }
    }

    pub fn has_kind(&self, kind: ConstraintKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .violations
            .iter()
            .map(|v| format!("{} on {}.{}: {}", v.kind, self.table, v.column, v.detail))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown class '{0}'")]
    UnknownClass(String),

    #[error("Unknown field '{field}' on class '{class}'")]
    UnknownField { class: String, field: String },

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    Constraint(ConstraintViolation),

    #[error("Statement timed out after {elapsed:?}: {statement}")]
    Timeout { statement: String, elapsed: Duration },

    #[error("Object {0} was changed or removed by another process")]
    Stale(String),

    #[error("Reference cycle through non-nullable foreign keys at {0}")]
    SaveCycle(String),

    #[error("Object {0} is not registered")]
    NotRegistered(String),

    #[error("Object {target} is still referenced by {holder}.{field}")]
    StillReferenced {
        target: String,
        holder: String,
        field: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl OrmError {
    pub fn constraint(&self) -> Option<&ConstraintViolation> {
        match self {
            Self::Constraint(violation) => Some(violation),
            _ => None,
        }
    }

    /// Uniqueness violations are how shadow-row allocation learns that
    /// somebody else already holds the claim.
    pub fn is_unique_violation(&self) -> bool {
        self.constraint()
            .is_some_and(|violation| violation.has_kind(ConstraintKind::Unique))
    }
}

pub type Result<T> = std::result::Result<T, OrmError>;

impl<T> From<std::sync::PoisonError<T>> for OrmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(ConstraintKind::ColumnSize < ConstraintKind::Unique);
        assert!(ConstraintKind::Unique < ConstraintKind::NotNull);
    }

    #[test]
    fn test_unique_violation_detection() {
        let err = OrmError::Constraint(ConstraintViolation::single(
            "jobs_in_progress",
            ConstraintKind::Unique,
            "id",
            "duplicate key 7",
        ));
        assert!(err.is_unique_violation());
        assert!(err.to_string().contains("unique on jobs_in_progress.id"));

        let other = OrmError::Execution("boom".into());
        assert!(!other.is_unique_violation());
    }
}
