use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub severity: Severity,
    pub message: String,
}

/// Transient outcome of the last persistence operation on an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validity {
    pub exception: Option<String>,
    pub issues: BTreeMap<String, FieldIssue>,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.exception.is_none()
            && self
                .issues
                .values()
                .all(|issue| issue.severity == Severity::Warning)
    }

    /// Records an error for `field`, replacing any earlier issue.
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.insert(
            field.into(),
            FieldIssue {
                severity: Severity::Error,
                message: message.into(),
            },
        );
    }

    /// Records a warning unless the field already carries an error.
    pub fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        let field = field.into();
        if self
            .issues
            .get(&field)
            .is_some_and(|issue| issue.severity == Severity::Error)
        {
            return;
        }
        self.issues.insert(
            field,
            FieldIssue {
                severity: Severity::Warning,
                message: message.into(),
            },
        );
    }

    pub fn issue(&self, field: &str) -> Option<&FieldIssue> {
        self.issues.get(field)
    }

    pub fn has_error(&self, field: &str) -> bool {
        self.issue(field)
            .is_some_and(|issue| issue.severity == Severity::Error)
    }

    pub fn clear(&mut self) {
        self.exception = None;
        self.issues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_does_not_mask_error() {
        let mut validity = Validity::default();
        validity.error("name", "too long");
        validity.warn("name", "local change discarded");
        assert!(validity.has_error("name"));
        assert!(!validity.is_valid());

        validity.clear();
        validity.warn("age", "local change discarded");
        assert!(validity.is_valid());
    }
}
