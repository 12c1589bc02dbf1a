use super::{ConstraintKind, ConstraintViolation, DataType, OrmError, Result, Value, Violation};
use serde::{Deserialize, Serialize};

pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// Column metadata as introspected from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub max_length: Option<usize>,
    pub references: Option<ForeignKeyRef>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            max_length: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyRef {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// Collects every type/null/size problem of `value` for this column.
    pub fn check(&self, value: &Value, out: &mut Vec<Violation>) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                out.push(Violation {
                    kind: ConstraintKind::NotNull,
                    column: self.name.clone(),
                    detail: format!("column '{}' cannot be NULL", self.name),
                });
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(OrmError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        if let (Some(max), Some(len)) = (self.max_length, value.text_len()) {
            if len > max {
                out.push(Violation {
                    kind: ConstraintKind::ColumnSize,
                    column: self.name.clone(),
                    detail: format!("value of length {} exceeds {}", len, max),
                });
            }
        }

        Ok(())
    }
}

/// Table metadata: columns, primary key and unique constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub primary_key: Vec<String>,
    pub unique: Vec<Vec<String>>,
}

impl TableMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnMeta) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn unique<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.unique.push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnMeta> {
        self.find_column_index(name).map(|idx| &self.columns[idx])
    }

    pub fn require_column(&self, name: &str) -> Result<&ColumnMeta> {
        self.get_column(name)
            .ok_or_else(|| OrmError::ColumnNotFound(name.to_string(), self.name.clone()))
    }

    pub fn is_nullable(&self, name: &str) -> Result<bool> {
        Ok(self.require_column(name)?.nullable)
    }

    /// Primary key plus declared unique groups, each as column indexes.
    pub fn unique_groups(&self) -> Result<Vec<Vec<usize>>> {
        let mut groups = Vec::new();
        let declared = std::iter::once(&self.primary_key)
            .filter(|pk| !pk.is_empty())
            .chain(self.unique.iter());
        for group in declared {
            let indexes = group
                .iter()
                .map(|name| {
                    self.find_column_index(name)
                        .ok_or_else(|| OrmError::ColumnNotFound(name.clone(), self.name.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            groups.push(indexes);
        }
        Ok(groups)
    }

    pub fn violation(&self, violations: Vec<Violation>) -> OrmError {
        OrmError::Constraint(ConstraintViolation {
            table: self.name.clone(),
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_collects_null_and_size() {
        let name = ColumnMeta::new("name", DataType::Text)
            .not_null()
            .max_length(Some(3));
        let mut out = Vec::new();

        name.check(&Value::Null, &mut out).unwrap();
        name.check(&Value::from("abcd"), &mut out).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, ConstraintKind::NotNull);
        assert_eq!(out[1].kind, ConstraintKind::ColumnSize);
    }

    #[test]
    fn test_check_rejects_wrong_type() {
        let age = ColumnMeta::new("age", DataType::Integer);
        let mut out = Vec::new();
        assert!(age.check(&Value::from("x"), &mut out).is_err());
    }

    #[test]
    fn test_unique_groups_include_primary_key() {
        let table = TableMeta::new("tags")
            .column(ColumnMeta::new("owner_id", DataType::Integer))
            .column(ColumnMeta::new("element", DataType::Text))
            .primary_key(["owner_id", "element"])
            .unique(["element"]);
        let groups = table.unique_groups().unwrap();
        assert_eq!(groups, vec![vec![0, 1], vec![1]]);
    }
}
