use super::FieldValue;
use crate::core::Value;
use std::collections::BTreeMap;

/// Last values this process knows to be persisted for one object.
///
/// Columns are keyed `table.column`; each multi-valued field keeps its
/// entry rows as a pseudo-column holding the whole collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRecord {
    columns: BTreeMap<String, Value>,
    entries: BTreeMap<String, FieldValue>,
}

impl ObjectRecord {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(table: &str, column: &str) -> String {
        format!("{}.{}", table, column)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&Value> {
        self.columns.get(&Self::key(table, column))
    }

    pub fn set_column(&mut self, table: &str, column: &str, value: Value) {
        self.columns.insert(Self::key(table, column), value);
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    pub fn entries(&self, field: &str) -> Option<&FieldValue> {
        self.entries.get(field)
    }

    pub fn set_entries(&mut self, field: &str, value: FieldValue) {
        self.entries.insert(field.to_string(), value);
    }
}
