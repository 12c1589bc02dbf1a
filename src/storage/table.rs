use crate::core::{ConstraintKind, OrmError, Result, Row, TableMeta, Value, Violation};
use crate::sql::{ColumnRef, Filter};
use std::collections::BTreeMap;

/// One table of the in-memory backend: rows keyed by a stable row id.
#[derive(Debug, Clone)]
pub struct Table {
    meta: TableMeta,
    rows: BTreeMap<usize, Row>,
    next_row_id: usize,
    unique_groups: Vec<Vec<usize>>,
}

impl Table {
    pub fn new(meta: TableMeta) -> Result<Self> {
        let unique_groups = meta.unique_groups()?;
        Ok(Self {
            meta,
            rows: BTreeMap::new(),
            next_row_id: 0,
            unique_groups,
        })
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&usize, &Row)> {
        self.rows.iter()
    }

    /// Full row from a column list; unmentioned columns are NULL.
    pub fn build_row(&self, values: &[(String, Value)]) -> Result<Row> {
        let mut row = vec![Value::Null; self.meta.columns.len()];
        for (column, value) in values {
            let idx = self
                .meta
                .find_column_index(column)
                .ok_or_else(|| OrmError::ColumnNotFound(column.clone(), self.meta.name.clone()))?;
            row[idx] = value.clone();
        }
        Ok(row)
    }

    /// Column checks (type, null, size) plus uniqueness against live rows.
    /// `ignore` skips the row being replaced by an update.
    pub fn check_row(&self, row: &Row, ignore: Option<usize>) -> Result<Vec<Violation>> {
        let mut violations = Vec::new();
        for (column, value) in self.meta.columns.iter().zip(row.iter()) {
            column.check(value, &mut violations)?;
        }

        for group in &self.unique_groups {
            let key: Vec<&Value> = group.iter().map(|idx| &row[*idx]).collect();
            // NULL never collides, as in SQL
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = self.rows.iter().any(|(id, existing)| {
                Some(*id) != ignore && group.iter().zip(key.iter()).all(|(idx, v)| existing[*idx] == **v)
            });
            if clash {
                let names: Vec<&str> = group
                    .iter()
                    .map(|idx| self.meta.columns[*idx].name.as_str())
                    .collect();
                let rendered: Vec<String> = key.iter().map(|v| v.to_string()).collect();
                violations.push(Violation {
                    kind: ConstraintKind::Unique,
                    column: names.join(","),
                    detail: format!("duplicate key ({})", rendered.join(", ")),
                });
            }
        }

        Ok(violations)
    }

    pub fn insert(&mut self, row: Row) -> usize {
        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(id, row);
        id
    }

    /// Puts a row back under its old id (undo of a delete).
    pub fn restore(&mut self, row_id: usize, row: Row) {
        self.rows.insert(row_id, row);
    }

    pub fn replace(&mut self, row_id: usize, row: Row) -> Option<Row> {
        self.rows.insert(row_id, row)
    }

    pub fn remove(&mut self, row_id: usize) -> Option<Row> {
        self.rows.remove(&row_id)
    }

    pub fn value_of(&self, row: &Row, column: &str) -> Result<Value> {
        let position = self
            .meta
            .find_column_index(column)
            .ok_or_else(|| OrmError::ColumnNotFound(column.to_string(), self.meta.name.clone()))?;
        Ok(row[position].clone())
    }

    /// Rows (with ids) satisfying `filter` evaluated against this table alone.
    pub fn matching(&self, filter: &Filter) -> Result<Vec<(usize, Row)>> {
        let mut found = Vec::new();
        for (id, row) in &self.rows {
            let lookup = |col: &ColumnRef| -> Result<Value> {
                if let Some(table) = &col.table {
                    if table != &self.meta.name {
                        return Err(OrmError::ColumnNotFound(col.to_string(), self.meta.name.clone()));
                    }
                }
                self.value_of(row, &col.column)
            };
            if filter.evaluate(&lookup)? == Some(true) {
                found.push((*id, row.clone()));
            }
        }
        Ok(found)
    }

    /// Whether some row other than `except` holds `value` in `column`.
    pub fn contains_value(&self, column: &str, value: &Value, except: &[usize]) -> Result<bool> {
        let idx = self
            .meta
            .find_column_index(column)
            .ok_or_else(|| OrmError::ColumnNotFound(column.to_string(), self.meta.name.clone()))?;
        Ok(self
            .rows
            .iter()
            .any(|(id, row)| !except.contains(id) && row[idx] == *value))
    }
}
