use super::ColumnRef;
use crate::core::{OrmError, Result, Row, Value};

/// Rows returned by a SELECT, with the column list they were projected on.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnRef>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnRef>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn index_of(&self, table: &str, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.column == column && c.table.as_deref().is_none_or(|t| t == table))
            .ok_or_else(|| OrmError::ColumnNotFound(column.to_string(), table.to_string()))
    }

    pub fn value<'a>(&self, row: &'a Row, table: &str, column: &str) -> Result<&'a Value> {
        let idx = self.index_of(table, column)?;
        row.get(idx).ok_or_else(|| {
            OrmError::Execution(format!("row is shorter than its column list at {}", idx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_qualified_name() {
        let result = ResultSet::new(
            vec![ColumnRef::qualified("person", "id"), ColumnRef::qualified("employee", "id")],
            vec![vec![Value::Integer(1), Value::Integer(1)]],
        );
        assert_eq!(result.index_of("employee", "id").unwrap(), 1);
        assert!(result.index_of("employee", "salary").is_err());
        assert_eq!(result.value(&result.rows[0], "person", "id").unwrap(), &Value::Integer(1));
    }
}
