// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Each Change records what a statement did to one row so that ROLLBACK can
// reverse it. Changes are undone newest-first.
//
// ============================================================================

use crate::core::Row;

/// A single reversible row change recorded by an open transaction.
#[derive(Debug, Clone)]
pub enum Change {
    /// A row was inserted; undo removes it.
    InsertRow { table: String, row_id: usize },

    /// A row was overwritten; undo restores `old_row`.
    UpdateRow {
        table: String,
        row_id: usize,
        old_row: Row,
    },

    /// A row was removed; undo puts `old_row` back under the same id.
    DeleteRow {
        table: String,
        row_id: usize,
        old_row: Row,
    },
}

impl Change {
    /// Get the table name affected by this change
    pub fn table_name(&self) -> &str {
        match self {
            Change::InsertRow { table, .. } => table,
            Change::UpdateRow { table, .. } => table,
            Change::DeleteRow { table, .. } => table,
        }
    }

    pub fn row_id(&self) -> usize {
        match self {
            Change::InsertRow { row_id, .. }
            | Change::UpdateRow { row_id, .. }
            | Change::DeleteRow { row_id, .. } => *row_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[test]
    fn test_change_accessors() {
        let change = Change::UpdateRow {
            table: "person".to_string(),
            row_id: 4,
            old_row: vec![Value::Integer(1)],
        };
        assert_eq!(change.table_name(), "person");
        assert_eq!(change.row_id(), 4);
    }
}
