// ============================================================================
// Backend Transactions
// ============================================================================
//
// A transaction is an id plus the undo log of what its statements did.
// Writes are applied to the tables immediately (read uncommitted), so
// commit only forgets the log and rollback replays it backwards.
//
// ============================================================================

use super::Change;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// An open backend transaction and its undo log.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    changes: Vec<Change>,
    started: Instant,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            changes: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_change(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Ends the transaction keeping its effects; returns how many row
    /// changes it made.
    pub fn commit(self) -> usize {
        self.changes.len()
    }

    /// Ends the transaction; returns the changes to undo, newest first.
    pub fn rollback(self) -> Vec<Change> {
        let mut undo = self.changes;
        undo.reverse();
        undo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ids_increase() {
        let first = TransactionId::new();
        let second = TransactionId::new();
        assert!(second.as_u64() > first.as_u64());
    }

    #[test]
    fn test_rollback_returns_changes_newest_first() {
        let mut txn = Transaction::new(TransactionId::new());
        txn.record_change(Change::InsertRow { table: "a".into(), row_id: 0 });
        txn.record_change(Change::InsertRow { table: "b".into(), row_id: 1 });
        assert_eq!(txn.change_count(), 2);

        let undo = txn.rollback();
        let tables: Vec<&str> = undo.iter().map(Change::table_name).collect();
        assert_eq!(tables, vec!["b", "a"]);
    }

    #[test]
    fn test_commit_reports_change_count() {
        let mut txn = Transaction::new(TransactionId::new());
        txn.record_change(Change::DeleteRow {
            table: "person".into(),
            row_id: 3,
            old_row: Vec::new(),
        });
        assert_eq!(txn.commit(), 1);
    }
}
