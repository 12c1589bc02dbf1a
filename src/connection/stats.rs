use std::sync::atomic::{AtomicU64, Ordering};

/// Statement counters shared by every connection of one pool.
#[derive(Debug, Default)]
pub struct StatementStats {
    selects: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementCounts {
    pub selects: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl StatementStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_select(&self) {
        self.selects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatementCounts {
        StatementCounts {
            selects: self.selects.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

impl StatementCounts {
    /// Statements issued between `earlier` and `self`.
    pub fn since(&self, earlier: &StatementCounts) -> StatementCounts {
        StatementCounts {
            selects: self.selects.saturating_sub(earlier.selects),
            inserts: self.inserts.saturating_sub(earlier.inserts),
            updates: self.updates.saturating_sub(earlier.updates),
            deletes: self.deletes.saturating_sub(earlier.deletes),
        }
    }

    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

impl std::fmt::Display for StatementCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} selects, {} inserts, {} updates, {} deletes",
            self.selects, self.inserts, self.updates, self.deletes
        )
    }
}
