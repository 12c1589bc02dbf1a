pub mod backend;
pub mod catalog;
pub mod config;
pub mod pool;
pub mod stats;

pub use backend::Backend;
pub use catalog::TableCatalog;
pub use config::ConnectionConfig;
pub use pool::{ConnectionPool, PoolGuard, PoolStats};
pub use stats::{StatementCounts, StatementStats};

use crate::core::{OrmError, Result, TableMeta};
use crate::sql::{DeleteStatement, InsertStatement, ResultSet, SelectStatement, UpdateStatement};
use crate::transaction::TransactionId;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extra time the backstop timer grants beyond the statement's own timeout.
const BACKSTOP_GRACE: Duration = Duration::from_millis(25);

/// Database connection handle
///
/// With auto-commit off, the first statement opens a transaction that stays
/// open until `commit` or `rollback`; every later statement runs inside it.
pub struct Connection {
    id: u64,
    backend: Arc<dyn Backend>,
    auto_commit: bool,
    transaction: Option<TransactionId>,
    query_timeout: Duration,
    stats: Arc<StatementStats>,
    catalog: Arc<TableCatalog>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        backend: Arc<dyn Backend>,
        query_timeout: Duration,
        stats: Arc<StatementStats>,
        catalog: Arc<TableCatalog>,
    ) -> Self {
        Self {
            id,
            backend,
            auto_commit: true,
            transaction: None,
            query_timeout,
            stats,
            catalog,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub(crate) fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub(crate) fn take_transaction(&mut self) -> Option<TransactionId> {
        self.transaction.take()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    async fn current_transaction(&mut self) -> Result<Option<TransactionId>> {
        if self.auto_commit {
            return Ok(None);
        }
        if let Some(tx) = self.transaction {
            return Ok(Some(tx));
        }
        let tx = self.backend.begin().await?;
        debug!(connection = self.id, transaction = %tx, "transaction started");
        self.transaction = Some(tx);
        Ok(Some(tx))
    }

    /// Runs one statement under the backstop timer and logs it on failure.
    async fn guarded<T, F>(&self, stmt: &(dyn Display + Sync), call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let backstop = self.query_timeout + BACKSTOP_GRACE;
        let outcome = match tokio::time::timeout(backstop, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OrmError::Timeout {
                statement: stmt.to_string(),
                elapsed: backstop,
            }),
        };
        if let Err(err) = &outcome {
            warn!(connection = self.id, statement = %stmt, error = %err, "statement failed");
        }
        outcome
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.query_timeout
    }

    pub async fn select(&mut self, stmt: &SelectStatement) -> Result<ResultSet> {
        let tx = self.current_transaction().await?;
        self.stats.record_select();
        let deadline = self.deadline();
        self.guarded(stmt, self.backend.select(tx, stmt, deadline)).await
    }

    pub async fn insert(&mut self, stmt: &InsertStatement) -> Result<Option<i64>> {
        let tx = self.current_transaction().await?;
        self.stats.record_insert();
        let deadline = self.deadline();
        self.guarded(stmt, self.backend.insert(tx, stmt, deadline)).await
    }

    pub async fn update(&mut self, stmt: &UpdateStatement) -> Result<u64> {
        let tx = self.current_transaction().await?;
        self.stats.record_update();
        let deadline = self.deadline();
        self.guarded(stmt, self.backend.update(tx, stmt, deadline)).await
    }

    pub async fn delete(&mut self, stmt: &DeleteStatement) -> Result<u64> {
        let tx = self.current_transaction().await?;
        self.stats.record_delete();
        let deadline = self.deadline();
        self.guarded(stmt, self.backend.delete(tx, stmt, deadline)).await
    }

    /// Table metadata, introspected once and cached for the whole pool.
    pub async fn register_table(&mut self, name: &str) -> Result<TableMeta> {
        if let Some(meta) = self.catalog.get(name)? {
            return Ok(meta);
        }
        let meta = self.backend.table_metadata(name).await?;
        self.catalog.insert(meta.clone())?;
        Ok(meta)
    }

    pub async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.transaction.take() {
            self.backend.commit(tx).await?;
            debug!(connection = self.id, transaction = %tx, "committed");
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.transaction.take() {
            warn!(connection = self.id, transaction = %tx, "rolling back transaction");
            self.backend.rollback(tx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnMeta, DataType, Value};
    use crate::sql::Filter;
    use crate::storage::MemoryDatabase;

    fn backend() -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new();
        db.create_table(
            TableMeta::new("items")
                .column(ColumnMeta::new("id", DataType::Integer).not_null())
                .column(ColumnMeta::new("label", DataType::Text))
                .primary_key(["id"]),
        )
        .unwrap();
        Arc::new(db)
    }

    fn connection(db: Arc<MemoryDatabase>, timeout: Duration) -> Connection {
        Connection::new(
            1,
            db,
            timeout,
            Arc::new(StatementStats::new()),
            Arc::new(TableCatalog::new()),
        )
    }

    #[tokio::test]
    async fn test_transaction_is_opened_lazily() {
        let db = backend();
        let mut conn = connection(db.clone(), Duration::from_secs(5));
        conn.set_auto_commit(false);
        assert!(!conn.is_in_transaction());

        conn.insert(&InsertStatement::into_table("items").value("id", 1i64))
            .await
            .unwrap();
        assert!(conn.is_in_transaction());

        conn.rollback().await.unwrap();
        assert!(!conn.is_in_transaction());
        assert_eq!(db.row_count("items").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_statements_are_counted() {
        let db = backend();
        let mut conn = connection(db, Duration::from_secs(5));
        conn.insert(&InsertStatement::into_table("items").value("id", 1i64))
            .await
            .unwrap();
        conn.update(&UpdateStatement::new("items", Filter::eq("id", 1i64)).set("label", "x"))
            .await
            .unwrap();
        let rows = conn
            .select(&SelectStatement::from("items").column("label"))
            .await
            .unwrap();
        assert_eq!(rows.rows, vec![vec![Value::from("x")]]);

        let counts = conn.stats.snapshot();
        assert_eq!((counts.selects, counts.inserts, counts.updates), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_backstop_timer_cancels_slow_statement() {
        let db = Arc::new(MemoryDatabase::new().with_latency(Duration::from_millis(500)));
        let mut conn = connection(db, Duration::from_millis(20));
        let err = conn
            .select(&SelectStatement::from("items"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_register_table_caches_metadata() {
        let db = backend();
        let mut conn = connection(db, Duration::from_secs(5));
        let meta = conn.register_table("items").await.unwrap();
        assert_eq!(meta.columns.len(), 2);
        assert_eq!(conn.catalog.len().unwrap(), 1);
        assert!(conn.register_table("missing").await.is_err());
    }
}
