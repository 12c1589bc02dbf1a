use crate::core::{Result, TableMeta};
use crate::sql::{DeleteStatement, InsertStatement, ResultSet, SelectStatement, UpdateStatement};
use crate::transaction::TransactionId;
use async_trait::async_trait;
use std::time::Instant;

/// A relational database as seen by the gateway.
///
/// Statements run inside `tx` when given, otherwise they commit on their
/// own. `deadline` is the statement's own timeout; the connection adds a
/// backstop timer around every call.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn begin(&self) -> Result<TransactionId>;

    async fn commit(&self, tx: TransactionId) -> Result<()>;

    async fn rollback(&self, tx: TransactionId) -> Result<()>;

    /// Best-effort rollback usable from `Drop`.
    fn abandon(&self, tx: TransactionId);

    async fn select(
        &self,
        tx: Option<TransactionId>,
        stmt: &SelectStatement,
        deadline: Instant,
    ) -> Result<ResultSet>;

    /// Returns the generated key (single integer primary key), if any.
    async fn insert(
        &self,
        tx: Option<TransactionId>,
        stmt: &InsertStatement,
        deadline: Instant,
    ) -> Result<Option<i64>>;

    async fn update(
        &self,
        tx: Option<TransactionId>,
        stmt: &UpdateStatement,
        deadline: Instant,
    ) -> Result<u64>;

    async fn delete(
        &self,
        tx: Option<TransactionId>,
        stmt: &DeleteStatement,
        deadline: Instant,
    ) -> Result<u64>;

    async fn table_metadata(&self, name: &str) -> Result<TableMeta>;
}
