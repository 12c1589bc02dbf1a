use super::{Backend, Connection, ConnectionConfig, StatementStats, TableCatalog};
use crate::core::{OrmError, Result};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Connection pool
///
/// Bounded by `max_connections`: `acquire` waits up to `connect_timeout`
/// for a free slot. Pooled connections are never shared; each guard owns
/// its connection until closed or dropped.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    config: ConnectionConfig,
    backend: Arc<dyn Backend>,
    /// Ids of opened connections currently parked in the pool
    idle: Mutex<VecDeque<u64>>,
    permits: Arc<Semaphore>,
    total_connections: AtomicUsize,
    next_id: AtomicU64,
    stats: Arc<StatementStats>,
    catalog: Arc<TableCatalog>,
}

impl PoolShared {
    fn open(&self, id: u64) -> Connection {
        Connection::new(
            id,
            Arc::clone(&self.backend),
            self.config.query_timeout,
            Arc::clone(&self.stats),
            Arc::clone(&self.catalog),
        )
    }
}

impl ConnectionPool {
    pub fn new(backend: Arc<dyn Backend>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let shared = PoolShared {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(VecDeque::new()),
            total_connections: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            stats: Arc::new(StatementStats::new()),
            catalog: Arc::new(TableCatalog::new()),
            backend,
            config,
        };

        // Pre-create minimum connections
        {
            let mut idle = shared.idle.lock()?;
            while shared.total_connections.load(Ordering::SeqCst) < shared.config.min_connections {
                idle.push_back(shared.next_id.fetch_add(1, Ordering::SeqCst));
                shared.total_connections.fetch_add(1, Ordering::SeqCst);
            }
        }

        debug!(
            database = %shared.config.database,
            max_connections = shared.config.max_connections,
            "connection pool created"
        );
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn statement_stats(&self) -> &Arc<StatementStats> {
        &self.shared.stats
    }

    pub fn catalog(&self) -> &Arc<TableCatalog> {
        &self.shared.catalog
    }

    /// Gets a connection from the pool.
    ///
    /// With `auto_commit == false` the connection runs every statement in one
    /// transaction, committed by [`PoolGuard::close`].
    pub async fn acquire(&self, auto_commit: bool) -> Result<PoolGuard> {
        let timeout = self.shared.config.connect_timeout;
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.shared.permits).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(OrmError::Connection("Connection pool is closed".into())),
                Err(_) => {
                    return Err(OrmError::Connection(format!(
                        "Connection pool timeout: no connection available within {:?}",
                        timeout
                    )));
                }
            };

        let reused = self.shared.idle.lock()?.pop_front();
        let id = match reused {
            Some(id) => id,
            None => {
                self.shared.total_connections.fetch_add(1, Ordering::SeqCst);
                self.shared.next_id.fetch_add(1, Ordering::SeqCst)
            }
        };

        let mut connection = self.shared.open(id);
        connection.set_auto_commit(auto_commit);
        Ok(PoolGuard {
            connection,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let available = self.shared.idle.lock()?.len();
        let total = self.shared.total_connections.load(Ordering::SeqCst);

        Ok(PoolStats {
            total_connections: total,
            available_connections: available,
            active_connections: total.saturating_sub(available),
            max_connections: self.shared.config.max_connections,
        })
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// `close` commits and returns the connection. Dropping a guard whose
/// transaction is still open rolls that transaction back.
pub struct PoolGuard {
    connection: Connection,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    /// Commits any open transaction and returns the connection to the pool.
    pub async fn close(mut self) -> Result<()> {
        self.connection.commit().await
    }
}

impl Deref for PoolGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.connection.take_transaction() {
            warn!(
                connection = self.connection.id(),
                transaction = %tx,
                "PoolGuard dropped with active transaction, rolling back"
            );
            self.connection.backend().abandon(tx);
        }

        match self.shared.idle.lock() {
            Ok(mut idle) => idle.push_back(self.connection.id()),
            Err(_) => {
                warn!(connection = self.connection.id(), "pool lock poisoned, connection dropped");
                self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnMeta, DataType, TableMeta};
    use crate::sql::InsertStatement;
    use crate::storage::MemoryDatabase;
    use std::time::Duration;

    fn database() -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new();
        db.create_table(
            TableMeta::new("items")
                .column(ColumnMeta::new("id", DataType::Integer).not_null())
                .primary_key(["id"]),
        )
        .unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = ConnectionConfig::default().min_connections(2).max_connections(5);
        let pool = ConnectionPool::new(database(), config).unwrap();
        let stats = pool.stats().unwrap();

        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.available_connections, 2);
    }

    #[tokio::test]
    async fn test_connection_return_to_pool() {
        let config = ConnectionConfig::default().min_connections(1).max_connections(5);
        let pool = ConnectionPool::new(database(), config).unwrap();

        {
            let _conn = pool.acquire(true).await.unwrap();
            let stats = pool.stats().unwrap();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.available_connections, 0);
        }

        assert_eq!(pool.stats().unwrap().available_connections, 1);
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let config = ConnectionConfig::default()
            .max_connections(2)
            .connect_timeout(Duration::from_millis(50));
        let pool = ConnectionPool::new(database(), config).unwrap();

        let _conn1 = pool.acquire(true).await.unwrap();
        let _conn2 = pool.acquire(true).await.unwrap();

        let result = pool.acquire(true).await;
        assert!(matches!(result, Err(OrmError::Connection(_))));
    }

    #[tokio::test]
    async fn test_close_commits() {
        let db = database();
        let pool = ConnectionPool::new(db.clone(), ConnectionConfig::default()).unwrap();

        let mut guard = pool.acquire(false).await.unwrap();
        guard
            .insert(&InsertStatement::into_table("items").value("id", 1i64))
            .await
            .unwrap();
        guard.close().await.unwrap();

        assert_eq!(db.row_count("items").unwrap(), 1);
        assert_eq!(db.open_transactions().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_rolls_back_open_transaction() {
        let db = database();
        let pool = ConnectionPool::new(db.clone(), ConnectionConfig::default()).unwrap();

        {
            let mut guard = pool.acquire(false).await.unwrap();
            guard
                .insert(&InsertStatement::into_table("items").value("id", 1i64))
                .await
                .unwrap();
        }

        assert_eq!(db.row_count("items").unwrap(), 0);
        assert_eq!(db.open_transactions().unwrap(), 0);
    }
}
