// ============================================================================
// Persistence Engine
// ============================================================================
//
// Keeps the in-memory object graph and the database in step:
//
//   load    joined SELECTs over the class chain, reference resolution
//   save    field diffs against object records, FK-ordered writes
//   delete  cascading deletes with back-reference neutralization
//
// One pooled connection per public operation; writes run in a single
// transaction that commits when the connection is closed.
//
// ============================================================================

pub mod delete;
pub mod horizon;
pub mod load;
pub mod mapping;
pub mod save;

pub use horizon::{ClassHorizon, DataHorizon, Unbounded};

use crate::allocation::ExclusiveAllocator;
use crate::config::EngineConfig;
use crate::connection::{Backend, ConnectionPool, StatementCounts};
use crate::core::{OrmError, Result};
use crate::object::{DomainObject, ObjectHandle, ObjectId};
use crate::schema::{FieldKind, SchemaRegistry, ddl, ID_COLUMN};
use crate::sql::{ColumnRef, SelectStatement};
use crate::store::ObjectStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct PersistenceEngine {
    registry: Arc<SchemaRegistry>,
    store: Arc<ObjectStore>,
    pool: ConnectionPool,
    config: EngineConfig,
    horizon: Arc<dyn DataHorizon>,
    allocator: ExclusiveAllocator,
}

impl PersistenceEngine {
    /// Connects to `backend`, checks that every mapped table and column
    /// exists, and seeds the id sequence above every persisted id.
    pub async fn open(
        registry: Arc<SchemaRegistry>,
        backend: Arc<dyn Backend>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        for class in registry.classes() {
            for field in &class.fields {
                let Some(column) = field.column_name() else {
                    continue;
                };
                if column == config.discriminator_column || column == config.last_modified_column {
                    return Err(OrmError::Configuration(format!(
                        "Column '{}' of {}.{} is reserved",
                        column, class.name, field.name
                    )));
                }
            }
        }

        let pool = ConnectionPool::new(backend, config.connection.clone())?;
        let engine = Self {
            store: Arc::new(ObjectStore::new(Arc::clone(&registry))),
            registry,
            pool,
            config,
            horizon: Arc::new(Unbounded),
            allocator: ExclusiveAllocator::new(Uuid::new_v4()),
        };
        engine.verify_schema().await?;

        info!(
            database = %engine.config.connection.database,
            classes = engine.registry.classes().count(),
            holder = %engine.allocator.holder(),
            "persistence engine opened"
        );
        Ok(engine)
    }

    pub fn with_horizon(mut self, horizon: Arc<dyn DataHorizon>) -> Self {
        self.horizon = horizon;
        self
    }

    async fn verify_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire(true).await?;

        for expected in ddl::tables(&self.registry, &self.config)? {
            let meta = conn.register_table(&expected.name).await.map_err(|err| {
                OrmError::Configuration(format!("Table '{}' is not usable: {}", expected.name, err))
            })?;
            for column in &expected.columns {
                meta.require_column(&column.name).map_err(|_| {
                    OrmError::Configuration(format!(
                        "Table '{}' has no column '{}'",
                        expected.name, column.name
                    ))
                })?;
            }
        }

        for root in self.registry.classes().filter(|c| c.is_root()) {
            let id = ColumnRef::qualified(root.table.clone(), ID_COLUMN);
            let stmt = SelectStatement::from(root.table.clone())
                .column(id.clone())
                .order_by(id, true)
                .limit(Some(1));
            let result = conn.select(&stmt).await?;
            if let Some(max) = result.rows.first().and_then(|row| row.first()).and_then(|v| v.as_i64()) {
                debug!(class = %root.name, max_id = max, "seeding id sequence");
                self.store.seed_ids(max);
            }
        }

        conn.close().await
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn allocator(&self) -> &ExclusiveAllocator {
        &self.allocator
    }

    /// Instantiates a new, unsaved object of `class` and registers it.
    pub fn create(&self, class: &str) -> Result<ObjectHandle> {
        let object = self.registry.instantiate(class, self.store.next_id())?;
        let handle = ObjectHandle::new(object);
        self.store.register(&handle, None)?;
        debug!(object = %handle.reference(), "created");
        Ok(handle)
    }

    pub fn lookup(&self, class: &str, id: ObjectId) -> Result<Option<ObjectHandle>> {
        self.store.lookup(class, id)
    }

    /// Current members of the derived field `field` of `handle`.
    pub fn accumulation(&self, handle: &ObjectHandle, field: &str) -> Result<Vec<ObjectHandle>> {
        let (_, descriptor) = self.registry.field(handle.class(), field)?;
        match &descriptor.kind {
            FieldKind::Derived { source, via, .. } => {
                self.store.referrers(&handle.reference(), source, via)
            }
            _ => Err(OrmError::TypeMismatch(format!(
                "{}.{} is not a derived field",
                handle.class(),
                field
            ))),
        }
    }

    /// Statements issued through this engine's pool so far.
    pub fn statement_counts(&self) -> StatementCounts {
        self.pool.statement_stats().snapshot()
    }

    /// Claims `handle` for `purpose`; on success applies `update` and saves.
    /// Returns `false` when another party already holds the claim.
    pub async fn allocate_exclusively<F>(
        &self,
        handle: &ObjectHandle,
        purpose: &str,
        update: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut DomainObject) + Send,
    {
        self.check_purpose(purpose)?;
        {
            let mut conn = self.pool.acquire(true).await?;
            let acquired = self
                .allocator
                .try_acquire(&mut conn, purpose, handle.id())
                .await?;
            conn.close().await?;
            if !acquired {
                debug!(object = %handle.reference(), purpose, "allocation held elsewhere");
                return Ok(false);
            }
        }

        handle.update(update)?;
        if let Err(err) = self.save(handle).await {
            warn!(object = %handle.reference(), purpose, error = %err, "save after allocation failed, releasing");
            if let Err(release_err) = self.release(handle, purpose).await {
                error!(
                    object = %handle.reference(),
                    purpose,
                    error = %release_err,
                    "allocation left held after failed save"
                );
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Releases this engine's claim on `handle`. Returns `false` if no such
    /// claim existed.
    pub async fn release(&self, handle: &ObjectHandle, purpose: &str) -> Result<bool> {
        self.check_purpose(purpose)?;
        let mut conn = self.pool.acquire(true).await?;
        let released = self
            .allocator
            .release(&mut conn, purpose, handle.id())
            .await?;
        conn.close().await?;
        Ok(released)
    }

    /// Applies `update`, saves, then releases the claim.
    pub async fn release_with<F>(
        &self,
        handle: &ObjectHandle,
        purpose: &str,
        update: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut DomainObject) + Send,
    {
        self.check_purpose(purpose)?;
        handle.update(update)?;
        self.save(handle).await?;
        self.release(handle, purpose).await
    }

    fn check_purpose(&self, purpose: &str) -> Result<()> {
        if self.registry.allocation_purposes().iter().any(|p| p == purpose) {
            Ok(())
        } else {
            Err(OrmError::Configuration(format!(
                "Allocation purpose '{}' is not declared",
                purpose
            )))
        }
    }

    /// Empties the Object Store; handles held by callers become detached.
    pub fn shutdown(&self) -> Result<()> {
        let count = self.store.len()?;
        self.store.clear()?;
        info!(objects = count, "persistence engine shut down");
        Ok(())
    }
}
