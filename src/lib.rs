// ============================================================================
// relmap Library
// ============================================================================

pub mod allocation;
pub mod config;
pub mod connection;
pub mod core;
pub mod engine;
pub mod object;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod store;
pub mod transaction;

// Re-export main types for convenience
pub use allocation::ExclusiveAllocator;
pub use config::EngineConfig;
pub use core::{DataType, OrmError, Result, Value};
pub use engine::{ClassHorizon, DataHorizon, PersistenceEngine, Unbounded};
pub use object::{DomainObject, FieldValue, ObjectHandle, ObjectId, ObjectRef, Validity};
pub use schema::{ClassDescriptor, FieldDescriptor, SchemaRegistry};
pub use storage::MemoryDatabase;
pub use store::ObjectStore;

// Re-export connection API
pub use connection::{
    Backend, Connection, ConnectionConfig, ConnectionPool, PoolGuard, PoolStats, StatementCounts,
};

/// Opens an engine over a fresh in-memory database with every mapped
/// table created.
///
/// # Examples
///
/// ```
/// use relmap::{ClassDescriptor, DataType, EngineConfig, FieldDescriptor, SchemaRegistry};
///
/// # #[tokio::main]
/// # async fn main() -> relmap::Result<()> {
/// let registry = SchemaRegistry::builder()
///     .class(ClassDescriptor::new("Person").field(FieldDescriptor::scalar("name", DataType::Text)))
///     .build()?;
/// let engine = relmap::open_in_memory(registry, EngineConfig::default()).await?;
///
/// let ada = engine.create("Person")?;
/// ada.update(|person| person.set_scalar("name", "Ada"))??;
/// assert!(engine.save(&ada).await?);
/// assert!(!engine.save(&ada).await?);
/// # Ok(())
/// # }
/// ```
pub async fn open_in_memory(registry: SchemaRegistry, config: EngineConfig) -> Result<PersistenceEngine> {
    let database = MemoryDatabase::new();
    database.install(schema::ddl::tables(&registry, &config)?)?;
    PersistenceEngine::open(std::sync::Arc::new(registry), std::sync::Arc::new(database), config).await
}
