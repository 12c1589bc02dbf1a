#![allow(dead_code)]

use relmap::schema::ddl;
use relmap::{
    ClassDescriptor, DataType, EngineConfig, FieldDescriptor, MemoryDatabase, ObjectHandle,
    PersistenceEngine, SchemaRegistry,
};
use std::sync::Arc;

pub const REVIEW: &str = "review";

pub fn registry() -> SchemaRegistry {
    SchemaRegistry::builder()
        .class(
            ClassDescriptor::new("Company")
                .field(FieldDescriptor::scalar("name", DataType::Text).not_null().max_length(20).unique())
                .field(FieldDescriptor::set("tags", DataType::Text))
                .field(FieldDescriptor::derived("staff", "Person", "employer")),
        )
        .class(
            ClassDescriptor::new("Person")
                .field(FieldDescriptor::scalar("name", DataType::Text).not_null().max_length(20))
                .field(FieldDescriptor::scalar("email", DataType::Text).unique())
                .field(FieldDescriptor::scalar("status", DataType::Text))
                .field(FieldDescriptor::reference("employer", "Company"))
                .field(FieldDescriptor::reference("friend", "Person"))
                .field(FieldDescriptor::list("nicknames", DataType::Text))
                .field(FieldDescriptor::map("scores", DataType::Text, DataType::Integer)),
        )
        .class(
            ClassDescriptor::new("Employee")
                .extends("Person")
                .field(FieldDescriptor::scalar("salary", DataType::Integer))
                .field(FieldDescriptor::reference("mentor", "Person")),
        )
        .class(
            ClassDescriptor::new("Badge")
                .field(FieldDescriptor::reference("holder", "Person").not_null())
                .field(FieldDescriptor::scalar("code", DataType::Text)),
        )
        .class(
            ClassDescriptor::new("Invoice")
                .field(FieldDescriptor::scalar("number", DataType::Text))
                .field(FieldDescriptor::reference("highlight", "Line"))
                .field(FieldDescriptor::derived("lines", "Line", "invoice").cascade()),
        )
        .class(
            ClassDescriptor::new("Line")
                .field(FieldDescriptor::reference("invoice", "Invoice").not_null())
                .field(FieldDescriptor::scalar("sku", DataType::Text)),
        )
        .class(ClassDescriptor::new("Left").field(FieldDescriptor::reference("right", "Right").not_null()))
        .class(ClassDescriptor::new("Right").field(FieldDescriptor::reference("left", "Left").not_null()))
        .allocation_purpose(REVIEW)
        .build()
        .unwrap()
}

pub struct Fixture {
    pub database: Arc<MemoryDatabase>,
    pub engine: PersistenceEngine,
}

impl Fixture {
    /// Another engine (separate store and pool) over the same database.
    pub async fn peer(&self) -> PersistenceEngine {
        PersistenceEngine::open(Arc::new(registry()), self.database.clone(), EngineConfig::default())
            .await
            .unwrap()
    }

    pub fn rows(&self, table: &str) -> usize {
        self.database.row_count(table).unwrap()
    }
}

pub async fn setup() -> Fixture {
    setup_with(EngineConfig::default()).await
}

pub async fn setup_with(config: EngineConfig) -> Fixture {
    let registry = registry();
    let database = Arc::new(MemoryDatabase::new());
    database.install(ddl::tables(&registry, &config).unwrap()).unwrap();
    let engine = PersistenceEngine::open(Arc::new(registry), database.clone(), config)
        .await
        .unwrap();
    Fixture { database, engine }
}

/// Same schema, but no foreign keys, so rows may point at rows that are gone.
pub async fn setup_without_foreign_keys() -> Fixture {
    let registry = registry();
    let config = EngineConfig::default();
    let mut tables = ddl::tables(&registry, &config).unwrap();
    for table in &mut tables {
        for column in &mut table.columns {
            column.references = None;
        }
    }
    let database = Arc::new(MemoryDatabase::new());
    database.install(tables).unwrap();
    let engine = PersistenceEngine::open(Arc::new(registry), database.clone(), config)
        .await
        .unwrap();
    Fixture { database, engine }
}

pub fn person(engine: &PersistenceEngine, name: &str) -> ObjectHandle {
    let handle = engine.create("Person").unwrap();
    handle.update(|p| p.set_scalar("name", name)).unwrap().unwrap();
    handle
}

pub fn company(engine: &PersistenceEngine, name: &str) -> ObjectHandle {
    let handle = engine.create("Company").unwrap();
    handle.update(|c| c.set_scalar("name", name)).unwrap().unwrap();
    handle
}

pub fn text(handle: &ObjectHandle, field: &str) -> Option<String> {
    handle
        .with(|o| o.scalar(field).and_then(|v| v.as_str()).map(str::to_string))
        .unwrap()
}
