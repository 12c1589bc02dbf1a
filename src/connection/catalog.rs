use crate::core::{Result, TableMeta};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Table metadata already introspected through `register_table`.
///
/// Readers clone the inner `Arc` and never hold the lock while using the
/// map; a new table replaces the whole map (copy-on-write).
#[derive(Debug, Default)]
pub struct TableCatalog {
    tables: RwLock<Arc<HashMap<String, TableMeta>>>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<Arc<HashMap<String, TableMeta>>> {
        Ok(Arc::clone(&*self.tables.read()?))
    }

    pub fn get(&self, name: &str) -> Result<Option<TableMeta>> {
        Ok(self.snapshot()?.get(name).cloned())
    }

    pub fn insert(&self, meta: TableMeta) -> Result<()> {
        let mut guard = self.tables.write()?;
        let mut tables = (**guard).clone();
        tables.insert(meta.name.clone(), meta);
        *guard = Arc::new(tables);
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }
}
