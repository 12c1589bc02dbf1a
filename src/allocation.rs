//! Exclusive allocation through shadow tables.
//!
//! Claiming an object for a purpose inserts its id into the purpose's
//! `<purpose>_in_progress` table. The primary key makes the insert fail
//! for everybody but the first claimant, across processes sharing the
//! database.

use crate::connection::Connection;
use crate::core::{Result, Value};
use crate::object::ObjectId;
use crate::schema::ddl::{shadow_table_name, ALLOCATED_AT_COLUMN, HOLDER_COLUMN};
use crate::schema::ID_COLUMN;
use crate::sql::{ColumnRef, DeleteStatement, Filter, InsertStatement, SelectStatement};
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExclusiveAllocator {
    holder: String,
}

impl ExclusiveAllocator {
    pub fn new(holder: Uuid) -> Self {
        Self {
            holder: holder.to_string(),
        }
    }

    /// Identifies this allocator's claims in the shadow tables.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Returns `false` if someone already holds `id` for `purpose`.
    pub async fn try_acquire(
        &self,
        conn: &mut Connection,
        purpose: &str,
        id: ObjectId,
    ) -> Result<bool> {
        let stmt = InsertStatement::into_table(shadow_table_name(purpose))
            .value(ID_COLUMN, id)
            .value(HOLDER_COLUMN, self.holder.as_str())
            .value(ALLOCATED_AT_COLUMN, Utc::now());

        match conn.insert(&stmt).await {
            Ok(_) => {
                info!(purpose, id, holder = %self.holder, "allocated");
                Ok(true)
            }
            Err(err) if err.is_unique_violation() => {
                debug!(purpose, id, "already allocated");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Drops this allocator's claim. Claims held by others are left alone.
    pub async fn release(&self, conn: &mut Connection, purpose: &str, id: ObjectId) -> Result<bool> {
        let filter = Filter::eq(ID_COLUMN, id).and(Filter::eq(HOLDER_COLUMN, self.holder.as_str()));
        let removed = conn
            .delete(&DeleteStatement::new(shadow_table_name(purpose), filter))
            .await?;
        if removed > 0 {
            info!(purpose, id, "released");
        }
        Ok(removed > 0)
    }

    /// Current holder of `id` for `purpose`, if any.
    pub async fn holder_of(
        &self,
        conn: &mut Connection,
        purpose: &str,
        id: ObjectId,
    ) -> Result<Option<String>> {
        let table = shadow_table_name(purpose);
        let stmt = SelectStatement::from(table.clone())
            .column(ColumnRef::qualified(table.clone(), HOLDER_COLUMN))
            .filter(Filter::eq(ColumnRef::qualified(table.clone(), ID_COLUMN), id));
        let result = conn.select(&stmt).await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}
