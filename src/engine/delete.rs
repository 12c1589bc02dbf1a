//! Delete Engine: cascades through derived fields, nulls references held
//! by objects further up the deletion stack, and restores the store when
//! the database refuses.

use super::mapping;
use super::PersistenceEngine;
use crate::connection::PoolGuard;
use crate::core::{OrmError, Result, Value};
use crate::object::{ObjectHandle, ObjectRecord, ObjectRef};
use crate::schema::{FieldKind, ID_COLUMN, OWNER_COLUMN};
use crate::sql::{DeleteStatement, Filter, UpdateStatement};
use crate::store::ObjectKey;
use async_recursion::async_recursion;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct DeleteContext {
    visited: HashSet<ObjectKey>,
    /// Objects whose deletion is in progress, outermost first
    stack: Vec<ObjectHandle>,
    unregistered: Vec<(ObjectHandle, Option<ObjectRecord>)>,
    nulled: Vec<(ObjectHandle, String, ObjectRef)>,
}

impl PersistenceEngine {
    /// Deletes `handle` and, through cascading derived fields, its
    /// dependents. Returns `false` if the object was not registered.
    ///
    /// On failure nothing is deleted: the transaction rolls back and every
    /// touched object is put back into the store as it was.
    pub async fn delete(&self, handle: &ObjectHandle) -> Result<bool> {
        let _guard = handle.op_lock().lock().await;
        if !self.store.is_registered(handle)? {
            debug!(object = %handle.reference(), "delete of unregistered object");
            return Ok(false);
        }

        let mut conn = self.pool.acquire(false).await?;
        let mut ctx = DeleteContext::default();

        let walked = self
            .delete_object(&mut conn, handle, &mut ctx)
            .await
            .and_then(|()| self.ensure_unreferenced(&ctx));
        let outcome = match walked {
            Ok(()) => conn.commit().await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                conn.close().await?;
                for (deleted, _) in &ctx.unregistered {
                    deleted.update(|object| object.set_stored(false))?;
                }
                info!(
                    object = %handle.reference(),
                    deleted = ctx.unregistered.len(),
                    "deleted"
                );
                Ok(true)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.rollback().await {
                    error!(error = %rollback_err, "rollback after failed delete failed");
                }
                drop(conn);
                self.restore(ctx)?;
                handle.update(|object| object.validity_mut().exception = Some(err.to_string()))?;
                warn!(object = %handle.reference(), error = %err, "delete rolled back");
                Err(err)
            }
        }
    }

    #[async_recursion]
    async fn delete_object(
        &self,
        conn: &mut PoolGuard,
        handle: &ObjectHandle,
        ctx: &mut DeleteContext,
    ) -> Result<()> {
        if !ctx.visited.insert(self.store.key_of(handle)?) {
            return Ok(());
        }

        // Leave the store first so nothing reached below can find it again.
        let record = self.store.unregister(handle)?;
        ctx.unregistered.push((handle.clone(), record));
        ctx.stack.push(handle.clone());

        for (_, field) in self.registry.fields(handle.class())? {
            let FieldKind::Derived {
                source,
                via,
                cascade_delete: true,
            } = &field.kind
            else {
                continue;
            };
            for dependent in self.store.referrers(&handle.reference(), source, via)? {
                self.delete_object(conn, &dependent, ctx).await?;
            }
        }

        if handle.is_stored()? {
            self.null_back_references(conn, handle, ctx).await?;
            self.delete_rows(conn, handle).await?;
        }
        ctx.stack.pop();
        Ok(())
    }

    /// Fails if an object left in the store still points at anything
    /// deleted in this call. Such references may exist only in memory, where
    /// no foreign key catches them.
    fn ensure_unreferenced(&self, ctx: &DeleteContext) -> Result<()> {
        match self.store.references_to(&ctx.visited)?.into_iter().next() {
            Some((holder, field, target)) => Err(OrmError::StillReferenced {
                target: target.to_string(),
                holder: holder.reference().to_string(),
                field,
            }),
            None => Ok(()),
        }
    }

    /// Clears references to `target` held by objects further up the
    /// deletion stack, in memory and in the database.
    async fn null_back_references(
        &self,
        conn: &mut PoolGuard,
        target: &ObjectHandle,
        ctx: &mut DeleteContext,
    ) -> Result<()> {
        let target_key = self.store.key_of(target)?;
        let holders: Vec<ObjectHandle> = ctx
            .stack
            .iter()
            .filter(|holder| !holder.ptr_eq(target))
            .cloned()
            .collect();

        for holder in holders {
            for (declaring, field) in self.registry.fields(holder.class())? {
                let Some(reference) = holder.with(|object| object.reference_to(&field.name).cloned())? else {
                    continue;
                };
                if self.store.key(&reference.class, reference.id)? != target_key {
                    continue;
                }

                holder.update(|object| object.set_reference(&field.name, None))??;
                ctx.nulled.push((holder.clone(), field.name.clone(), reference));

                if let (true, Some(column)) = (holder.is_stored()?, field.column_name()) {
                    debug!(holder = %holder.reference(), field = %field.name, "nulling back-reference");
                    let stmt = UpdateStatement::new(declaring.table.clone(), Filter::eq(ID_COLUMN, holder.id()))
                        .set(column, Value::Null);
                    conn.update(&stmt).await?;
                }
            }
        }
        Ok(())
    }

    /// Entry rows first, then class rows from the leaf up to the root.
    async fn delete_rows(&self, conn: &mut PoolGuard, handle: &ObjectHandle) -> Result<()> {
        let id = handle.id();
        for (declaring, field) in self.registry.fields(handle.class())? {
            if field.collection().is_some() {
                let stmt = DeleteStatement::new(declaring.entry_table(&field.name), Filter::eq(OWNER_COLUMN, id));
                conn.delete(&stmt).await?;
            }
        }

        for level in self.registry.chain(handle.class())?.into_iter().rev() {
            let removed = conn
                .delete(&DeleteStatement::new(level.table.clone(), Filter::eq(ID_COLUMN, id)))
                .await?;
            if removed == 0 {
                debug!(object = %handle.reference(), table = %level.table, "row already gone");
            }
        }
        Ok(())
    }

    /// Puts nulled references back and re-registers every object removed
    /// from the store, with the record it had.
    fn restore(&self, ctx: DeleteContext) -> Result<()> {
        for (holder, field, reference) in ctx.nulled.into_iter().rev() {
            holder.update(|object| object.set_reference(&field, Some(reference)))??;
        }
        for (handle, record) in ctx.unregistered.into_iter().rev() {
            let record = match record {
                Some(record) => Some(record),
                None if handle.is_stored()? => Some(mapping::record_of(&self.registry, &handle.snapshot()?)?),
                None => None,
            };
            self.store.register(&handle, record)?;
        }
        Ok(())
    }
}
