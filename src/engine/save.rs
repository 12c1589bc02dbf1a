//! Save Engine: diff-driven INSERT/UPDATE in foreign-key order, with
//! deferred nullable references and per-column failure isolation.

use super::mapping::{self, ColumnChange, EntryChange, LevelChanges};
use super::PersistenceEngine;
use crate::connection::PoolGuard;
use crate::core::{ConstraintViolation, OrmError, Result, Value};
use crate::object::{FieldValue, ObjectHandle, ObjectId, ObjectRecord, ObjectRef};
use crate::schema::{ELEMENT_COLUMN, ID_COLUMN, KEY_COLUMN, OWNER_COLUMN, POSITION_COLUMN, VALUE_COLUMN};
use crate::sql::{ColumnRef, DeleteStatement, Filter, InsertStatement, UpdateStatement};
use crate::store::ObjectKey;
use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct SaveContext {
    in_flight: HashSet<ObjectKey>,
    saved: HashSet<ObjectKey>,
    /// Nullable references whose target was still being inserted when the
    /// holder finished; completed once the target is done.
    postponed: Vec<(ObjectHandle, String, ObjectHandle)>,
    undo: Vec<SaveUndo>,
}

/// In-memory effects reverted when the transaction rolls back.
enum SaveUndo {
    Stored {
        handle: ObjectHandle,
        was_stored: bool,
        previous: Option<ObjectRecord>,
    },
    Detached {
        holder: ObjectHandle,
        field: String,
        target: ObjectRef,
    },
}

impl PersistenceEngine {
    /// Persists `handle` and every unsaved object it references.
    ///
    /// Returns whether anything was written. A clean stored object issues
    /// no statements. Field-level failures on UPDATE are reported through
    /// the object's validity; anything else rolls the whole save back.
    pub async fn save(&self, handle: &ObjectHandle) -> Result<bool> {
        let _guard = handle.op_lock().lock().await;
        if !self.store.is_registered(handle)? {
            return Err(OrmError::NotRegistered(handle.reference().to_string()));
        }

        let mut conn = self.pool.acquire(false).await?;
        let mut ctx = SaveContext::default();

        let outcome = match self.save_object(&mut conn, handle, &mut ctx).await {
            Ok(written) => conn.commit().await.map(|_| written),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(written) => {
                conn.close().await?;
                if written {
                    info!(object = %handle.reference(), saved = ctx.saved.len(), "saved");
                }
                Ok(written)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.rollback().await {
                    error!(error = %rollback_err, "rollback after failed save failed");
                }
                drop(conn);
                self.undo_save(ctx)?;
                handle.update(|object| object.validity_mut().exception = Some(err.to_string()))?;
                warn!(object = %handle.reference(), error = %err, "save rolled back");
                Err(err)
            }
        }
    }

    #[async_recursion]
    async fn save_object(
        &self,
        conn: &mut PoolGuard,
        handle: &ObjectHandle,
        ctx: &mut SaveContext,
    ) -> Result<bool> {
        let key = self.store.key_of(handle)?;
        if ctx.saved.contains(&key) {
            return Ok(false);
        }
        if !ctx.in_flight.insert(key.clone()) {
            return Err(OrmError::SaveCycle(handle.reference().to_string()));
        }

        let outcome = self.write_object(conn, handle, ctx).await;
        ctx.in_flight.remove(&key);
        let written = outcome?;
        ctx.saved.insert(key);

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut ctx.postponed)
            .into_iter()
            .partition(|(_, _, target)| target.ptr_eq(handle));
        ctx.postponed = waiting;
        for (holder, field, target) in ready {
            self.reattach(conn, &holder, &field, &target).await?;
        }
        Ok(written)
    }

    async fn write_object(
        &self,
        conn: &mut PoolGuard,
        handle: &ObjectHandle,
        ctx: &mut SaveContext,
    ) -> Result<bool> {
        handle.update(|object| object.validity_mut().clear())?;
        let record = self.store.record(handle)?;
        let stored = handle.is_stored()?;
        let mut snapshot = handle.snapshot()?;

        if stored && mapping::changes(&self.registry, &snapshot, record.as_ref())?.is_empty() {
            debug!(object = %handle.reference(), "unchanged");
            return Ok(false);
        }

        // Unsaved targets: nullable references are cut and re-attached
        // afterwards, non-nullable ones must be inserted first.
        let mut deferred = Vec::new();
        for (_, field) in self.registry.fields(handle.class())? {
            let Some(target_ref) = snapshot.reference_to(&field.name).cloned() else {
                continue;
            };
            let target = self
                .store
                .lookup_ref(&target_ref)?
                .ok_or_else(|| OrmError::NotRegistered(target_ref.to_string()))?;
            if target.is_stored()? {
                continue;
            }
            if field.nullable {
                handle.update(|object| object.set_reference(&field.name, None))??;
                ctx.undo.push(SaveUndo::Detached {
                    holder: handle.clone(),
                    field: field.name.clone(),
                    target: target_ref,
                });
                deferred.push((field.name.clone(), target));
            } else {
                self.save_object(conn, &target, ctx).await?;
            }
        }
        if !deferred.is_empty() {
            snapshot = handle.snapshot()?;
        }

        let plan = mapping::changes(&self.registry, &snapshot, record.as_ref())?;
        let now = Utc::now();
        let mut failed: Vec<(String, String)> = Vec::new();

        for level in &plan.levels {
            if stored {
                if level.columns.is_empty() {
                    continue;
                }
                for column in self.update_level(conn, handle, level, now).await? {
                    failed.push((level.table.clone(), column));
                }
            } else {
                let mut stmt = InsertStatement::into_table(level.table.clone()).value(ID_COLUMN, handle.id());
                if level.is_root {
                    stmt = stmt
                        .value(self.config.discriminator_column.clone(), handle.class())
                        .value(self.config.last_modified_column.clone(), now);
                }
                for change in &level.columns {
                    stmt = stmt.value(change.column.clone(), change.value.clone());
                }
                if let Err(err) = conn.insert(&stmt).await {
                    self.record_failure(handle, &err)?;
                    return Err(err);
                }
            }
        }

        for entry in &plan.entries {
            if let Err(err) = self.write_entries(conn, handle.id(), entry, stored).await {
                self.record_failure(handle, &err)?;
                return Err(err);
            }
        }

        let mut persisted = mapping::record_of(&self.registry, &snapshot)?;
        for (table, column) in &failed {
            match record.as_ref().and_then(|r| r.column(table, column)) {
                Some(value) => persisted.set_column(table, column, value.clone()),
                None => persisted.set_column(table, column, Value::Null),
            }
        }
        ctx.undo.push(SaveUndo::Stored {
            handle: handle.clone(),
            was_stored: stored,
            previous: record,
        });
        handle.update(|object| object.set_stored(true))?;
        self.store.set_record(handle, persisted)?;

        for (field, target) in deferred {
            if target.is_stored()? {
                self.reattach(conn, handle, &field, &target).await?;
            } else if ctx.in_flight.contains(&self.store.key_of(&target)?) {
                ctx.postponed.push((handle.clone(), field, target));
            } else {
                self.save_object(conn, &target, ctx).await?;
                self.reattach(conn, handle, &field, &target).await?;
            }
        }

        Ok(true)
    }

    /// UPDATE of one chain level. A constraint failure on a multi-column
    /// update is retried column by column; columns that still fail get a
    /// field error and are returned.
    async fn update_level(
        &self,
        conn: &mut PoolGuard,
        handle: &ObjectHandle,
        level: &LevelChanges,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let all: Vec<_> = level.columns.iter().collect();
        let violation = match conn.update(&self.level_update(level, handle.id(), &all, now)).await {
            Ok(0) => return Err(OrmError::Stale(handle.reference().to_string())),
            Ok(_) => return Ok(Vec::new()),
            Err(OrmError::Constraint(violation)) => violation,
            Err(err) => return Err(err),
        };

        if all.len() == 1 {
            self.record_violation(handle, &violation)?;
            return Ok(all.iter().map(|change| change.column.clone()).collect());
        }

        debug!(
            object = %handle.reference(),
            table = %level.table,
            "update rejected, retrying column by column"
        );
        let mut failed = Vec::new();
        for change in all {
            match conn.update(&self.level_update(level, handle.id(), &[change], now)).await {
                Ok(0) => return Err(OrmError::Stale(handle.reference().to_string())),
                Ok(_) => {}
                Err(OrmError::Constraint(violation)) => {
                    self.record_violation(handle, &violation)?;
                    failed.push(change.column.clone());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(failed)
    }

    fn level_update(
        &self,
        level: &LevelChanges,
        id: ObjectId,
        columns: &[&ColumnChange],
        now: DateTime<Utc>,
    ) -> UpdateStatement {
        let mut stmt = UpdateStatement::new(level.table.clone(), Filter::eq(ID_COLUMN, id));
        for change in columns {
            stmt = stmt.set(change.column.clone(), change.value.clone());
        }
        if level.is_root {
            stmt = stmt.set(self.config.last_modified_column.clone(), now);
        }
        stmt
    }

    async fn write_entries(
        &self,
        conn: &mut PoolGuard,
        owner: ObjectId,
        entry: &EntryChange,
        stored: bool,
    ) -> Result<()> {
        let table = entry.table.clone();
        match &entry.current {
            FieldValue::List(values) => {
                if stored {
                    conn.delete(&DeleteStatement::new(table.clone(), Filter::eq(OWNER_COLUMN, owner)))
                        .await?;
                }
                for (position, value) in values.iter().enumerate() {
                    let stmt = InsertStatement::into_table(table.clone())
                        .value(OWNER_COLUMN, owner)
                        .value(POSITION_COLUMN, position as i64)
                        .value(ELEMENT_COLUMN, value.clone());
                    conn.insert(&stmt).await?;
                }
            }
            FieldValue::Set(current) => {
                let previous = match &entry.previous {
                    Some(FieldValue::Set(previous)) => previous.clone(),
                    _ => BTreeSet::new(),
                };
                let removed: Vec<Value> = previous.difference(current).cloned().collect();
                self.delete_entries(conn, &table, owner, ELEMENT_COLUMN, &removed).await?;
                for value in current.difference(&previous) {
                    let stmt = InsertStatement::into_table(table.clone())
                        .value(OWNER_COLUMN, owner)
                        .value(ELEMENT_COLUMN, value.clone());
                    conn.insert(&stmt).await?;
                }
            }
            FieldValue::Map(current) => {
                let previous = match &entry.previous {
                    Some(FieldValue::Map(previous)) => previous.clone(),
                    _ => BTreeMap::new(),
                };
                let removed: Vec<Value> = previous
                    .keys()
                    .filter(|key| !current.contains_key(*key))
                    .cloned()
                    .collect();
                self.delete_entries(conn, &table, owner, KEY_COLUMN, &removed).await?;
                for (key, value) in current {
                    match previous.get(key) {
                        Some(old) if old == value => {}
                        Some(_) => {
                            let filter = Filter::eq(OWNER_COLUMN, owner).and(key_filter(KEY_COLUMN, key));
                            let stmt = UpdateStatement::new(table.clone(), filter).set(VALUE_COLUMN, value.clone());
                            conn.update(&stmt).await?;
                        }
                        None => {
                            let stmt = InsertStatement::into_table(table.clone())
                                .value(OWNER_COLUMN, owner)
                                .value(KEY_COLUMN, key.clone())
                                .value(VALUE_COLUMN, value.clone());
                            conn.insert(&stmt).await?;
                        }
                    }
                }
            }
            other => {
                return Err(OrmError::TypeMismatch(format!(
                    "{} is not a collection: {:?}",
                    entry.field, other
                )))
            }
        }
        Ok(())
    }

    /// Deletes the entry rows of `owner` whose `column` is in `values`.
    async fn delete_entries(
        &self,
        conn: &mut PoolGuard,
        table: &str,
        owner: ObjectId,
        column: &str,
        values: &[Value],
    ) -> Result<()> {
        let (nulls, values): (Vec<Value>, Vec<Value>) = values.iter().cloned().partition(Value::is_null);
        let owned = Filter::eq(OWNER_COLUMN, owner);
        if !nulls.is_empty() {
            let stmt = DeleteStatement::new(table, owned.clone().and(Filter::is_null(column)));
            conn.delete(&stmt).await?;
        }
        if values.is_empty() {
            return Ok(());
        }
        for chunk in Filter::in_chunks(&ColumnRef::bare(column), &values, self.config.max_in_clause) {
            conn.delete(&DeleteStatement::new(table, owned.clone().and(chunk)))
                .await?;
        }
        Ok(())
    }

    /// Restores a deferred reference once its target has a row. A failing
    /// UPDATE leaves the field null in the database and flags the field.
    async fn reattach(
        &self,
        conn: &mut PoolGuard,
        holder: &ObjectHandle,
        field: &str,
        target: &ObjectHandle,
    ) -> Result<()> {
        let target_ref = target.reference();
        holder.update(|object| object.set_reference(field, Some(target_ref)))??;

        let (declaring, descriptor) = self.registry.field(holder.class(), field)?;
        let Some(column) = descriptor.column_name() else {
            return Ok(());
        };
        let stmt = UpdateStatement::new(declaring.table.clone(), Filter::eq(ID_COLUMN, holder.id()))
            .set(column.clone(), target.id());

        match conn.update(&stmt).await {
            Ok(_) => {
                let mut record = self.store.record(holder)?.unwrap_or_default();
                record.set_column(&declaring.table, &column, Value::Integer(target.id()));
                self.store.set_record(holder, record)?;
            }
            Err(err) => {
                warn!(
                    holder = %holder.reference(),
                    field,
                    error = %err,
                    "could not re-attach deferred reference"
                );
                holder.update(|object| {
                    object
                        .validity_mut()
                        .error(field, format!("reference not stored: {}", err))
                })?;
            }
        }
        Ok(())
    }

    fn record_failure(&self, handle: &ObjectHandle, err: &OrmError) -> Result<()> {
        match err.constraint() {
            Some(violation) => self.record_violation(handle, violation),
            None => Ok(()),
        }
    }

    fn record_violation(&self, handle: &ObjectHandle, violation: &ConstraintViolation) -> Result<()> {
        let recorded = handle.update(|object| mapping::classify_violations(&self.registry, object, violation))??;
        if recorded == 0 {
            handle.update(|object| object.validity_mut().exception = Some(violation.to_string()))?;
        }
        Ok(())
    }

    fn undo_save(&self, ctx: SaveContext) -> Result<()> {
        for step in ctx.undo.into_iter().rev() {
            match step {
                SaveUndo::Stored {
                    handle,
                    was_stored,
                    previous,
                } => {
                    handle.update(|object| object.set_stored(was_stored))?;
                    match previous {
                        Some(record) => self.store.set_record(&handle, record)?,
                        None => {
                            self.store.remove_record(&handle)?;
                        }
                    }
                }
                SaveUndo::Detached {
                    holder,
                    field,
                    target,
                } => {
                    holder.update(|object| object.set_reference(&field, Some(target)))??;
                }
            }
        }
        Ok(())
    }
}

fn key_filter(column: &str, key: &Value) -> Filter {
    if key.is_null() {
        Filter::is_null(column)
    } else {
        Filter::eq(column, key.clone())
    }
}
