//! Load Engine: joined SELECTs over the class chain, polymorphic
//! redirection, multi-valued entries and reference resolution.

use super::PersistenceEngine;
use crate::connection::PoolGuard;
use crate::core::{OrmError, Result, Value};
use crate::object::{FieldValue, ObjectHandle, ObjectId, ObjectRecord};
use crate::schema::{
    CollectionKind, ClassDescriptor, FieldDescriptor, FieldKind, ELEMENT_COLUMN, ID_COLUMN,
    KEY_COLUMN, OWNER_COLUMN, POSITION_COLUMN, VALUE_COLUMN,
};
use crate::sql::{ColumnRef, Filter, ResultSet, SelectStatement};
use crate::store::{ObjectKey, UnresolvedReference};
use async_recursion::async_recursion;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Default)]
struct LoadContext {
    /// Keys already loaded (or found missing) during this load
    attempted: HashSet<ObjectKey>,
    /// References produced by the latest pass, not yet looked at
    fresh: Vec<UnresolvedReference>,
    /// References waiting for the final attach pass
    waiting: Vec<UnresolvedReference>,
}

impl PersistenceEngine {
    /// Loads objects of `class` (subclass instances included) matching
    /// `filter`, ordered by id.
    ///
    /// Objects already in the store are updated in place; references are
    /// resolved by loading their targets on demand.
    pub async fn load(
        &self,
        class: &str,
        filter: Option<Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<ObjectHandle>> {
        self.registry.class(class)?;
        let mut conn = self.pool.acquire(true).await?;
        let mut ctx = LoadContext::default();

        let loaded = self
            .load_pass(&mut conn, class, filter, limit, &mut ctx, false)
            .await?;
        self.resolve_references(&mut conn, &mut ctx).await?;
        conn.close().await?;

        debug!(class, count = loaded.len(), "loaded");
        Ok(loaded)
    }

    /// Loads the objects of `class` inside the data horizon.
    pub async fn load_visible(&self, class: &str) -> Result<Vec<ObjectHandle>> {
        let filter = self.horizon.visible(self.registry.class(class)?);
        self.load(class, filter, None).await
    }

    /// Eagerly loads every class family the data horizon marks eager.
    pub async fn load_initial(&self) -> Result<Vec<ObjectHandle>> {
        let roots: Vec<String> = self
            .registry
            .classes()
            .filter(|class| class.is_root() && self.horizon.eager(class))
            .map(|class| class.name.clone())
            .collect();

        let mut loaded = Vec::new();
        for root in roots {
            loaded.extend(self.load_visible(&root).await?);
        }
        Ok(loaded)
    }

    /// Re-reads `handle` from the database, discarding local changes.
    /// Returns `false` (and unregisters the object) if its row is gone.
    pub async fn reload(&self, handle: &ObjectHandle) -> Result<bool> {
        let _guard = handle.op_lock().lock().await;
        if !self.store.is_registered(handle)? {
            self.store.register(handle, None)?;
        }

        let leaf = self.registry.class(handle.class())?.table.clone();
        let filter = Filter::eq(ColumnRef::qualified(leaf, ID_COLUMN), handle.id());
        let mut conn = self.pool.acquire(true).await?;
        let mut ctx = LoadContext::default();

        let found = self
            .load_pass(&mut conn, handle.class(), Some(filter), None, &mut ctx, true)
            .await?;
        if found.is_empty() {
            conn.close().await?;
            self.store.unregister(handle)?;
            handle.update(|object| object.set_stored(false))?;
            debug!(object = %handle.reference(), "row gone on reload");
            return Ok(false);
        }

        self.resolve_references(&mut conn, &mut ctx).await?;
        conn.close().await?;
        Ok(true)
    }

    /// SELECT over the leaf table joined with every ancestor table.
    fn chain_select(&self, chain: &[&ClassDescriptor]) -> Result<SelectStatement> {
        let (Some(root), Some(leaf)) = (chain.first(), chain.last()) else {
            return Err(OrmError::Execution("empty class chain".into()));
        };

        let mut stmt = SelectStatement::from(leaf.table.clone())
            .column(ColumnRef::qualified(leaf.table.clone(), ID_COLUMN))
            .column(ColumnRef::qualified(
                root.table.clone(),
                self.config.discriminator_column.clone(),
            ));
        for level in chain {
            if level.name != leaf.name {
                stmt = stmt.join(
                    level.table.clone(),
                    ColumnRef::qualified(level.table.clone(), ID_COLUMN),
                    ColumnRef::qualified(leaf.table.clone(), ID_COLUMN),
                );
            }
            for field in &level.fields {
                if let Some(column) = field.column_name() {
                    stmt = stmt.column(ColumnRef::qualified(level.table.clone(), column));
                }
            }
        }
        Ok(stmt.order_by(ColumnRef::qualified(leaf.table.clone(), ID_COLUMN), false))
    }

    #[async_recursion]
    async fn load_pass(
        &self,
        conn: &mut PoolGuard,
        class: &str,
        filter: Option<Filter>,
        limit: Option<usize>,
        ctx: &mut LoadContext,
        clean: bool,
    ) -> Result<Vec<ObjectHandle>> {
        let chain = self.registry.chain(class)?;
        let stmt = self.chain_select(&chain)?.filter_opt(filter).limit(limit);
        let result = conn.select(&stmt).await?;

        let root_table = chain[0].table.clone();
        let leaf_table = chain[chain.len() - 1].table.clone();

        let mut order = Vec::with_capacity(result.row_count());
        let mut own: Vec<(ObjectId, ObjectRecord)> = Vec::new();
        let mut redirected: BTreeMap<String, Vec<ObjectId>> = BTreeMap::new();
        for row in &result.rows {
            let id = result
                .value(row, &leaf_table, ID_COLUMN)?
                .as_i64()
                .ok_or_else(|| OrmError::TypeMismatch(format!("non-integer id in {}", leaf_table)))?;
            let concrete = match result.value(row, &root_table, &self.config.discriminator_column)? {
                Value::Text(name) => name.clone(),
                other => {
                    return Err(OrmError::TypeMismatch(format!(
                        "discriminator of {}#{} is {}",
                        class,
                        id,
                        other.type_name()
                    )))
                }
            };
            order.push(id);

            if concrete == class {
                let mut record = ObjectRecord::new();
                for level in &chain {
                    for field in &level.fields {
                        if let Some(column) = field.column_name() {
                            let value = result.value(row, &level.table, &column)?;
                            record.set_column(&level.table, &column, value.clone());
                        }
                    }
                }
                own.push((id, record));
            } else if self.registry.is_subclass_of(&concrete, class) {
                redirected.entry(concrete).or_default().push(id);
            } else {
                return Err(OrmError::Execution(format!(
                    "row {}#{} is stored as '{}', which is not a {}",
                    class, id, concrete, class
                )));
            }
        }

        let ids: Vec<Value> = own.iter().map(|(id, _)| Value::Integer(*id)).collect();
        let mut entries = self.fetch_entries(conn, class, &ids).await?;
        for (id, record) in &mut own {
            let id = *id;
            for (field, by_owner) in entries.iter_mut() {
                if let Some(value) = by_owner.remove(&id) {
                    record.set_entries(field, value);
                }
            }
        }

        let mut loaded: HashMap<ObjectId, ObjectHandle> = HashMap::new();
        for (subclass, sub_ids) in redirected {
            debug!(class, subclass = %subclass, count = sub_ids.len(), "redirecting to subclass");
            let sub_leaf = self.registry.class(&subclass)?.table.clone();
            let values: Vec<Value> = sub_ids.into_iter().map(Value::Integer).collect();
            let column = ColumnRef::qualified(sub_leaf, ID_COLUMN);
            for chunk in Filter::in_chunks(&column, &values, self.config.max_in_clause) {
                for handle in self
                    .load_pass(conn, &subclass, Some(chunk), None, ctx, clean)
                    .await?
                {
                    loaded.insert(handle.id(), handle);
                }
            }
        }

        for (id, record) in own {
            let handle = self.materialize(class, id, record, ctx, clean)?;
            loaded.insert(id, handle);
        }

        Ok(order.into_iter().filter_map(|id| loaded.remove(&id)).collect())
    }

    /// Entry rows of every multi-valued field of `class`, per field and owner.
    /// Owners without rows get an empty collection.
    async fn fetch_entries(
        &self,
        conn: &mut PoolGuard,
        class: &str,
        owners: &[Value],
    ) -> Result<HashMap<String, HashMap<ObjectId, FieldValue>>> {
        let mut fetched = HashMap::new();
        if owners.is_empty() {
            return Ok(fetched);
        }

        for (declaring, field) in self.registry.fields(class)? {
            let Some(collection) = field.collection() else {
                continue;
            };
            let table = declaring.entry_table(&field.name);
            let owner_column = ColumnRef::qualified(table.clone(), OWNER_COLUMN);

            let mut by_owner: HashMap<ObjectId, FieldValue> = HashMap::new();
            for owner in owners.iter().filter_map(Value::as_i64) {
                if let Some(empty) = FieldValue::default_for(&field.kind) {
                    by_owner.insert(owner, empty);
                }
            }

            for chunk in Filter::in_chunks(&owner_column, owners, self.config.max_in_clause) {
                let mut stmt = SelectStatement::from(table.clone())
                    .filter(chunk)
                    .order_by(owner_column.clone(), false);
                if collection == CollectionKind::List {
                    stmt = stmt.order_by(ColumnRef::qualified(table.clone(), POSITION_COLUMN), false);
                }
                let result = conn.select(&stmt).await?;
                collect_entries(&result, &table, collection, &mut by_owner)?;
            }
            fetched.insert(field.name.clone(), by_owner);
        }
        Ok(fetched)
    }

    /// Turns one fetched row into a registered object, updating the live
    /// object if one is already registered.
    fn materialize(
        &self,
        class: &str,
        id: ObjectId,
        record: ObjectRecord,
        ctx: &mut LoadContext,
        clean: bool,
    ) -> Result<ObjectHandle> {
        ctx.attempted.insert(self.store.key(class, id)?);

        let existing = match self.store.lookup(class, id)? {
            Some(handle) => handle,
            None => {
                let handle = ObjectHandle::new(self.registry.instantiate(class, id)?);
                self.apply_row(&handle, &record, None, ctx, true)?;
                handle.update(|object| object.set_stored(true))?;
                let registered = self.store.register_loaded(&handle, record.clone())?;
                if registered.ptr_eq(&handle) {
                    return Ok(handle);
                }
                registered
            }
        };

        if existing.class() != class {
            return Err(OrmError::Execution(format!(
                "{} is registered but stored as {}",
                existing.reference(),
                class
            )));
        }
        let previous = self.store.record(&existing)?;
        self.apply_row(&existing, &record, previous.as_ref(), ctx, clean)?;
        existing.update(|object| object.set_stored(true))?;
        self.store.set_record(&existing, record)?;
        Ok(existing)
    }

    /// Pushes database values into the object. Unless `clean`, only fields
    /// whose database value moved since `previous` are touched, and a local
    /// change overwritten that way is logged and flagged.
    fn apply_row(
        &self,
        handle: &ObjectHandle,
        record: &ObjectRecord,
        previous: Option<&ObjectRecord>,
        ctx: &mut LoadContext,
        clean: bool,
    ) -> Result<()> {
        let fields = self.registry.fields(handle.class())?;
        let mut object = handle.write()?;
        if clean {
            object.validity_mut().clear();
        }

        for (declaring, field) in fields {
            let (incoming, changed_locally, differs) = if let Some(column) = field.column_name() {
                let value = record
                    .column(&declaring.table, &column)
                    .cloned()
                    .unwrap_or(Value::Null);
                let before = previous.and_then(|p| p.column(&declaring.table, &column));
                if !clean && before == Some(&value) {
                    continue;
                }
                let live = object.get(&field.name).and_then(FieldValue::column_value);
                let changed_locally = before.is_some() && live.as_ref() != before;
                let differs = live.as_ref() != Some(&value);
                let incoming = self.field_value(handle, field, value, ctx)?;
                (incoming, changed_locally, differs)
            } else if field.collection().is_some() {
                let value = record
                    .entries(&field.name)
                    .cloned()
                    .or_else(|| FieldValue::default_for(&field.kind))
                    .ok_or_else(|| OrmError::TypeMismatch(format!("{} has no default", field.name)))?;
                let before = previous.and_then(|p| p.entries(&field.name));
                if !clean && before == Some(&value) {
                    continue;
                }
                let live = object.get(&field.name);
                let changed_locally = before.is_some() && live != before;
                let differs = live != Some(&value);
                (value, changed_locally, differs)
            } else {
                continue;
            };

            if !clean && changed_locally && differs {
                warn!(
                    object = %handle.reference(),
                    field = %field.name,
                    "local change overwritten by database value"
                );
                object.validity_mut().warn(
                    field.name.clone(),
                    "local change discarded: the database value changed",
                );
            }
            object.set(&field.name, incoming)?;
        }
        Ok(())
    }

    /// Converts a column value to a field value, resolving references
    /// against the store.
    fn field_value(
        &self,
        holder: &ObjectHandle,
        field: &FieldDescriptor,
        value: Value,
        ctx: &mut LoadContext,
    ) -> Result<FieldValue> {
        let FieldKind::Reference { target } = &field.kind else {
            return Ok(FieldValue::Scalar(value));
        };
        let target_id = match value {
            Value::Null => return Ok(FieldValue::Reference(None)),
            Value::Integer(id) => id,
            other => {
                return Err(OrmError::TypeMismatch(format!(
                    "{}.{} holds {}",
                    holder.reference(),
                    field.name,
                    other.type_name()
                )))
            }
        };

        match self.store.lookup(target, target_id)? {
            Some(found) => Ok(FieldValue::Reference(Some(found.reference()))),
            None => {
                ctx.fresh.push(UnresolvedReference {
                    holder: holder.clone(),
                    field: field.name.clone(),
                    target_class: target.clone(),
                    target_id,
                });
                Ok(FieldValue::Reference(None))
            }
        }
    }

    /// Loads missing reference targets until no new ones turn up, then
    /// attaches what was found. Targets absent from the database stay
    /// tracked as unresolved.
    async fn resolve_references(&self, conn: &mut PoolGuard, ctx: &mut LoadContext) -> Result<()> {
        loop {
            let fresh = std::mem::take(&mut ctx.fresh);
            if fresh.is_empty() {
                break;
            }

            let mut missing: BTreeMap<String, BTreeSet<ObjectId>> = BTreeMap::new();
            for reference in &fresh {
                if self
                    .store
                    .lookup(&reference.target_class, reference.target_id)?
                    .is_some()
                {
                    continue;
                }
                let key = self.store.key(&reference.target_class, reference.target_id)?;
                if ctx.attempted.insert(key) {
                    missing
                        .entry(reference.target_class.clone())
                        .or_default()
                        .insert(reference.target_id);
                }
            }
            ctx.waiting.extend(fresh);

            for (declared, ids) in missing {
                for (concrete, ids) in self.concrete_classes(conn, &declared, &ids).await? {
                    let leaf = self.registry.class(&concrete)?.table.clone();
                    let column = ColumnRef::qualified(leaf, ID_COLUMN);
                    let values: Vec<Value> = ids.into_iter().map(Value::Integer).collect();
                    for chunk in Filter::in_chunks(&column, &values, self.config.max_in_clause) {
                        self.load_pass(conn, &concrete, Some(chunk), None, ctx, false)
                            .await?;
                    }
                }
            }
        }

        for reference in std::mem::take(&mut ctx.waiting) {
            match self
                .store
                .lookup(&reference.target_class, reference.target_id)?
            {
                Some(target) => {
                    let target = target.reference();
                    reference.holder.update(|object| {
                        if object.reference_to(&reference.field).is_none() {
                            object.set_reference(&reference.field, Some(target))
                        } else {
                            Ok(())
                        }
                    })??;
                }
                None => {
                    warn!(
                        holder = %reference.holder.reference(),
                        field = %reference.field,
                        target = %reference.target_class,
                        target_id = reference.target_id,
                        "reference target not found"
                    );
                    self.store.track_unresolved(reference)?;
                }
            }
        }
        Ok(())
    }

    /// Groups `ids` of `declared` by the concrete class stored in the
    /// family's discriminator column. Ids without a row are left out.
    async fn concrete_classes(
        &self,
        conn: &mut PoolGuard,
        declared: &str,
        ids: &BTreeSet<ObjectId>,
    ) -> Result<BTreeMap<String, Vec<ObjectId>>> {
        let mut by_class: BTreeMap<String, Vec<ObjectId>> = BTreeMap::new();
        if !self.registry.has_subclasses(declared) {
            by_class.insert(declared.to_string(), ids.iter().copied().collect());
            return Ok(by_class);
        }

        let root = self.registry.root_of(declared)?.table.clone();
        let id_column = ColumnRef::qualified(root.clone(), ID_COLUMN);
        let discriminator = ColumnRef::qualified(root.clone(), self.config.discriminator_column.clone());
        let values: Vec<Value> = ids.iter().copied().map(Value::Integer).collect();
        for chunk in Filter::in_chunks(&id_column, &values, self.config.max_in_clause) {
            let stmt = SelectStatement::from(root.clone())
                .column(id_column.clone())
                .column(discriminator.clone())
                .filter(chunk);
            let result = conn.select(&stmt).await?;
            for row in &result.rows {
                let id = result.value(row, &root, ID_COLUMN)?.as_i64();
                let class = result
                    .value(row, &root, &self.config.discriminator_column)?
                    .as_str()
                    .map(str::to_string);
                if let (Some(id), Some(class)) = (id, class) {
                    by_class.entry(class).or_default().push(id);
                }
            }
        }
        Ok(by_class)
    }
}

fn collect_entries(
    result: &ResultSet,
    table: &str,
    collection: CollectionKind,
    by_owner: &mut HashMap<ObjectId, FieldValue>,
) -> Result<()> {
    for row in &result.rows {
        let Some(owner) = result.value(row, table, OWNER_COLUMN)?.as_i64() else {
            continue;
        };
        let Some(slot) = by_owner.get_mut(&owner) else {
            continue;
        };
        match (collection, slot) {
            (CollectionKind::List, FieldValue::List(values)) => {
                values.push(result.value(row, table, ELEMENT_COLUMN)?.clone());
            }
            (CollectionKind::Set, FieldValue::Set(values)) => {
                values.insert(result.value(row, table, ELEMENT_COLUMN)?.clone());
            }
            (CollectionKind::Map, FieldValue::Map(entries)) => {
                entries.insert(
                    result.value(row, table, KEY_COLUMN)?.clone(),
                    result.value(row, table, VALUE_COLUMN)?.clone(),
                );
            }
            _ => {
                return Err(OrmError::TypeMismatch(format!(
                    "entry table {} does not match its field",
                    table
                )))
            }
        }
    }
    Ok(())
}
