//! Table layouts derived from the registry, for provisioning a backend.

use super::{
    ClassDescriptor, CollectionKind, FieldDescriptor, FieldKind, SchemaRegistry, ELEMENT_COLUMN,
    ID_COLUMN, KEY_COLUMN, OWNER_COLUMN, POSITION_COLUMN, VALUE_COLUMN,
};
use crate::config::EngineConfig;
use crate::core::{ColumnMeta, DataType, Result, TableMeta};

pub const HOLDER_COLUMN: &str = "holder";
pub const ALLOCATED_AT_COLUMN: &str = "allocated_at";

pub fn shadow_table_name(purpose: &str) -> String {
    format!("{}_in_progress", purpose)
}

/// Shadow table for one allocation purpose. The primary key on `id` is
/// what makes a claim exclusive.
pub fn shadow_table(purpose: &str) -> TableMeta {
    TableMeta::new(shadow_table_name(purpose))
        .column(ColumnMeta::new(ID_COLUMN, DataType::Integer).not_null())
        .column(ColumnMeta::new(HOLDER_COLUMN, DataType::Text).not_null())
        .column(ColumnMeta::new(ALLOCATED_AT_COLUMN, DataType::Timestamp).not_null())
        .primary_key([ID_COLUMN])
}

fn field_column(field: &FieldDescriptor, registry: &SchemaRegistry) -> Result<Option<ColumnMeta>> {
    let Some(name) = field.column_name() else {
        return Ok(None);
    };
    let column = match &field.kind {
        FieldKind::Scalar(data_type) => ColumnMeta::new(name, *data_type)
            .nullable(field.nullable)
            .max_length(field.max_length),
        FieldKind::Reference { target } => ColumnMeta::new(name, DataType::Integer)
            .nullable(field.nullable)
            .references(registry.class(target)?.table.clone(), ID_COLUMN),
        _ => return Ok(None),
    };
    Ok(Some(column))
}

/// The table holding `class`'s own fields.
pub fn class_table(
    registry: &SchemaRegistry,
    class: &ClassDescriptor,
    config: &EngineConfig,
) -> Result<TableMeta> {
    let id = ColumnMeta::new(ID_COLUMN, DataType::Integer).not_null();
    let mut meta = match &class.superclass {
        None => TableMeta::new(class.table.clone())
            .column(id)
            .column(ColumnMeta::new(config.discriminator_column.as_str(), DataType::Text).not_null())
            .column(ColumnMeta::new(
                config.last_modified_column.as_str(),
                DataType::Timestamp,
            )),
        Some(parent) => TableMeta::new(class.table.clone())
            .column(id.references(registry.class(parent)?.table.clone(), ID_COLUMN)),
    }
    .primary_key([ID_COLUMN]);

    for field in &class.fields {
        if let Some(column) = field_column(field, registry)? {
            let name = column.name.clone();
            meta = meta.column(column);
            if field.unique {
                meta = meta.unique([name]);
            }
        }
    }
    Ok(meta)
}

/// Entry table of one multi-valued field.
pub fn entry_table(class: &ClassDescriptor, field: &FieldDescriptor) -> Option<TableMeta> {
    let FieldKind::MultiValued {
        collection,
        element,
        key,
    } = &field.kind
    else {
        return None;
    };

    let owner = ColumnMeta::new(OWNER_COLUMN, DataType::Integer)
        .not_null()
        .references(class.table.clone(), ID_COLUMN);
    let meta = TableMeta::new(class.entry_table(&field.name)).column(owner);

    let meta = match collection {
        CollectionKind::List => meta
            .column(ColumnMeta::new(POSITION_COLUMN, DataType::Integer).not_null())
            .column(
                ColumnMeta::new(ELEMENT_COLUMN, *element).max_length(field.max_length),
            )
            .unique([OWNER_COLUMN, POSITION_COLUMN]),
        CollectionKind::Set => meta
            .column(
                ColumnMeta::new(ELEMENT_COLUMN, *element).max_length(field.max_length),
            )
            .unique([OWNER_COLUMN, ELEMENT_COLUMN]),
        CollectionKind::Map => meta
            .column(ColumnMeta::new(KEY_COLUMN, key.unwrap_or(DataType::Text)))
            .column(ColumnMeta::new(VALUE_COLUMN, *element).max_length(field.max_length))
            .unique([OWNER_COLUMN, KEY_COLUMN]),
    };
    Some(meta)
}

/// Every class table, entry table and shadow table, parents before
/// children so foreign keys can be created in order.
pub fn tables(registry: &SchemaRegistry, config: &EngineConfig) -> Result<Vec<TableMeta>> {
    let mut classes: Vec<&ClassDescriptor> = registry.classes().collect();
    let mut depth = Vec::with_capacity(classes.len());
    for class in &classes {
        depth.push((class.name.clone(), registry.chain(&class.name)?.len()));
    }
    classes.sort_by_key(|class| {
        depth
            .iter()
            .find(|(name, _)| *name == class.name)
            .map_or(0, |(_, d)| *d)
    });

    let mut metas = Vec::new();
    for class in &classes {
        metas.push(class_table(registry, class, config)?);
    }
    for class in &classes {
        metas.extend(class.fields.iter().filter_map(|field| entry_table(class, field)));
    }
    metas.extend(registry.allocation_purposes().iter().map(|p| shadow_table(p)));
    Ok(metas)
}
