//! Field ↔ column mapping, object records and field-change maps.

use crate::core::{ConstraintViolation, Result, Value};
use crate::object::{DomainObject, FieldValue, ObjectRecord};
use crate::schema::{CollectionKind, FieldDescriptor, SchemaRegistry};

#[derive(Debug, Clone)]
pub struct ColumnChange {
    pub field: String,
    pub column: String,
    pub value: Value,
}

/// Changed columns of one level of the inheritance chain.
#[derive(Debug, Clone)]
pub struct LevelChanges {
    pub class: String,
    pub table: String,
    pub is_root: bool,
    pub columns: Vec<ColumnChange>,
}

#[derive(Debug, Clone)]
pub struct EntryChange {
    pub field: String,
    pub table: String,
    pub collection: CollectionKind,
    pub previous: Option<FieldValue>,
    pub current: FieldValue,
}

/// Field-change map of one object, grouped per class level, root first.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub levels: Vec<LevelChanges>,
    pub entries: Vec<EntryChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|level| level.columns.is_empty()) && self.entries.is_empty()
    }

    pub fn root_changed(&self) -> bool {
        self.levels
            .iter()
            .any(|level| level.is_root && !level.columns.is_empty())
    }
}

/// The record an object would have if its current fields were persisted.
pub fn record_of(registry: &SchemaRegistry, object: &DomainObject) -> Result<ObjectRecord> {
    let mut record = ObjectRecord::new();
    for (class, field) in registry.fields(object.class())? {
        let Some(value) = object.get(&field.name) else {
            continue;
        };
        if let Some(column) = field.column_name() {
            if let Some(column_value) = value.column_value() {
                record.set_column(&class.table, &column, column_value);
            }
        } else if field.collection().is_some() {
            record.set_entries(&field.name, value.clone());
        }
    }
    Ok(record)
}

/// Diffs `object` against its record. Without a record (never stored)
/// every persistent column counts as changed.
pub fn changes(
    registry: &SchemaRegistry,
    object: &DomainObject,
    record: Option<&ObjectRecord>,
) -> Result<ChangeSet> {
    let mut set = ChangeSet::default();
    for class in registry.chain(object.class())? {
        let mut level = LevelChanges {
            class: class.name.clone(),
            table: class.table.clone(),
            is_root: class.is_root(),
            columns: Vec::new(),
        };
        for field in &class.fields {
            let Some(value) = object.get(&field.name) else {
                continue;
            };
            if let Some(column) = field.column_name() {
                let Some(current) = value.column_value() else {
                    continue;
                };
                let previous = record.and_then(|r| r.column(&class.table, &column));
                if previous != Some(&current) {
                    level.columns.push(ColumnChange {
                        field: field.name.clone(),
                        column,
                        value: current,
                    });
                }
            } else if let Some(collection) = field.collection() {
                let previous = record.and_then(|r| r.entries(&field.name)).cloned();
                let unchanged = match &previous {
                    Some(previous) => previous == value,
                    None => is_empty_collection(value),
                };
                if !unchanged {
                    set.entries.push(EntryChange {
                        field: field.name.clone(),
                        table: class.entry_table(&field.name),
                        collection,
                        previous,
                        current: value.clone(),
                    });
                }
            }
        }
        set.levels.push(level);
    }
    Ok(set)
}

fn is_empty_collection(value: &FieldValue) -> bool {
    match value {
        FieldValue::List(values) => values.is_empty(),
        FieldValue::Set(values) => values.is_empty(),
        FieldValue::Map(entries) => entries.is_empty(),
        _ => false,
    }
}

/// Field behind `column` of `table` within the chain of `class`.
/// Entry-table columns map to their multi-valued field.
pub fn field_for_column<'a>(
    registry: &'a SchemaRegistry,
    class: &str,
    table: &str,
    column: &str,
) -> Result<Option<&'a FieldDescriptor>> {
    for (declaring, field) in registry.fields(class)? {
        if declaring.table == table && field.column_name().as_deref() == Some(column) {
            return Ok(Some(field));
        }
        if field.collection().is_some() && declaring.entry_table(&field.name) == table {
            return Ok(Some(field));
        }
    }
    Ok(None)
}

/// Turns a constraint failure into field errors on `object`, in ascending
/// order of severity so the most specific kind wins on each field.
pub fn classify_violations(
    registry: &SchemaRegistry,
    object: &mut DomainObject,
    violation: &ConstraintViolation,
) -> Result<usize> {
    let mut ordered = violation.violations.clone();
    ordered.sort_by_key(|v| v.kind);

    let class = object.class().to_string();
    let mut recorded = 0;
    for item in ordered {
        for column in item.column.split(',') {
            if let Some(field) = field_for_column(registry, &class, &violation.table, column)? {
                object
                    .validity_mut()
                    .error(field.name.clone(), format!("{}: {}", item.kind, item.detail));
                recorded += 1;
            }
        }
    }
    Ok(recorded)
}
