use super::Table;
use crate::connection::Backend;
use crate::core::{
    ConstraintKind, ConstraintViolation, OrmError, Result, Row, TableMeta, Value, Violation,
};
use crate::sql::{
    ColumnRef, DeleteStatement, InsertStatement, ResultSet, SelectStatement, UpdateStatement,
};
use crate::transaction::{Change, Transaction, TransactionId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// In-process relational backend.
///
/// Enforces column types, NOT NULL, column size, primary/unique keys and
/// foreign keys (RESTRICT on delete). Transactions keep an undo log and are
/// read-uncommitted: every connection sees every write immediately, and
/// uniqueness is checked against uncommitted rows too, so at most one of two
/// concurrent inserts of the same key succeeds.
pub struct MemoryDatabase {
    state: Mutex<DatabaseState>,
    latency: Option<Duration>,
}

#[derive(Default)]
struct DatabaseState {
    tables: HashMap<String, Table>,
    transactions: HashMap<TransactionId, Transaction>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DatabaseState::default()),
            latency: None,
        }
    }

    /// Delays every statement; lets tests exercise the statement timers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn create_table(&self, meta: TableMeta) -> Result<()> {
        let mut state = self.lock()?;
        if state.tables.contains_key(&meta.name) {
            return Err(OrmError::Execution(format!("Table '{}' already exists", meta.name)));
        }
        let table = Table::new(meta)?;
        state.tables.insert(table.name().to_string(), table);
        Ok(())
    }

    /// Creates every table that does not exist yet.
    pub fn install(&self, tables: impl IntoIterator<Item = TableMeta>) -> Result<()> {
        let mut state = self.lock()?;
        for meta in tables {
            if !state.tables.contains_key(&meta.name) {
                let table = Table::new(meta)?;
                state.tables.insert(table.name().to_string(), table);
            }
        }
        Ok(())
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.lock()?.table(table)?.row_count())
    }

    pub fn open_transactions(&self) -> Result<usize> {
        Ok(self.lock()?.transactions.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, DatabaseState>> {
        Ok(self.state.lock()?)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn check_deadline(deadline: Instant, stmt: &dyn Display) -> Result<()> {
    let now = Instant::now();
    if now > deadline {
        return Err(OrmError::Timeout {
            statement: stmt.to_string(),
            elapsed: now.duration_since(deadline),
        });
    }
    Ok(())
}

fn generated_key(meta: &TableMeta, row: &Row) -> Option<i64> {
    match meta.primary_key.as_slice() {
        [single] => meta
            .find_column_index(single)
            .and_then(|idx| row[idx].as_i64()),
        _ => None,
    }
}

fn lookup(parts: &[(&Table, &Row)], col: &ColumnRef) -> Result<Value> {
    match &col.table {
        Some(name) => {
            let (table, row) = parts
                .iter()
                .find(|(table, _)| table.name() == name)
                .ok_or_else(|| OrmError::ColumnNotFound(col.column.clone(), name.clone()))?;
            table.value_of(row, &col.column)
        }
        None => {
            let mut hit = None;
            for (table, row) in parts {
                if let Some(idx) = table.meta().find_column_index(&col.column) {
                    if hit.is_some() {
                        return Err(OrmError::Execution(format!(
                            "Column reference '{}' is ambiguous",
                            col.column
                        )));
                    }
                    hit = Some(row[idx].clone());
                }
            }
            hit.ok_or_else(|| OrmError::ColumnNotFound(col.column.clone(), "<select>".into()))
        }
    }
}

impl DatabaseState {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| OrmError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| OrmError::TableNotFound(name.to_string()))
    }

    fn record(&mut self, tx: Option<TransactionId>, change: Change) -> Result<()> {
        if let Some(tx) = tx {
            let txn = self
                .transactions
                .get_mut(&tx)
                .ok_or_else(|| OrmError::Execution(format!("Transaction {} not found", tx)))?;
            txn.record_change(change);
        }
        Ok(())
    }

    /// Foreign keys held by `row` must point at existing rows.
    fn outgoing_violations(&self, meta: &TableMeta, row: &Row) -> Result<Vec<Violation>> {
        let mut violations = Vec::new();
        for (column, value) in meta.columns.iter().zip(row.iter()) {
            let Some(fk) = &column.references else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !self.table(&fk.table)?.contains_value(&fk.column, value, &[])? {
                violations.push(Violation {
                    kind: ConstraintKind::ForeignKey,
                    column: column.name.clone(),
                    detail: format!(
                        "references non-existent key {} in {}.{}",
                        value, fk.table, fk.column
                    ),
                });
            }
        }
        Ok(violations)
    }

    /// Rows elsewhere that still reference `row` (restrict semantics).
    /// `only` limits the check to some referenced columns; `excluded` are row
    /// ids of `meta`'s own table that disappear in the same statement.
    fn incoming_violations(
        &self,
        meta: &TableMeta,
        row: &Row,
        only: Option<&[usize]>,
        excluded: &[usize],
    ) -> Result<Vec<Violation>> {
        let mut violations = Vec::new();
        for (other_name, other) in &self.tables {
            for column in &other.meta().columns {
                let Some(fk) = &column.references else {
                    continue;
                };
                if fk.table != meta.name {
                    continue;
                }
                let Some(idx) = meta.find_column_index(&fk.column) else {
                    continue;
                };
                if only.is_some_and(|cols| !cols.contains(&idx)) {
                    continue;
                }
                let value = &row[idx];
                if value.is_null() {
                    continue;
                }
                let except: &[usize] = if *other_name == meta.name { excluded } else { &[] };
                if other.contains_value(&column.name, value, except)? {
                    violations.push(Violation {
                        kind: ConstraintKind::ForeignKey,
                        column: fk.column.clone(),
                        detail: format!(
                            "violates foreign key constraint: key {} is still referenced from {}.{}",
                            value, other_name, column.name
                        ),
                    });
                }
            }
        }
        Ok(violations)
    }

    fn undo(&mut self, changes: Vec<Change>) -> Result<()> {
        for change in changes {
            let table = self.table_mut(change.table_name())?;
            match change {
                Change::InsertRow { row_id, .. } => {
                    table.remove(row_id);
                }
                Change::UpdateRow { row_id, old_row, .. } => {
                    table.replace(row_id, old_row);
                }
                Change::DeleteRow { row_id, old_row, .. } => {
                    table.restore(row_id, old_row);
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self, tx: TransactionId) -> Result<()> {
        let txn = self
            .transactions
            .remove(&tx)
            .ok_or_else(|| OrmError::Execution(format!("Transaction {} not found", tx)))?;
        let undo = txn.rollback();
        debug!(transaction = %tx, changes = undo.len(), "rolling back");
        self.undo(undo)
    }
}

#[async_trait]
impl Backend for MemoryDatabase {
    async fn begin(&self) -> Result<TransactionId> {
        let id = TransactionId::new();
        self.lock()?.transactions.insert(id, Transaction::new(id));
        Ok(id)
    }

    async fn commit(&self, tx: TransactionId) -> Result<()> {
        let mut state = self.lock()?;
        let txn = state
            .transactions
            .remove(&tx)
            .ok_or_else(|| OrmError::Execution(format!("Transaction {} not found", tx)))?;
        debug!(transaction = %tx, changes = txn.commit(), "committed");
        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<()> {
        self.lock()?.rollback(tx)
    }

    fn abandon(&self, tx: TransactionId) {
        match self.state.lock() {
            Ok(mut state) => {
                if let Err(err) = state.rollback(tx) {
                    warn!(transaction = %tx, error = %err, "failed to abandon transaction");
                }
            }
            Err(err) => warn!(transaction = %tx, error = %err, "database lock poisoned"),
        }
    }

    async fn select(
        &self,
        _tx: Option<TransactionId>,
        stmt: &SelectStatement,
        deadline: Instant,
    ) -> Result<ResultSet> {
        self.simulate_latency().await;
        let state = self.lock()?;
        check_deadline(deadline, stmt)?;

        let base = state.table(&stmt.from)?;
        let mut joined: Vec<Vec<(&Table, &Row)>> =
            base.rows().map(|(_, row)| vec![(base, row)]).collect();

        for join in &stmt.joins {
            let right = state.table(&join.table)?;
            let mut next = Vec::new();
            for parts in joined {
                for (_, row) in right.rows() {
                    let mut candidate = parts.clone();
                    candidate.push((right, row));
                    let left_value = lookup(&candidate, &join.left)?;
                    let right_value = lookup(&candidate, &join.right)?;
                    if !left_value.is_null() && left_value == right_value {
                        next.push(candidate);
                    }
                }
            }
            joined = next;
        }

        let mut kept = Vec::with_capacity(joined.len());
        for parts in joined {
            let keep = match &stmt.filter {
                Some(filter) => filter.evaluate(&|col: &ColumnRef| lookup(&parts, col))? == Some(true),
                None => true,
            };
            if keep {
                kept.push(parts);
            }
        }

        if !stmt.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(kept.len());
            for parts in kept {
                let key = stmt
                    .order_by
                    .iter()
                    .map(|o| lookup(&parts, &o.column))
                    .collect::<Result<Vec<_>>>()?;
                keyed.push((key, parts));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for ((left, right), order) in a.iter().zip(b.iter()).zip(stmt.order_by.iter()) {
                    let ordering = left.cmp(right);
                    if ordering != std::cmp::Ordering::Equal {
                        return if order.descending { ordering.reverse() } else { ordering };
                    }
                }
                std::cmp::Ordering::Equal
            });
            kept = keyed.into_iter().map(|(_, parts)| parts).collect();
        }

        if let Some(limit) = stmt.limit {
            kept.truncate(limit);
        }

        let columns: Vec<ColumnRef> = if stmt.columns.is_empty() {
            std::iter::once(base)
                .chain(stmt.joins.iter().filter_map(|j| state.tables.get(&j.table)))
                .flat_map(|table| {
                    table
                        .meta()
                        .columns
                        .iter()
                        .map(move |c| ColumnRef::qualified(table.name(), c.name.clone()))
                })
                .collect()
        } else {
            stmt.columns.clone()
        };

        let mut rows = Vec::with_capacity(kept.len());
        for parts in &kept {
            let row = columns
                .iter()
                .map(|col| lookup(parts, col))
                .collect::<Result<Row>>()?;
            rows.push(row);
        }

        Ok(ResultSet::new(columns, rows))
    }

    async fn insert(
        &self,
        tx: Option<TransactionId>,
        stmt: &InsertStatement,
        deadline: Instant,
    ) -> Result<Option<i64>> {
        self.simulate_latency().await;
        let mut state = self.lock()?;
        check_deadline(deadline, stmt)?;

        let (row, violations) = {
            let table = state.table(&stmt.table)?;
            let row = table.build_row(&stmt.values)?;
            let mut violations = table.check_row(&row, None)?;
            violations.extend(state.outgoing_violations(table.meta(), &row)?);
            (row, violations)
        };
        if !violations.is_empty() {
            return Err(OrmError::Constraint(ConstraintViolation {
                table: stmt.table.clone(),
                violations,
            }));
        }

        let table = state.table_mut(&stmt.table)?;
        let key = generated_key(table.meta(), &row);
        let row_id = table.insert(row);
        state.record(
            tx,
            Change::InsertRow {
                table: stmt.table.clone(),
                row_id,
            },
        )?;
        Ok(key)
    }

    async fn update(
        &self,
        tx: Option<TransactionId>,
        stmt: &UpdateStatement,
        deadline: Instant,
    ) -> Result<u64> {
        self.simulate_latency().await;
        let mut state = self.lock()?;
        check_deadline(deadline, stmt)?;

        let mut planned = Vec::new();
        {
            let table = state.table(&stmt.table)?;
            let meta = table.meta();
            for (row_id, old_row) in table.matching(&stmt.filter)? {
                let mut new_row = old_row.clone();
                for (column, value) in &stmt.assignments {
                    let idx = meta.find_column_index(column).ok_or_else(|| {
                        OrmError::ColumnNotFound(column.clone(), stmt.table.clone())
                    })?;
                    new_row[idx] = value.clone();
                }

                let mut violations = table.check_row(&new_row, Some(row_id))?;
                violations.extend(state.outgoing_violations(meta, &new_row)?);
                let changed: Vec<usize> = (0..new_row.len())
                    .filter(|idx| old_row[*idx] != new_row[*idx])
                    .collect();
                if !changed.is_empty() {
                    violations.extend(state.incoming_violations(
                        meta,
                        &old_row,
                        Some(&changed),
                        &[],
                    )?);
                }
                if !violations.is_empty() {
                    return Err(OrmError::Constraint(ConstraintViolation {
                        table: stmt.table.clone(),
                        violations,
                    }));
                }
                planned.push((row_id, old_row, new_row));
            }
        }

        let count = planned.len() as u64;
        for (row_id, old_row, new_row) in planned {
            state.table_mut(&stmt.table)?.replace(row_id, new_row);
            state.record(
                tx,
                Change::UpdateRow {
                    table: stmt.table.clone(),
                    row_id,
                    old_row,
                },
            )?;
        }
        Ok(count)
    }

    async fn delete(
        &self,
        tx: Option<TransactionId>,
        stmt: &DeleteStatement,
        deadline: Instant,
    ) -> Result<u64> {
        self.simulate_latency().await;
        let mut state = self.lock()?;
        check_deadline(deadline, stmt)?;

        let targets = state.table(&stmt.table)?.matching(&stmt.filter)?;
        let ids: Vec<usize> = targets.iter().map(|(id, _)| *id).collect();
        {
            let meta = state.table(&stmt.table)?.meta();
            let mut violations = Vec::new();
            for (_, row) in &targets {
                violations.extend(state.incoming_violations(meta, row, None, &ids)?);
            }
            if !violations.is_empty() {
                return Err(OrmError::Constraint(ConstraintViolation {
                    table: stmt.table.clone(),
                    violations,
                }));
            }
        }

        let count = targets.len() as u64;
        for (row_id, old_row) in targets {
            state.table_mut(&stmt.table)?.remove(row_id);
            state.record(
                tx,
                Change::DeleteRow {
                    table: stmt.table.clone(),
                    row_id,
                    old_row,
                },
            )?;
        }
        Ok(count)
    }

    async fn table_metadata(&self, name: &str) -> Result<TableMeta> {
        Ok(self.lock()?.table(name)?.meta().clone())
    }
}
