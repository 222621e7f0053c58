// ABOUTME: In-memory store implementing both source and target traits
// ABOUTME: Backs the test suites; supports injected write failures per connection

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{SourceStore, StoreConnector, TargetStore};
use crate::error::{Result, SyncError};
use crate::row::{ColumnIndex, Row, RowBatch, SqlValue};
use crate::schema::{TableRef, TableSchema};
use crate::sync::merge::MergePlan;

/// Whether an injected failure looks like a connection drop or a
/// permanent data error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Permanent,
}

/// Fail the `on_write`-th write (1-based) of every connection, up to
/// `times` occurrences in total (`None` = forever).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPlan {
    pub on_write: usize,
    pub kind: FaultKind,
    pub times: Option<usize>,
}

struct MemTable {
    schema: TableSchema,
    index: Arc<ColumnIndex>,
    rows: Vec<Row>,
}

impl MemTable {
    fn new(schema: TableSchema) -> Self {
        let index = Arc::new(ColumnIndex::new(schema.column_names()));
        Self {
            schema,
            index,
            rows: Vec::new(),
        }
    }

    /// Rows of keyed tables are kept in key order, so lookups on the
    /// primary key are a binary search. `Err` carries the insert position.
    fn locate(
        &self,
        key_columns: &[String],
        key: &[SqlValue],
    ) -> std::result::Result<usize, usize> {
        if key_columns == self.schema.primary_key.as_slice() {
            return self
                .rows
                .binary_search_by(|row| compare_keys(&row.project(key_columns), key));
        }
        self.rows
            .iter()
            .position(|row| compare_keys(&row.project(key_columns), key) == Ordering::Equal)
            .ok_or(self.rows.len())
    }

    fn sort_by_key(&mut self) {
        let key_columns = self.schema.primary_key.clone();
        if !key_columns.is_empty() {
            self.rows
                .sort_by(|a, b| compare_keys(&a.project(&key_columns), &b.project(&key_columns)));
        }
    }
}

#[derive(Default)]
struct MemoryDb {
    tables: HashMap<TableRef, MemTable>,
    fault: Option<FaultPlan>,
    faults_fired: usize,
}

/// Shared in-memory database. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    db: Arc<Mutex<MemoryDb>>,
    open_handles: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a table directly, bypassing the trait.
    pub fn create_table(&self, schema: TableSchema) {
        let table = schema.table.clone();
        self.db.lock().tables.insert(table, MemTable::new(schema));
    }

    /// Append rows given in the table's column order.
    pub fn insert_rows(&self, table: &TableRef, rows: Vec<Vec<SqlValue>>) {
        let mut db = self.db.lock();
        if let Some(t) = db.tables.get_mut(table) {
            let index = t.index.clone();
            t.rows
                .extend(rows.into_iter().map(|values| Row::new(index.clone(), values)));
            t.sort_by_key();
        }
    }

    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.db
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn schema(&self, table: &TableRef) -> Option<TableSchema> {
        self.db.lock().tables.get(table).map(|t| t.schema.clone())
    }

    pub fn inject_fault(&self, plan: FaultPlan) {
        let mut db = self.db.lock();
        db.fault = Some(plan);
        db.faults_fired = 0;
    }

    /// Handles opened and not yet dropped.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(AtomicOrdering::SeqCst)
    }

    /// Open a connection-like handle.
    pub fn handle(&self) -> MemoryHandle {
        self.open_handles.fetch_add(1, AtomicOrdering::SeqCst);
        MemoryHandle {
            store: self.clone(),
            writes: 0,
        }
    }
}

/// One "connection" to a [`MemoryStore`]; counts its own writes so fault
/// plans trigger per connection.
pub struct MemoryHandle {
    store: MemoryStore,
    writes: usize,
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.store.open_handles.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

impl MemoryHandle {
    fn check_fault(&mut self, db: &mut MemoryDb, operation: &str) -> Result<()> {
        self.writes += 1;
        let Some(plan) = db.fault else {
            return Ok(());
        };
        let exhausted = plan.times.is_some_and(|t| db.faults_fired >= t);
        if plan.on_write != self.writes || exhausted {
            return Ok(());
        }
        db.faults_fired += 1;
        Err(match plan.kind {
            FaultKind::Transient => SyncError::transient(operation, "connection reset by peer"),
            FaultKind::Permanent => SyncError::store(operation, "check constraint violated"),
        })
    }

    fn describe(&self, table: &TableRef) -> Option<TableSchema> {
        self.store.schema(table)
    }
}

fn compare_keys(a: &[SqlValue], b: &[SqlValue]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.compare(y).unwrap_or(Ordering::Equal))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn missing_table(table: &TableRef) -> SyncError {
    SyncError::schema(table.to_string(), "relation does not exist")
}

#[async_trait]
impl SourceStore for MemoryHandle {
    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableSchema>> {
        Ok(self.describe(table))
    }

    async fn count_rows(&mut self, table: &TableRef) -> Result<u64> {
        let db = self.store.db.lock();
        let t = db.tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(t.rows.len() as u64)
    }

    async fn fetch_after(
        &mut self,
        schema: &TableSchema,
        key_columns: &[String],
        after: Option<&[SqlValue]>,
        limit: usize,
    ) -> Result<RowBatch> {
        let db = self.store.db.lock();
        let t = db
            .tables
            .get(&schema.table)
            .ok_or_else(|| missing_table(&schema.table))?;

        let mut rows: Vec<Row> = t
            .rows
            .iter()
            .filter(|row| match after {
                Some(after) => compare_keys(&row.project(key_columns), after) == Ordering::Greater,
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| compare_keys(&a.project(key_columns), &b.project(key_columns)));
        rows.truncate(limit);
        Ok(RowBatch::new(rows))
    }

    async fn fetch_all(&mut self, schema: &TableSchema) -> Result<RowBatch> {
        let db = self.store.db.lock();
        let t = db
            .tables
            .get(&schema.table)
            .ok_or_else(|| missing_table(&schema.table))?;
        Ok(RowBatch::new(t.rows.clone()))
    }
}

#[async_trait]
impl TargetStore for MemoryHandle {
    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableSchema>> {
        Ok(self.describe(table))
    }

    async fn create_table(&mut self, schema: &TableSchema) -> Result<()> {
        let mut db = self.store.db.lock();
        if db.tables.contains_key(&schema.table) {
            return Err(SyncError::store(
                "create table",
                format!("relation {} already exists", schema.table),
            ));
        }
        db.tables
            .insert(schema.table.clone(), MemTable::new(schema.clone()));
        Ok(())
    }

    async fn apply_merge(&mut self, plan: &MergePlan, batch: &RowBatch) -> Result<u64> {
        let store = self.store.clone();
        let mut db = store.db.lock();
        self.check_fault(&mut db, "upsert")?;

        let t = db
            .tables
            .get_mut(plan.table())
            .ok_or_else(|| missing_table(plan.table()))?;
        if let Some(col) = plan.columns().iter().find(|c| !t.schema.has_column(c)) {
            return Err(SyncError::schema(
                plan.table().to_string(),
                format!("column \"{}\" does not exist", col),
            ));
        }

        let key_columns = plan.key_columns().to_vec();
        let mut affected = 0u64;
        for incoming in &batch.rows {
            let key = incoming.project(&key_columns);
            let values = incoming.project(t.index.names());
            match t.locate(&key_columns, &key) {
                Err(pos) => {
                    t.rows.insert(pos, Row::new(t.index.clone(), values));
                    affected += 1;
                }
                Ok(_) if plan.update_columns().is_empty() => {}
                Ok(pos) => {
                    if let Some(guard) = plan.guard_column() {
                        let newer = incoming
                            .get(guard)
                            .zip(t.rows[pos].get(guard))
                            .and_then(|(new, old)| new.compare(old));
                        if newer != Some(Ordering::Greater) {
                            continue;
                        }
                    }
                    let mut merged = t.rows[pos].values().to_vec();
                    for col in plan.update_columns() {
                        if let (Some(idx), Some(value)) = (t.index.position(col), incoming.get(col)) {
                            merged[idx] = value.clone();
                        }
                    }
                    t.rows[pos] = Row::new(t.index.clone(), merged);
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn replace_all(&mut self, schema: &TableSchema, batch: &RowBatch) -> Result<(u64, u64)> {
        let store = self.store.clone();
        let mut db = store.db.lock();
        self.check_fault(&mut db, "reload")?;

        let t = db
            .tables
            .get_mut(&schema.table)
            .ok_or_else(|| missing_table(&schema.table))?;
        let deleted = t.rows.len() as u64;
        let index = t.index.clone();
        t.rows = batch
            .rows
            .iter()
            .map(|row| Row::new(index.clone(), row.project(index.names())))
            .collect();
        t.sort_by_key();
        Ok((deleted, t.rows.len() as u64))
    }
}

/// Connects jobs to a pair of in-memory stores.
#[derive(Clone)]
pub struct MemoryConnector {
    pub source: MemoryStore,
    pub target: MemoryStore,
}

impl MemoryConnector {
    pub fn new(source: MemoryStore, target: MemoryStore) -> Self {
        Self { source, target }
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Source = MemoryHandle;
    type Target = MemoryHandle;

    async fn open(&self) -> Result<(MemoryHandle, MemoryHandle)> {
        Ok((self.source.handle(), self.target.handle()))
    }
}
