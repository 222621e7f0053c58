// ABOUTME: Store abstractions the replication engine reads from and writes to
// ABOUTME: PostgreSQL and in-memory implementations share these traits

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::row::{RowBatch, SqlValue};
use crate::schema::{TableRef, TableSchema};
use crate::sync::merge::MergePlan;

pub use memory::{FaultKind, FaultPlan, MemoryConnector, MemoryHandle, MemoryStore};

/// Read side of a replication job.
#[async_trait]
pub trait SourceStore: Send {
    /// Columns and primary key of `table`, or `None` if it does not exist.
    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableSchema>>;

    async fn count_rows(&mut self, table: &TableRef) -> Result<u64>;

    /// Up to `limit` rows whose key is strictly greater than `after`
    /// (or from the start of the table when `after` is `None`), ordered by
    /// `key_columns`.
    async fn fetch_after(
        &mut self,
        schema: &TableSchema,
        key_columns: &[String],
        after: Option<&[SqlValue]>,
        limit: usize,
    ) -> Result<RowBatch>;

    /// Every row of the table in one pass.
    async fn fetch_all(&mut self, schema: &TableSchema) -> Result<RowBatch>;
}

/// Write side of a replication job.
#[async_trait]
pub trait TargetStore: Send {
    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableSchema>>;

    async fn create_table(&mut self, schema: &TableSchema) -> Result<()>;

    /// Apply one batch as a single transactional upsert; returns rows
    /// inserted or updated.
    async fn apply_merge(&mut self, plan: &MergePlan, batch: &RowBatch) -> Result<u64>;

    /// Delete every row, then insert `batch`, atomically. Returns
    /// `(deleted, loaded)`.
    async fn replace_all(&mut self, schema: &TableSchema, batch: &RowBatch) -> Result<(u64, u64)>;
}

/// Opens a fresh source/target pair for one job invocation.
///
/// Handles are owned by the invocation and dropped when it ends, whatever
/// the outcome, which releases the underlying connections.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    type Source: SourceStore + 'static;
    type Target: TargetStore + 'static;

    async fn open(&self) -> Result<(Self::Source, Self::Target)>;
}
