// ABOUTME: Watermark chunker - keyset pagination over a table's primary key
// ABOUTME: Yields fixed-size batches in key order until the source runs dry

use crate::error::Result;
use crate::row::{RowBatch, SqlValue};
use crate::schema::TableSchema;
use crate::store::SourceStore;

/// Walks a keyed table in `chunk_size` batches.
///
/// Each call to [`next_batch`](Self::next_batch) selects rows whose key is
/// strictly greater than the last key seen, so no row is read twice and rows
/// inserted mid-run with higher keys are picked up by a later batch. The
/// chunker is single-use: once a fetch comes back empty it stays exhausted.
pub struct WatermarkChunker<'a, S: SourceStore + ?Sized> {
    source: &'a mut S,
    schema: &'a TableSchema,
    chunk_size: usize,
    last_key: Option<Vec<SqlValue>>,
    exhausted: bool,
}

impl<'a, S: SourceStore + ?Sized> WatermarkChunker<'a, S> {
    pub fn new(source: &'a mut S, schema: &'a TableSchema, chunk_size: usize) -> Self {
        Self {
            source,
            schema,
            chunk_size: chunk_size.max(1),
            last_key: None,
            exhausted: false,
        }
    }

    /// Key of the last row handed out, `None` before the first batch.
    pub fn watermark(&self) -> Option<&[SqlValue]> {
        self.last_key.as_deref()
    }

    /// Fetch the next batch, or `None` once the table is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let batch = self
            .source
            .fetch_after(
                self.schema,
                &self.schema.primary_key,
                self.last_key.as_deref(),
                self.chunk_size,
            )
            .await?;

        match batch.last_key(&self.schema.primary_key) {
            Some(key) => {
                self.last_key = Some(key);
                Ok(Some(batch))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}
