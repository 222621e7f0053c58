// ABOUTME: Sync job - one table replication invocation from schema check to last batch
// ABOUTME: Picks chunked merge or full reload, publishes progress and log events

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use super::chunker::WatermarkChunker;
use super::lease::TableLeases;
use super::merge::MergePlan;
use super::mirror::{self, MirroredSchema};
use super::reload;
use crate::error::Result;
use crate::events::{EventBus, LogLevel, SyncEvent};
use crate::schema::TableRef;
use crate::store::{SourceStore, StoreConnector, TargetStore};

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_WATERMARK_COLUMN: &str = "server_modified_date";

/// A request to replicate one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub id: Uuid,
    pub table: TableRef,
    pub watermark_column: String,
    pub chunk_size: usize,
}

impl SyncJob {
    pub fn new(table: TableRef, watermark_column: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            table,
            watermark_column: watermark_column.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Name used in events: `schema.table`.
    pub fn table_name(&self) -> String {
        self.table.to_string()
    }
}

/// Lifecycle of a job; a retry re-enters at `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Created,
    SchemaResolved,
    Chunking,
    Merging,
    Reloading,
    Retrying,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Incremental,
    FullReload,
}

/// Summary of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub table: String,
    pub strategy: Strategy,
    pub processed: u64,
    pub total: u64,
    pub batches: u64,
    /// Rows removed by a full reload; zero for incremental runs.
    pub deleted: u64,
    pub created_target: bool,
    pub duration_ms: u64,
}

/// Final result delivered through a job handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(JobReport),
    Failed { error: String, retries: u32 },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

/// Executes single job invocations against stores opened from `C`.
///
/// Each call to [`run`](Self::run) opens its own source and target handles
/// and drops them before returning, on success and on every error path.
pub struct JobRunner<C: StoreConnector> {
    connector: C,
    bus: Arc<dyn EventBus>,
    leases: Option<Arc<TableLeases>>,
}

impl<C: StoreConnector> JobRunner<C> {
    pub fn new(connector: C, bus: Arc<dyn EventBus>) -> Self {
        Self {
            connector,
            bus,
            leases: None,
        }
    }

    /// Serialize jobs per table through `leases`.
    pub fn with_leases(mut self, leases: Arc<TableLeases>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Log through `tracing` and mirror the line onto the event bus.
    pub fn announce(&self, job: &SyncJob, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}: {}", job.table, message),
            LogLevel::Info => tracing::info!("{}: {}", job.table, message),
            LogLevel::Warning => tracing::warn!("{}: {}", job.table, message),
            LogLevel::Error => tracing::error!("{}: {}", job.table, message),
        }
        self.bus
            .publish(SyncEvent::log(job.table_name(), level, message));
    }

    fn progress(&self, job: &SyncJob, processed: u64, total: u64) {
        self.bus
            .publish(SyncEvent::progress(job.table_name(), processed, total));
    }

    /// Run one invocation of `job`. Every error is published as an error
    /// log event before it is returned.
    pub async fn run(&self, job: &SyncJob, state: &watch::Sender<JobState>) -> Result<JobReport> {
        let result = self.run_invocation(job, state).await;
        if let Err(e) = &result {
            self.announce(job, LogLevel::Error, e.to_string());
        }
        result
    }

    async fn run_invocation(&self, job: &SyncJob, state: &watch::Sender<JobState>) -> Result<JobReport> {
        let started = Instant::now();
        state.send_replace(JobState::Created);

        let _lease = match &self.leases {
            Some(leases) => Some(leases.acquire(&job.table, job.id)?),
            None => None,
        };

        let (mut source, mut target) = self.connector.open().await?;
        let mirrored = mirror::ensure_target(&mut source, &mut target, &job.table).await?;
        state.send_replace(JobState::SchemaResolved);
        if mirrored.created {
            self.announce(job, LogLevel::Info, "created target table");
        }

        let mut report = if mirrored.source.has_primary_key() {
            self.run_chunked(job, &mirrored, &mut source, &mut target, state)
                .await?
        } else {
            self.announce(job, LogLevel::Info, "no primary key, reloading table");
            state.send_replace(JobState::Reloading);
            self.run_reload(job, &mirrored, &mut source, &mut target)
                .await?
        };

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.announce(
            job,
            LogLevel::Info,
            format!(
                "synced {} rows in {} batches ({}ms)",
                report.processed, report.batches, report.duration_ms
            ),
        );
        Ok(report)
    }

    async fn run_chunked(
        &self,
        job: &SyncJob,
        mirrored: &MirroredSchema,
        source: &mut C::Source,
        target: &mut C::Target,
        state: &watch::Sender<JobState>,
    ) -> Result<JobReport> {
        let mut total = source.count_rows(&job.table).await?;
        let plan = MergePlan::new(
            &mirrored.source,
            &mirrored.target,
            Some(job.watermark_column.as_str()),
        );
        if plan.guard_column().is_none() {
            self.announce(
                job,
                LogLevel::Debug,
                format!("no '{}' column, source rows always win", job.watermark_column),
            );
        }

        let mut chunker = WatermarkChunker::new(source, &mirrored.source, job.chunk_size);
        let mut processed = 0u64;
        let mut batches = 0u64;

        loop {
            state.send_replace(JobState::Chunking);
            let Some(batch) = chunker.next_batch().await? else {
                break;
            };

            state.send_replace(JobState::Merging);
            target.apply_merge(&plan, &batch).await?;

            processed += batch.len() as u64;
            batches += 1;
            // Rows inserted after the count can push past the initial total.
            total = total.max(processed);
            self.progress(job, processed, total);
        }

        // Close the stream at processed == total: an empty table, or rows
        // deleted from the source after the count.
        if batches == 0 || processed < total {
            total = processed;
            self.progress(job, processed, total);
        }

        Ok(JobReport {
            job_id: job.id,
            table: job.table_name(),
            strategy: Strategy::Incremental,
            processed,
            total,
            batches,
            deleted: 0,
            created_target: mirrored.created,
            duration_ms: 0,
        })
    }

    async fn run_reload(
        &self,
        job: &SyncJob,
        mirrored: &MirroredSchema,
        source: &mut C::Source,
        target: &mut C::Target,
    ) -> Result<JobReport> {
        let outcome = reload::reload(source, target, &mirrored.source).await?;
        let mut total = outcome.source_count.max(outcome.loaded);
        self.progress(job, outcome.loaded, total);
        // Rows deleted between the count and the read.
        if outcome.loaded < total {
            total = outcome.loaded;
            self.progress(job, outcome.loaded, total);
        }

        Ok(JobReport {
            job_id: job.id,
            table: job.table_name(),
            strategy: Strategy::FullReload,
            processed: outcome.loaded,
            total,
            batches: 1,
            deleted: outcome.deleted,
            created_target: mirrored.created,
            duration_ms: 0,
        })
    }
}
