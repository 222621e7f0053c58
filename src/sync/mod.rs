// ABOUTME: Replication engine - schema mirror, chunked merge, full reload
// ABOUTME: Plus the retry policy and per-table leases the task queue relies on

pub mod chunker;
pub mod job;
pub mod lease;
pub mod merge;
pub mod mirror;
pub mod reload;
pub mod retry;

pub use chunker::WatermarkChunker;
pub use job::{
    JobOutcome, JobReport, JobRunner, JobState, Strategy, SyncJob, DEFAULT_CHUNK_SIZE,
    DEFAULT_WATERMARK_COLUMN,
};
pub use lease::{LeaseGuard, TableLeases, DEFAULT_LEASE_TTL};
pub use merge::MergePlan;
pub use mirror::{ensure_target, MirroredSchema};
pub use reload::{reload, ReloadOutcome};
pub use retry::{RetryDecision, RetryPolicy};
