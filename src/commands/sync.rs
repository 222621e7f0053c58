// ABOUTME: One-shot sync command - replicates the named tables and exits
// ABOUTME: Streams events to stdout as JSON lines; fails if any table failed

use anyhow::{bail, Context, Result};

use crate::config::Settings;
use crate::queue::JobRequest;
use crate::sync::JobOutcome;

pub struct SyncOptions {
    /// Comma-separated table names.
    pub tables: String,
}

pub async fn sync(settings: Settings, opts: SyncOptions) -> Result<()> {
    tracing::info!("Starting sync: {}", settings.describe());

    let bus = super::build_bus(&settings).await?;
    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.to_json_line() {
                Ok(line) => print!("{}", line),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            }
        }
    });

    let queue = super::start_queue(&settings, bus.clone());
    let handles = queue
        .submit(JobRequest::new(opts.tables))
        .context("Failed to submit sync jobs")?;

    let mut failed = Vec::new();
    for handle in handles {
        let table = handle.table().to_string();
        match handle.wait().await {
            JobOutcome::Completed(report) => {
                tracing::info!(
                    "✓ {} synced: {} rows ({:?}) in {}ms",
                    table,
                    report.processed,
                    report.strategy,
                    report.duration_ms
                );
            }
            JobOutcome::Failed { error, retries } => {
                tracing::error!("✗ {} failed after {} retries: {}", table, retries, error);
                failed.push(table);
            }
        }
    }

    queue.shutdown().await;
    drop(queue);
    drop(bus);
    if let Err(e) = printer.await {
        tracing::warn!("Event printer ended abnormally: {}", e);
    }

    if !failed.is_empty() {
        bail!("{} table(s) failed to sync: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
