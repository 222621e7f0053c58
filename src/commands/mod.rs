// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Shared wiring of event bus, job runner and queue from settings

pub mod serve;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::events::{Broadcaster, EventBus, RedisEventBus};
use crate::postgres::PgConnector;
use crate::queue::{JobQueue, QueueConfig};
use crate::sync::{JobRunner, TableLeases};

pub use serve::serve;
pub use sync::sync;

/// In-process broadcaster, or Redis pub/sub when a Redis URL is configured.
pub async fn build_bus(settings: &Settings) -> Result<Arc<dyn EventBus>> {
    match &settings.redis_url {
        Some(url) => {
            let bus = RedisEventBus::connect(url, &settings.redis_channel, settings.mailbox)
                .await
                .context("Failed to connect to Redis event broker")?;
            Ok(Arc::new(bus))
        }
        None => Ok(Arc::new(Broadcaster::new(settings.mailbox))),
    }
}

/// Start the worker pool replicating from the configured source to target.
pub fn start_queue(settings: &Settings, bus: Arc<dyn EventBus>) -> JobQueue {
    let connector = PgConnector::new(&settings.source_url, &settings.target_url, settings.tls);
    let mut runner = JobRunner::new(connector, bus);
    if settings.table_leases {
        runner = runner.with_leases(TableLeases::new(settings.lease_ttl));
    }

    JobQueue::start(
        runner,
        QueueConfig {
            workers: settings.workers,
            retry: settings.retry,
            chunk_size: settings.chunk_size,
            watermark_column: settings.watermark_column.clone(),
        },
    )
}
