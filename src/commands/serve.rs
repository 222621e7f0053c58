// ABOUTME: Long-running serve command - worker pool plus TCP front ends
// ABOUTME: Accepts job submissions and streams events until Ctrl-C

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::server::{serve_events, serve_submissions};

pub async fn serve(settings: Settings) -> Result<()> {
    tracing::info!("Starting replication service: {}", settings.describe());

    let bus = super::build_bus(&settings).await?;
    let queue = Arc::new(super::start_queue(&settings, bus.clone()));

    let events = serve_events(settings.events_addr, bus.clone())
        .await
        .context("Failed to start event stream server")?;
    let submissions = serve_submissions(settings.submit_addr, queue.clone())
        .await
        .context("Failed to start job submission server")?;

    tracing::info!(
        "Ready: submit jobs on {}, events on {}",
        submissions.local_addr(),
        events.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping");

    submissions.stop().await;
    queue.shutdown().await;
    events.stop().await;
    Ok(())
}
