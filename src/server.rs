// ABOUTME: TCP front ends: newline-delimited JSON event stream and job submission
// ABOUTME: Each listener runs as a task stopped through its ServerHandle

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use uuid::Uuid;

use crate::events::EventBus;
use crate::queue::{JobQueue, JobRequest};

/// Running listener. Dropping the handle stops accepting connections.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn spawn_listener<F, Fut>(addr: SocketAddr, name: &'static str, handler: F) -> Result<ServerHandle>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} listener on {}", name, addr))?;
    let local_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut incoming = TcpListenerStream::new(listener);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,
                conn = incoming.next() => match conn {
                    Some(Ok(stream)) => {
                        let peer = stream
                            .peer_addr()
                            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                        tracing::debug!("{} connection from {}", name, peer);
                        tokio::spawn(handler(stream, peer));
                    }
                    Some(Err(e)) => tracing::warn!("{} accept failed: {}", name, e),
                    None => break,
                },
            }
        }
        tracing::info!("{} listener on {} stopped", name, local_addr);
    });

    tracing::info!("{} listening on {}", name, local_addr);
    Ok(ServerHandle {
        local_addr,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

/// Serve the event stream: every connected client receives each published
/// event as one JSON line until it disconnects or falls too far behind.
pub async fn serve_events(addr: SocketAddr, bus: Arc<dyn EventBus>) -> Result<ServerHandle> {
    spawn_listener(addr, "event stream", move |stream, peer| {
        let subscription = bus.subscribe();
        async move {
            let (mut reader, mut writer) = stream.into_split();
            let mut events = subscription.into_stream();
            let mut scratch = [0u8; 256];
            loop {
                tokio::select! {
                    event = events.next() => {
                        let Some(event) = event else {
                            tracing::info!("Event client {} evicted: mailbox full", peer);
                            break;
                        };
                        let line = match event.to_json_line() {
                            Ok(line) => line,
                            Err(e) => {
                                tracing::warn!("Failed to encode event: {}", e);
                                continue;
                            }
                        };
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    read = reader.read(&mut scratch) => match read {
                        Ok(0) | Err(_) => break,
                        // Client input is ignored.
                        Ok(_) => {}
                    },
                }
            }
            tracing::debug!("Event client {} disconnected", peer);
        }
    })
    .await
}

#[derive(Serialize)]
#[serde(untagged)]
enum SubmitReply {
    Accepted { job_id: Uuid, table_name: String },
    Rejected { error: String },
}

/// Serve job submissions: one JSON [`JobRequest`] per line, answered with
/// one `{"job_id", "table_name"}` line per queued job or an `{"error"}` line.
pub async fn serve_submissions(addr: SocketAddr, queue: Arc<JobQueue>) -> Result<ServerHandle> {
    spawn_listener(addr, "job submission", move |stream, peer| {
        let queue = queue.clone();
        async move {
            if let Err(e) = handle_submissions(stream, &queue).await {
                tracing::warn!("Submission client {} failed: {}", peer, e);
            }
        }
    })
    .await
}

async fn handle_submissions(stream: TcpStream, queue: &JobQueue) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let replies = match serde_json::from_str::<JobRequest>(&line) {
            Ok(request) => match queue.submit(request) {
                Ok(handles) => handles
                    .iter()
                    .map(|h| SubmitReply::Accepted {
                        job_id: h.id(),
                        table_name: h.table().to_string(),
                    })
                    .collect(),
                Err(e) => vec![SubmitReply::Rejected {
                    error: e.to_string(),
                }],
            },
            Err(e) => vec![SubmitReply::Rejected {
                error: format!("invalid request: {}", e),
            }],
        };

        for reply in replies {
            let mut out = serde_json::to_string(&reply)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
        }
    }
    Ok(())
}
