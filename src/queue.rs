// ABOUTME: Task queue running sync jobs on a fixed pool of workers
// ABOUTME: Re-enqueues transiently failed jobs after the retry delay and reports outcomes

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::events::LogLevel;
use crate::schema::TableRef;
use crate::store::StoreConnector;
use crate::sync::{
    JobOutcome, JobRunner, JobState, RetryDecision, RetryPolicy, SyncJob, DEFAULT_CHUNK_SIZE,
    DEFAULT_WATERMARK_COLUMN,
};

/// A job submission as it arrives from a trigger.
///
/// `table_name` may list several comma-separated tables; each becomes its
/// own job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub table_name: String,
    #[serde(default)]
    pub watermark_column: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

impl JobRequest {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            watermark_column: None,
            chunk_size: None,
        }
    }

    pub fn with_watermark(mut self, column: impl Into<String>) -> Self {
        self.watermark_column = Some(column.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
    pub watermark_column: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            watermark_column: DEFAULT_WATERMARK_COLUMN.to_string(),
        }
    }
}

/// Handle returned on submission; the job runs asynchronously.
pub struct JobHandle {
    id: Uuid,
    table: TableRef,
    state: watch::Receiver<JobState>,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Most recent lifecycle state.
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Wait for the job to complete or fail terminally.
    pub async fn wait(self) -> JobOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::Failed {
                error: "job cancelled: queue shut down".to_string(),
                retries: 0,
            },
        }
    }
}

struct QueuedJob {
    job: SyncJob,
    retries: u32,
    state: watch::Sender<JobState>,
    reply: oneshot::Sender<JobOutcome>,
}

/// Fixed pool of workers pulling jobs from one queue.
///
/// Each worker runs one job invocation at a time. A transiently failed job
/// goes back on the queue after the retry delay and may be picked up by any
/// worker; the retry count travels with the job.
pub struct JobQueue {
    config: QueueConfig,
    tx: mpsc::UnboundedSender<QueuedJob>,
    shutdown: broadcast::Sender<()>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn start<C: StoreConnector>(runner: JobRunner<C>, config: QueueConfig) -> Self {
        let runner = Arc::new(runner);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown, _) = broadcast::channel(1);

        let worker_count = config.workers.max(1);
        let workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    runner: runner.clone(),
                    policy: config.retry,
                    requeue: tx.clone(),
                    shutdown: shutdown.subscribe(),
                };
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();

        tracing::info!(
            "Started job queue with {} workers (retry delay {:?}, max retries {})",
            worker_count,
            config.retry.delay,
            config.retry.max_retries
        );

        Self {
            config,
            tx,
            shutdown,
            workers: parking_lot::Mutex::new(workers),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue every table named in `request` and return one handle per
    /// table, in request order.
    pub fn submit(&self, request: JobRequest) -> Result<Vec<JobHandle>> {
        let chunk_size = request.chunk_size.unwrap_or(self.config.chunk_size);
        if chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be greater than 0".to_string()));
        }
        let watermark = request
            .watermark_column
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.config.watermark_column.clone());

        let tables = request
            .table_name
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(TableRef::parse)
            .collect::<Result<Vec<_>>>()?;
        if tables.is_empty() {
            return Err(SyncError::Config("no table name given".to_string()));
        }

        tables
            .into_iter()
            .map(|table| self.enqueue(SyncJob::new(table, watermark.clone(), chunk_size)))
            .collect()
    }

    fn enqueue(&self, job: SyncJob) -> Result<JobHandle> {
        let (state_tx, state_rx) = watch::channel(JobState::Queued);
        let (reply_tx, reply_rx) = oneshot::channel();
        let handle = JobHandle {
            id: job.id,
            table: job.table.clone(),
            state: state_rx,
            outcome: reply_rx,
        };

        tracing::info!("Queued job {} for {}", job.id, job.table);
        self.tx
            .send(QueuedJob {
                job,
                retries: 0,
                state: state_tx,
                reply: reply_tx,
            })
            .map_err(|_| SyncError::Config("job queue is shut down".to_string()))?;
        Ok(handle)
    }

    /// Stop accepting work and wait for workers to finish their current job.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("Worker task ended abnormally: {}", e);
            }
        }
        tracing::info!("Job queue stopped");
    }
}

struct Worker<C: StoreConnector> {
    id: usize,
    runner: Arc<JobRunner<C>>,
    policy: RetryPolicy,
    requeue: mpsc::UnboundedSender<QueuedJob>,
    /// Closes when the queue is shut down or dropped.
    shutdown: broadcast::Receiver<()>,
}

impl<C: StoreConnector> Worker<C> {
    async fn run(mut self, jobs: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>) {
        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.recv() => break,
                job = async { jobs.lock().await.recv().await } => job,
            };
            let Some(queued) = next else {
                break;
            };
            tracing::debug!("Worker {} picked up job {}", self.id, queued.job.id);
            self.process(queued).await;
        }
        tracing::debug!("Worker {} stopped", self.id);
    }

    async fn process(&self, mut queued: QueuedJob) {
        let job = &queued.job;
        let err = match self.runner.run(job, &queued.state).await {
            Ok(report) => {
                queued.state.send_replace(JobState::Completed);
                let _ = queued.reply.send(JobOutcome::Completed(report));
                return;
            }
            Err(err) => err,
        };

        match self.policy.decide(&err, queued.retries) {
            RetryDecision::Retry { retry, delay } => {
                self.runner.announce(
                    job,
                    LogLevel::Warning,
                    format!(
                        "retry {}/{} in {:?}: {}",
                        retry, self.policy.max_retries, delay, err
                    ),
                );
                queued.retries = retry;
                queued.state.send_replace(JobState::Retrying);

                let requeue = self.requeue.clone();
                let mut shutdown = self.shutdown.resubscribe();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            let _ = requeue.send(queued);
                        }
                        _ = shutdown.recv() => {}
                    }
                });
            }
            RetryDecision::Exhausted => {
                self.runner.announce(
                    job,
                    LogLevel::Error,
                    format!("giving up after {} retries", queued.retries),
                );
                self.fail(queued, err);
            }
            RetryDecision::Fail => self.fail(queued, err),
        }
    }

    fn fail(&self, queued: QueuedJob, err: SyncError) {
        queued.state.send_replace(JobState::Failed);
        let _ = queued.reply.send(JobOutcome::Failed {
            error: err.to_string(),
            retries: queued.retries,
        });
    }
}
