//! Worker loop and worker pool.
//!
//! A [`Worker`] repeatedly claims the next job across its assigned queue
//! classes (chat first), runs the domain function as a spawned task, and
//! awaits it under the class timeout.
//!
//! - success: the result is recorded with `finish`
//! - error: the error kind and message are recorded with `fail`
//! - timeout: the job is failed with `job_timeout` immediately. The task is
//!   not cancelled and keeps running detached; when it eventually returns,
//!   its result is offered to `finish`, which rejects it because the job is
//!   no longer `started`.
//!
//! A worker process that dies mid-job leaves that job in `started`. Nothing
//! re-queues it.
//!
//! Each worker owns one [`ModelCache`], so an embedding model is loaded at
//! most once per worker and reused by every job that worker runs.

use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{Config, QueueConfig};
use crate::embedding::ModelCache;
use crate::engine::LocalMemoryEngine;
use crate::error::{KbError, Result};
use crate::jobs::{run_job, JobContext};
use crate::llm::LlmRouter;
use crate::metrics;
use crate::models::{Job, JobError, QueueClass};
use crate::queue::JobQueue;
use crate::registry::ProjectRegistry;
use crate::storage::StorageLayout;

const TERMINAL_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct Worker {
    id: String,
    queue: JobQueue,
    ctx: Arc<JobContext>,
    classes: Vec<QueueClass>,
    timeouts: QueueConfig,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: JobQueue,
        ctx: JobContext,
        mut classes: Vec<QueueClass>,
        timeouts: QueueConfig,
        poll_interval: Duration,
    ) -> Self {
        classes.sort_by_key(|c| c.priority());
        classes.dedup();
        Self {
            id: id.into(),
            queue,
            ctx: Arc::new(ctx),
            classes,
            timeouts,
            poll_interval,
        }
    }

    /// Claim and execute at most one job. Returns `false` when nothing was
    /// claimable.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.claim(&self.id, &self.classes).await? else {
            return Ok(false);
        };

        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            kind = %job.kind,
            queue = %job.queue,
            project_id = %job.project_id,
            worker_id = %self.id,
        );
        self.execute(job).instrument(span).await?;
        Ok(true)
    }

    async fn execute(&self, job: Job) -> Result<()> {
        let timeout = self.timeouts.timeout_for(job.queue);
        tracing::info!("job started");

        let ctx = Arc::clone(&self.ctx);
        let task_job = job.clone();
        let mut handle: JoinHandle<Result<Value>> =
            tokio::spawn(async move { run_job(&ctx, &task_job).await }.in_current_span());

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => {
                let recorded = retry_once(|| self.queue.finish(&job.id, &result)).await?;
                if recorded {
                    tracing::info!("job finished");
                } else {
                    tracing::warn!("job already terminated; result dropped");
                }
            }
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, error_kind = e.kind(), "job failed");
                self.record_failure(&job.id, &e).await?;
            }
            Ok(Err(join_err)) => {
                let e = KbError::internal(format!("job task aborted: {}", join_err));
                tracing::error!(error = %e, "job failed");
                metrics::record_error(&job.kind, e.kind());
                self.record_failure(&job.id, &e).await?;
            }
            Err(_) => {
                let e = KbError::JobTimeout(timeout.as_secs());
                tracing::error!(timeout_secs = timeout.as_secs(), "job timed out");
                metrics::record_error(&job.kind, e.kind());
                self.record_failure(&job.id, &e).await?;
                self.watch_detached(job.id, handle);
            }
        }
        Ok(())
    }

    async fn record_failure(&self, job_id: &str, err: &KbError) -> Result<()> {
        let job_error = JobError::from(err);
        retry_once(|| self.queue.fail(job_id, &job_error)).await?;
        Ok(())
    }

    /// Offer a timed-out task's eventual result to the queue so the status
    /// guard, not the worker, decides that it is discarded.
    fn watch_detached(&self, job_id: String, handle: JoinHandle<Result<Value>>) {
        let queue = self.queue.clone();
        tokio::spawn(
            async move {
                let Ok(Ok(result)) = handle.await else {
                    return;
                };
                match queue.finish(&job_id, &result).await {
                    Ok(true) => tracing::warn!("timed-out job finished late"),
                    Ok(false) => tracing::warn!("late result dropped; job already failed"),
                    Err(e) => tracing::error!(error = %e, "failed to record late result"),
                }
            }
            .in_current_span(),
        );
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queues: Vec<&str> = self.classes.iter().map(|c| c.as_str()).collect();
        tracing::info!(worker_id = %self.id, queues = ?queues, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(worker_id = %self.id, error = %e, "worker iteration failed"),
            }

            tokio::select! {
                _ = self.queue.wait_for_work(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.id, "worker stopped");
    }
}

/// Run a terminal queue write, retrying once after a short pause. A job
/// whose terminal write fails twice stays `started`.
async fn retry_once<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(e) => {
            tracing::warn!(error = %e, "terminal job write failed, retrying");
            tokio::time::sleep(TERMINAL_RETRY_DELAY).await;
            op().await.inspect_err(|e| {
                metrics::record_error("job_record", e.kind());
                tracing::error!(error = %e, "terminal job write failed; job left started");
            })
        }
    }
}

/// Build the job context for one worker, with a fresh model cache.
pub fn build_context(config: &Config, pool: SqlitePool, llm: LlmRouter) -> JobContext {
    let storage = StorageLayout::from_config(config);
    let models = Arc::new(ModelCache::new(config.embedding.clone()));
    let engine = LocalMemoryEngine::new(storage.clone(), models, config.retrieval.hybrid_alpha);
    JobContext {
        registry: ProjectRegistry::new(pool, storage),
        engine: Arc::new(engine),
        llm,
        indexing: config.indexing.clone(),
        retrieval: config.retrieval.clone(),
    }
}

/// Spawn `concurrency` workers servicing `classes`.
pub fn spawn_pool(
    config: &Config,
    pool: SqlitePool,
    queue: JobQueue,
    llm: LlmRouter,
    concurrency: usize,
    classes: &[QueueClass],
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|i| {
            let worker = Worker::new(
                format!("worker-{}-{}", std::process::id(), i),
                queue.clone(),
                build_context(config, pool.clone(), llm.clone()),
                classes.to_vec(),
                config.queue.clone(),
                Duration::from_millis(config.worker.poll_interval_ms),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
