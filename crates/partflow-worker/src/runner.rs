//! Per-kind worker pools.
//!
//! Each job kind gets a bounded pool of worker loops. A loop prefers the
//! broker: it pops a handle and tries the conditional lease against the
//! durable store — a stale or duplicate handle simply fails the lease and
//! is dropped. When the broker is empty or unreachable the loop falls back
//! to polling the store directly, so execution continues through a broker
//! outage at polling latency.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use partflow_core::config::worker::{PoolSizes, WorkerConfig};
use partflow_core::events::JobEvent;
use partflow_entity::job::{Job, JobKind};
use partflow_service::JobQueue;

use crate::executor::{JobContext, JobExecutionError, JobExecutor};

/// How many stale broker handles a loop burns through per wakeup before
/// falling back to the store.
const MAX_POPS_PER_WAKEUP: usize = 8;

/// The set of per-kind worker pools.
#[derive(Debug)]
pub struct WorkerPool {
    queue: JobQueue,
    executor: Arc<JobExecutor>,
    config: WorkerConfig,
}

impl WorkerPool {
    /// Create the worker pools.
    pub fn new(queue: JobQueue, executor: Arc<JobExecutor>, config: WorkerConfig) -> Self {
        Self {
            queue,
            executor,
            config,
        }
    }

    /// Spawn every pool. Loops run until the shutdown signal flips to
    /// `true`; the returned handles resolve once their loop has drained.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for kind in JobKind::ALL {
            let slots = Self::pool_size(&self.config.pools, kind);
            if slots == 0 || !self.executor.has_handler(kind) {
                continue;
            }
            info!(kind = %kind, slots, "Starting worker pool");
            for slot in 0..slots {
                let worker = Worker {
                    queue: self.queue.clone(),
                    executor: self.executor.clone(),
                    kind,
                    worker_id: format!("{kind}-{slot}-{}", short_id()),
                    poll_interval: Duration::from_secs(self.config.poll_interval_seconds.max(1)),
                    lease_seconds: self.config.lease_seconds,
                };
                handles.push(tokio::spawn(worker.run(shutdown.clone())));
            }
        }
        handles
    }

    fn pool_size(pools: &PoolSizes, kind: JobKind) -> usize {
        match kind {
            JobKind::Transcode => pools.transcode,
            JobKind::Thumbnail => pools.thumbnail,
            JobKind::ConvertDocument => pools.convert_document,
            JobKind::Compress => pools.compress,
            JobKind::CleanupExtensions => pools.cleanup_extensions,
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

struct Worker {
    queue: JobQueue,
    executor: Arc<JobExecutor>,
    kind: JobKind,
    worker_id: String,
    poll_interval: Duration,
    lease_seconds: i64,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "Worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.next_job().await {
                Some(job) => self.process(job).await,
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "Worker loop stopped");
    }

    /// Claim the next job, broker first, store second.
    async fn next_job(&self) -> Option<Job> {
        if self.queue.broker().is_available() {
            for _ in 0..MAX_POPS_PER_WAKEUP {
                match self.queue.broker().pop(self.kind).await {
                    Ok(Some(job_id)) => {
                        match self
                            .queue
                            .store()
                            .lease_by_id(job_id, &self.worker_id, self.lease_seconds)
                            .await
                        {
                            Ok(Some(job)) => return Some(job),
                            // Stale handle: already leased, cancelled, or
                            // not yet mature. Drop it and pop again.
                            Ok(None) => continue,
                            Err(e) => {
                                error!(error = %e, "Lease failed for popped handle");
                                return None;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }

        match self
            .queue
            .store()
            .lease_next(self.kind, &self.worker_id, self.lease_seconds)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Store poll failed");
                None
            }
        }
    }

    async fn process(&self, job: Job) {
        self.queue.notifier().publish_job(&JobEvent::Started {
            job_id: job.id,
            kind: job.kind.as_str().to_string(),
            attempt: job.attempts,
        });

        let heartbeat = self.spawn_heartbeat(job.id);
        let ctx = JobContext::new(job.id, self.queue.clone());
        let outcome = self.executor.execute(&job, &ctx).await;
        heartbeat.abort();

        let settle = match outcome {
            Ok(result) => self.queue.complete(&job, result).await,
            Err(JobExecutionError::Permanent(msg)) => {
                warn!(job_id = %job.id, error = %msg, "Job failed permanently");
                self.queue
                    .fail(&job, &partflow_core::error::AppError::internal(msg), true)
                    .await
            }
            Err(JobExecutionError::Transient(msg)) => {
                warn!(job_id = %job.id, error = %msg, "Job failed, will retry");
                self.queue
                    .fail(&job, &partflow_core::error::AppError::internal(msg), false)
                    .await
            }
            Err(JobExecutionError::Internal(e)) => {
                warn!(job_id = %job.id, error = %e, "Job hit an internal error, will retry");
                self.queue.fail(&job, &e, false).await
            }
        };
        if let Err(e) = settle {
            error!(job_id = %job.id, error = %e, "Failed to record job outcome");
        }
    }

    /// Renew the lease at a third of its duration until aborted.
    fn spawn_heartbeat(&self, job_id: Uuid) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.worker_id.clone();
        let lease_seconds = self.lease_seconds;
        let interval = Duration::from_secs((lease_seconds as u64 / 3).max(1));

        tokio::spawn(async move {
            loop {
                time::sleep(interval).await;
                match queue.heartbeat(job_id, &worker_id, lease_seconds).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "Lease lost; job was reclaimed");
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use partflow_entity::job::{CreateJob, JobPayload, JobPriority, JobStatus};
    use partflow_service::testing::memory_queue;
    use serde_json::Value;

    #[derive(Debug)]
    struct FlakyHandler {
        fail_first: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl crate::executor::JobHandler for FlakyHandler {
        fn kind(&self) -> JobKind {
            JobKind::CleanupExtensions
        }

        async fn execute(
            &self,
            _job: &Job,
            _ctx: &JobContext,
        ) -> Result<Option<Value>, JobExecutionError> {
            if self.fail_first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                Err(JobExecutionError::Transient("flaky".into()))
            } else {
                Ok(Some(serde_json::json!({"cleaned": 0})))
            }
        }
    }

    fn cleanup_job() -> CreateJob {
        CreateJob::from_payload(
            &JobPayload::CleanupExtensions {
                prefix: "derived/".into(),
                extensions: vec!["tmp".into()],
            },
            JobPriority::Low,
        )
        .unwrap()
    }

    fn worker(queue: &JobQueue, executor: JobExecutor) -> Worker {
        Worker {
            queue: queue.clone(),
            executor: Arc::new(executor),
            kind: JobKind::CleanupExtensions,
            worker_id: "test-worker".into(),
            poll_interval: Duration::from_millis(10),
            lease_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_broker_handle_preferred_then_store_fallback() {
        let queue = memory_queue(30);
        let w = worker(&queue, JobExecutor::new());

        let job = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        // First claim goes through the broker handle.
        let claimed = w.next_job().await.unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(
            queue.broker().depth(JobKind::CleanupExtensions).await.unwrap(),
            0
        );

        // A job without a broker handle is still claimable from the store.
        let orphan = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        queue.broker().pop(JobKind::CleanupExtensions).await.unwrap();
        let claimed = w.next_job().await.unwrap();
        assert_eq!(claimed.id, orphan.id);
    }

    #[tokio::test]
    async fn test_stale_handle_is_dropped() {
        let queue = memory_queue(30);
        let w = worker(&queue, JobExecutor::new());

        let job = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        // Another worker already leased the row; the handle is stale.
        queue
            .store()
            .lease_by_id(job.id, "other", 60)
            .await
            .unwrap()
            .unwrap();

        assert!(w.next_job().await.is_none());
    }

    #[tokio::test]
    async fn test_process_settles_success_and_retry() {
        let queue = memory_queue(30);
        let mut executor = JobExecutor::new();
        executor.register(Arc::new(FlakyHandler {
            fail_first: std::sync::atomic::AtomicBool::new(true),
        }));
        let w = worker(&queue, executor);

        let job = queue.enqueue(cleanup_job()).await.unwrap().unwrap();

        // First attempt fails transiently and is rescheduled with backoff.
        let claimed = w.next_job().await.unwrap();
        w.process(claimed).await;
        let row = queue.find(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.scheduled_at.is_some());

        // Not claimable until the backoff matures.
        assert!(w.next_job().await.is_none());
    }

    #[tokio::test]
    async fn test_process_completes_job() {
        let queue = memory_queue(30);
        let mut executor = JobExecutor::new();
        executor.register(Arc::new(FlakyHandler {
            fail_first: std::sync::atomic::AtomicBool::new(false),
        }));
        let w = worker(&queue, executor);

        let job = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        let claimed = w.next_job().await.unwrap();
        w.process(claimed).await;

        let row = queue.find(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.progress, 100);
        assert_eq!(row.result, Some(serde_json::json!({"cleaned": 0})));
    }
}
