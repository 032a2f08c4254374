//! Job enqueueing and lifecycle transitions against the dual queue backend.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use partflow_broker::BrokerManager;
use partflow_core::error::AppError;
use partflow_core::events::JobEvent;
use partflow_core::result::AppResult;
use partflow_database::repositories::job::StatusCounts;
use partflow_entity::job::{CreateJob, Job, JobKind};
use partflow_notify::ProgressNotifier;

use crate::store::JobStore;

/// Longest retry delay regardless of attempt count.
const MAX_BACKOFF_SECONDS: i64 = 3600;

/// Combined view of the durable store and the broker.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Per-status job counts from the durable store.
    pub statuses: StatusCounts,
    /// Whether the broker answered its most recent operation.
    pub broker_available: bool,
    /// Broker queue depth per kind; absent while the broker is down.
    pub broker_depths: HashMap<String, u64>,
}

/// The enqueue and transition surface of the job queue.
///
/// Every mutation lands in the durable store first; the broker push is an
/// accelerant. A broker failure during enqueue is logged and absorbed — the
/// reconcile pass re-offers the row once the broker returns.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    broker: BrokerManager,
    notifier: ProgressNotifier,
    backoff_base_seconds: i64,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: BrokerManager,
        notifier: ProgressNotifier,
        backoff_base_seconds: i64,
    ) -> Self {
        Self {
            store,
            broker,
            notifier,
            backoff_base_seconds,
        }
    }

    /// The durable store behind this queue.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// The broker behind this queue.
    pub fn broker(&self) -> &BrokerManager {
        &self.broker
    }

    /// The notifier events are published through.
    pub fn notifier(&self) -> &ProgressNotifier {
        &self.notifier
    }

    /// Enqueue a job.
    ///
    /// The row insert is the commit point; `None` means a dedup key matched
    /// an existing job and nothing was enqueued. The broker push that
    /// follows is best-effort.
    pub async fn enqueue(&self, data: CreateJob) -> AppResult<Option<Job>> {
        let Some(job) = self.store.insert(&data).await? else {
            debug!(
                kind = %data.kind,
                dedup_key = ?data.dedup_key,
                "Enqueue deduplicated against an existing job"
            );
            return Ok(None);
        };

        if let Err(e) = self.broker.push(job.kind, job.id, job.priority).await {
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                error = %e,
                "Broker push failed; job remains pending in the durable store"
            );
        }

        self.notifier.publish_job(&JobEvent::Queued {
            job_id: job.id,
            kind: job.kind.as_str().to_string(),
        });

        Ok(Some(job))
    }

    /// Look up a job by ID.
    pub async fn find(&self, id: Uuid) -> AppResult<Option<Job>> {
        self.store.find_by_id(id).await
    }

    /// Record handler progress and notify subscribers.
    pub async fn progress(&self, job_id: Uuid, percent: i16) -> AppResult<()> {
        self.store.update_progress(job_id, percent).await?;
        self.notifier.publish_job(&JobEvent::Progress { job_id, percent });
        Ok(())
    }

    /// Extend the lease on a job the worker currently owns.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<bool> {
        self.store.heartbeat(job_id, worker_id, lease_seconds).await
    }

    /// Mark a job completed.
    pub async fn complete(&self, job: &Job, result: Option<serde_json::Value>) -> AppResult<()> {
        self.store.complete(job.id, result.as_ref()).await?;
        self.notifier.publish_job(&JobEvent::Completed {
            job_id: job.id,
            kind: job.kind.as_str().to_string(),
        });
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// A permanent error, or a job out of attempt budget, lands in `failed`
    /// and the dead-letter list. A permanent failure also exhausts the
    /// attempt budget in the store, so `retry_failed` and retention see the
    /// same dead row the event announced. Anything else is rescheduled with
    /// exponential backoff.
    pub async fn fail(&self, job: &Job, error: &AppError, permanent: bool) -> AppResult<()> {
        let message = error.to_string();
        let exhausted = job.attempts >= job.max_attempts;

        if permanent || exhausted {
            self.store.fail(job.id, &message, permanent).await?;
            if let Err(e) = self.broker.dead_letter(job.kind, job.id).await {
                warn!(job_id = %job.id, error = %e, "Dead-letter push failed");
            }
            self.notifier.publish_job(&JobEvent::Failed {
                job_id: job.id,
                kind: job.kind.as_str().to_string(),
                error: message,
                dead: true,
            });
            return Ok(());
        }

        let delay = self.backoff_delay(job.attempts);
        self.store.reschedule(job.id, &message, delay).await?;
        debug!(
            job_id = %job.id,
            attempt = job.attempts,
            delay_seconds = delay,
            "Rescheduled failed attempt"
        );
        self.notifier.publish_job(&JobEvent::Failed {
            job_id: job.id,
            kind: job.kind.as_str().to_string(),
            error: message,
            dead: false,
        });
        Ok(())
    }

    /// Cancel a pending job. Returns `false` when the job was already
    /// leased, finished, or does not exist.
    pub async fn cancel(&self, job_id: Uuid) -> AppResult<bool> {
        let Some(job) = self.store.find_by_id(job_id).await? else {
            return Ok(false);
        };

        if !self.store.cancel(job_id).await? {
            return Ok(false);
        }

        if let Err(e) = self.broker.remove(job.kind, job_id).await {
            warn!(job_id = %job_id, error = %e, "Broker remove failed for cancelled job");
        }
        self.notifier.publish_job(&JobEvent::Cancelled { job_id });
        Ok(true)
    }

    /// Snapshot queue statistics from both backends.
    pub async fn stats(&self) -> AppResult<QueueStats> {
        let statuses = self.store.count_by_status().await?;

        let mut broker_depths = HashMap::new();
        if self.broker.is_available() {
            for kind in JobKind::ALL {
                match self.broker.depth(kind).await {
                    Ok(depth) => {
                        broker_depths.insert(kind.as_str().to_string(), depth);
                    }
                    Err(_) => {
                        broker_depths.clear();
                        break;
                    }
                }
            }
        }

        Ok(QueueStats {
            statuses,
            broker_available: self.broker.is_available(),
            broker_depths,
        })
    }

    /// Retry delay for the given (1-based) attempt number, doubling per
    /// attempt from the configured base, capped at an hour.
    pub fn backoff_delay(&self, attempts: i32) -> i64 {
        let exponent = (attempts - 1).clamp(0, 16) as u32;
        self.backoff_base_seconds
            .saturating_mul(1i64 << exponent.min(20))
            .min(MAX_BACKOFF_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{failing_broker, memory_queue};
    use partflow_entity::job::{JobPayload, JobPriority};

    fn thumbnail_job() -> CreateJob {
        CreateJob::from_payload(
            &JobPayload::Thumbnail {
                file_id: Uuid::new_v4(),
                source_path: "objects/ab/abcd".into(),
                sizes: vec![128],
            },
            JobPriority::Normal,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_inserts_row_and_pushes_handle() {
        let queue = memory_queue(30);
        let job = queue.enqueue(thumbnail_job()).await.unwrap().unwrap();

        assert_eq!(queue.find(job.id).await.unwrap().unwrap().id, job.id);
        assert_eq!(queue.broker().depth(JobKind::Thumbnail).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_dedup_key_is_idempotent() {
        let queue = memory_queue(30);
        let data = thumbnail_job().with_dedup_key("thumbnail:abc");

        let first = queue.enqueue(data.clone()).await.unwrap();
        let second = queue.enqueue(data).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(queue.broker().depth(JobKind::Thumbnail).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_survives_broker_outage() {
        let queue = failing_broker(30);
        let job = queue.enqueue(thumbnail_job()).await.unwrap().unwrap();

        // Row is durable even though the push failed.
        assert!(queue.find(job.id).await.unwrap().is_some());
        assert!(!queue.broker().is_available());
    }

    #[tokio::test]
    async fn test_fail_reschedules_with_backoff_until_budget_exhausted() {
        let queue = memory_queue(30);
        let job = queue.enqueue(thumbnail_job()).await.unwrap().unwrap();

        let leased = queue
            .store()
            .lease_next(JobKind::Thumbnail, "w1", 60)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.attempts, 1);

        let err = AppError::storage("boom");
        queue.fail(&leased, &err, false).await.unwrap();

        let row = queue.find(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, partflow_entity::job::JobStatus::Pending);
        assert!(row.scheduled_at.is_some());
        assert_eq!(row.last_error.as_deref(), Some("STORAGE: boom"));
    }

    #[tokio::test]
    async fn test_fail_permanent_skips_retry_budget() {
        let queue = memory_queue(30);
        queue.enqueue(thumbnail_job()).await.unwrap().unwrap();
        let leased = queue
            .store()
            .lease_next(JobKind::Thumbnail, "w1", 60)
            .await
            .unwrap()
            .unwrap();

        queue
            .fail(&leased, &AppError::validation("bad payload"), true)
            .await
            .unwrap();

        // Permanence is persisted by burning the attempt budget: the row is
        // dead even though only one attempt actually ran.
        let row = queue.find(leased.id).await.unwrap().unwrap();
        assert_eq!(row.status, partflow_entity::job::JobStatus::Failed);
        assert_eq!(row.attempts, row.max_attempts);
        assert!(row.is_dead());
    }

    #[tokio::test]
    async fn test_cancel_only_touches_pending() {
        let queue = memory_queue(30);
        let job = queue.enqueue(thumbnail_job()).await.unwrap().unwrap();
        assert!(queue.cancel(job.id).await.unwrap());

        let other = queue.enqueue(thumbnail_job()).await.unwrap().unwrap();
        queue
            .store()
            .lease_by_id(other.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();
        // Already leased; cancel must refuse.
        assert!(!queue.cancel(other.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let queue = memory_queue(30);
        assert_eq!(queue.backoff_delay(1), 30);
        assert_eq!(queue.backoff_delay(2), 60);
        assert_eq!(queue.backoff_delay(3), 120);
        assert_eq!(queue.backoff_delay(30), MAX_BACKOFF_SECONDS);
    }

    #[tokio::test]
    async fn test_stats_reports_both_backends() {
        let queue = memory_queue(30);
        queue.enqueue(thumbnail_job()).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.statuses.pending, 1);
        assert!(stats.broker_available);
        assert_eq!(stats.broker_depths["thumbnail"], 1);
    }
}
