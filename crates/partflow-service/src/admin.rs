//! Queue administration: retries, reclamation, cancellation, retention,
//! and the reconcile pass that heals the broker after an outage.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use partflow_broker::BrokerManager;
use partflow_core::events::JobEvent;
use partflow_core::result::AppResult;
use partflow_database::repositories::job::JobRef;
use partflow_notify::ProgressNotifier;

use crate::queue::{JobQueue, QueueStats};
use crate::store::JobStore;

/// Outcome of a bulk admin operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdminReport {
    /// Number of job rows affected.
    pub affected: usize,
    /// Number of handles offered to (or removed from) the broker. Lower
    /// than `affected` when the broker is unreachable.
    pub broker_synced: usize,
}

/// Administrative surface over the job queue.
///
/// Every operation works against the durable store first and treats the
/// broker as best-effort, the same discipline as `enqueue`.
#[derive(Debug, Clone)]
pub struct QueueAdmin {
    store: Arc<dyn JobStore>,
    broker: BrokerManager,
    notifier: ProgressNotifier,
}

impl QueueAdmin {
    /// Create a new queue administrator.
    pub fn new(store: Arc<dyn JobStore>, broker: BrokerManager, notifier: ProgressNotifier) -> Self {
        Self {
            store,
            broker,
            notifier,
        }
    }

    /// Build an administrator sharing a queue's store, broker, and notifier.
    pub fn for_queue(queue: &JobQueue) -> Self {
        Self::new(
            queue.store().clone(),
            queue.broker().clone(),
            queue.notifier().clone(),
        )
    }

    /// Reset failed jobs with remaining attempt budget to pending and
    /// re-offer them to the broker. Dead jobs are left for inspection.
    pub async fn retry_failed(&self) -> AppResult<AdminReport> {
        let refs = self.store.retry_failed().await?;
        let synced = self.offer(&refs).await;

        if !refs.is_empty() {
            info!(count = refs.len(), "Reset failed jobs to pending");
        }
        Ok(AdminReport {
            affected: refs.len(),
            broker_synced: synced,
        })
    }

    /// Sweep processing jobs whose lease expired past the grace window.
    ///
    /// Rows with attempt budget left go back to pending (attempt count
    /// kept) and are re-offered to the broker. Rows already at their budget
    /// are dead-lettered instead of re-offered, so a job that stalls on
    /// every attempt cannot loop forever.
    pub async fn clear_stalled(&self, grace_seconds: i64) -> AppResult<AdminReport> {
        let sweep = self.store.clear_stalled(grace_seconds).await?;
        let mut synced = self.offer(&sweep.reclaimed).await;

        for job_ref in &sweep.dead {
            match self.broker.dead_letter(job_ref.kind, job_ref.id).await {
                Ok(()) => synced += 1,
                Err(_) => break,
            }
        }
        for job_ref in &sweep.dead {
            self.notifier.publish_job(&JobEvent::Failed {
                job_id: job_ref.id,
                kind: job_ref.kind.as_str().to_string(),
                error: "Lease expired with no attempt budget remaining".to_string(),
                dead: true,
            });
        }

        if sweep.total() > 0 {
            warn!(
                reclaimed = sweep.reclaimed.len(),
                dead = sweep.dead.len(),
                "Swept stalled jobs"
            );
        }
        Ok(AdminReport {
            affected: sweep.total(),
            broker_synced: synced,
        })
    }

    /// Cancel every pending job. Processing jobs are never touched.
    pub async fn cancel_pending(&self) -> AppResult<AdminReport> {
        let refs = self.store.cancel_pending().await?;

        let mut synced = 0;
        for job_ref in &refs {
            match self.broker.remove(job_ref.kind, job_ref.id).await {
                Ok(true) => synced += 1,
                Ok(false) => {}
                Err(_) => break,
            }
        }
        for job_ref in &refs {
            self.notifier
                .publish_job(&JobEvent::Cancelled { job_id: job_ref.id });
        }

        if !refs.is_empty() {
            info!(count = refs.len(), "Cancelled pending jobs");
        }
        Ok(AdminReport {
            affected: refs.len(),
            broker_synced: synced,
        })
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn cleanup(&self, retention_days: i64) -> AppResult<AdminReport> {
        let before = Utc::now() - Duration::days(retention_days);
        let counts = self.store.cleanup(before).await?;

        if counts.total() > 0 {
            info!(
                completed = counts.completed,
                cancelled = counts.cancelled,
                failed_dead = counts.failed_dead,
                "Deleted terminal jobs past retention"
            );
        }
        Ok(AdminReport {
            affected: counts.total() as usize,
            broker_synced: 0,
        })
    }

    /// Re-offer mature pending jobs that have sat unleased past the grace
    /// window. Heals the broker after an outage or a lost push; the dedup
    /// is on the store side — a duplicate handle is harmless because only
    /// the conditional lease transfers ownership.
    pub async fn reconcile(&self, grace_seconds: i64) -> AppResult<AdminReport> {
        let refs = self.store.find_pending_for_reconcile(grace_seconds).await?;
        let synced = self.offer(&refs).await;

        if synced > 0 {
            info!(count = synced, "Re-offered pending jobs to the broker");
        }
        Ok(AdminReport {
            affected: refs.len(),
            broker_synced: synced,
        })
    }

    /// Snapshot queue statistics.
    pub async fn stats(&self) -> AppResult<QueueStats> {
        JobQueue::new(self.store.clone(), self.broker.clone(), self.notifier.clone(), 0)
            .stats()
            .await
    }

    /// Push refs to the broker, stopping at the first failure — once one
    /// push fails the rest will too, and reconcile will retry them all.
    async fn offer(&self, refs: &[JobRef]) -> usize {
        let mut synced = 0;
        for job_ref in refs {
            if self
                .broker
                .push(job_ref.kind, job_ref.id, job_ref.priority)
                .await
                .is_err()
            {
                break;
            }
            synced += 1;
        }
        synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_queue, memory_queue_with_store};
    use partflow_core::error::AppError;
    use partflow_entity::job::{CreateJob, JobKind, JobPayload, JobPriority, JobStatus};

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

    #[tokio::test]
    async fn test_clear_stalled_requires_expired_lease_past_grace() {
        let (queue, store) = memory_queue_with_store(30);
        let admin = QueueAdmin::for_queue(&queue);
        let job = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        queue
            .store()
            .lease_by_id(job.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();

        // Lease still live: nothing to reclaim, and the job stays leased.
        assert_eq!(admin.clear_stalled(10).await.unwrap().affected, 0);
        assert!(queue
            .store()
            .lease_by_id(job.id, "w2", 60)
            .await
            .unwrap()
            .is_none());

        store.expire_lease(job.id, 60);
        let report = admin.clear_stalled(10).await.unwrap();
        assert_eq!(report.affected, 1);

        // Only now is the job leasable again, attempts preserved.
        let released = queue
            .store()
            .lease_by_id(job.id, "w2", 60)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.attempts, 2);
    }

    #[tokio::test]
    async fn test_clear_stalled_dead_letters_exhausted_jobs() {
        let (queue, store) = memory_queue_with_store(30);
        let admin = QueueAdmin::for_queue(&queue);

        let job = queue
            .enqueue(cleanup_job().with_max_attempts(1))
            .await
            .unwrap()
            .unwrap();
        queue
            .store()
            .lease_by_id(job.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();
        store.expire_lease(job.id, 60);

        let report = admin.clear_stalled(10).await.unwrap();
        assert_eq!(report.affected, 1);

        // Budget gone: the job lands in failed instead of going back to
        // pending, and no worker can lease it again.
        let row = queue.find(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.is_dead());
        assert!(queue
            .store()
            .lease_by_id(job.id, "w2", 60)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_skips_permanent_failures() {
        let queue = memory_queue(30);
        let admin = QueueAdmin::for_queue(&queue);

        let job = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        let leased = queue
            .store()
            .lease_by_id(job.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();
        assert!(leased.attempts < leased.max_attempts);

        queue
            .fail(&leased, &AppError::validation("unsupported format"), true)
            .await
            .unwrap();

        // Permanent failure with budget left: retry must not resurrect it.
        let report = admin.retry_failed().await.unwrap();
        assert_eq!(report.affected, 0);
        assert_eq!(
            queue.find(job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_retry_failed_skips_dead_jobs() {
        let queue = memory_queue(30);
        let admin = QueueAdmin::for_queue(&queue);

        // One retryable failure, one dead job.
        let retryable = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        let leased = queue
            .store()
            .lease_by_id(retryable.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();
        queue.store().fail(leased.id, "transient", false).await.unwrap();

        let dead = queue
            .enqueue(cleanup_job().with_max_attempts(1))
            .await
            .unwrap()
            .unwrap();
        queue
            .store()
            .lease_by_id(dead.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();
        queue.store().fail(dead.id, "exhausted", false).await.unwrap();

        let report = admin.retry_failed().await.unwrap();
        assert_eq!(report.affected, 1);
        assert_eq!(report.broker_synced, 1);

        let retried = queue.find(retryable.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        let still_dead = queue.find(dead.id).await.unwrap().unwrap();
        assert_eq!(still_dead.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_pending_leaves_processing_untouched() {
        let queue = memory_queue(30);
        let admin = QueueAdmin::for_queue(&queue);

        let pending = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        let processing = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        queue
            .store()
            .lease_by_id(processing.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();

        let report = admin.cancel_pending().await.unwrap();
        assert_eq!(report.affected, 1);

        assert_eq!(
            queue.find(pending.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(
            queue.find(processing.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_cleanup_only_deletes_old_terminal_rows() {
        let (queue, store) = memory_queue_with_store(30);
        let admin = QueueAdmin::for_queue(&queue);

        let done = queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        queue
            .store()
            .lease_by_id(done.id, "w1", 60)
            .await
            .unwrap()
            .unwrap();
        queue.store().complete(done.id, None).await.unwrap();

        let pending = queue.enqueue(cleanup_job()).await.unwrap().unwrap();

        // Fresh rows are inside the retention window.
        assert_eq!(admin.cleanup(7).await.unwrap().affected, 0);

        store.backdate(done.id, 8 * 24 * 3600);
        store.backdate(pending.id, 8 * 24 * 3600);

        let report = admin.cleanup(7).await.unwrap();
        assert_eq!(report.affected, 1);

        // The old pending row survives regardless of age.
        assert!(queue.find(pending.id).await.unwrap().is_some());
        assert!(queue.find(done.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_reoffers_unleased_pending_jobs() {
        let (queue, store) = memory_queue_with_store(30);
        let admin = QueueAdmin::for_queue(&queue);
        let job = queue.enqueue(cleanup_job()).await.unwrap().unwrap();

        // Drain the broker handle without leasing, simulating a lost handle.
        assert_eq!(
            queue.broker().pop(JobKind::CleanupExtensions).await.unwrap(),
            Some(job.id)
        );
        assert_eq!(
            queue.broker().depth(JobKind::CleanupExtensions).await.unwrap(),
            0
        );

        // Too fresh to reconcile yet.
        assert_eq!(admin.reconcile(30).await.unwrap().broker_synced, 0);

        store.backdate(job.id, 60);
        let report = admin.reconcile(30).await.unwrap();
        assert_eq!(report.broker_synced, 1);
        assert_eq!(
            queue.broker().depth(JobKind::CleanupExtensions).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_no_concurrent_double_lease() {
        let queue = memory_queue(30);
        for _ in 0..5 {
            queue.enqueue(cleanup_job()).await.unwrap().unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..10 {
            let store = queue.store().clone();
            handles.push(tokio::spawn(async move {
                let mut leased = Vec::new();
                while let Some(job) = store
                    .lease_next(JobKind::CleanupExtensions, &format!("w{w}"), 60)
                    .await
                    .unwrap()
                {
                    leased.push(job.id);
                }
                leased
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        // 5 jobs, 10 workers: every job leased exactly once.
        assert_eq!(all.len(), 5);
    }
}
