//! Job repository implementation.
//!
//! Every queue-critical transition is a single conditional `UPDATE` so that
//! concurrent workers and admin passes never race a read-then-write window.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use partflow_core::error::{AppError, ErrorKind};
use partflow_core::result::AppResult;
use partflow_entity::job::{CreateJob, Job, JobKind, JobPriority, JobStatus};

/// Priority ordering expression shared by the lease queries.
const PRIORITY_ORDER: &str = "CASE priority \
     WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 WHEN 'low' THEN 3 END";

/// A lightweight job reference returned by bulk admin operations, carrying
/// just enough to re-offer the job to the broker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRef {
    /// The job ID.
    pub id: Uuid,
    /// The job kind.
    pub kind: JobKind,
    /// The job priority.
    pub priority: JobPriority,
}

/// Outcome of a stalled-job sweep, split by what happened to each row.
#[derive(Debug, Clone, Default)]
pub struct StalledSweep {
    /// Rows with attempt budget left, reset to pending.
    pub reclaimed: Vec<JobRef>,
    /// Rows out of attempt budget, moved to failed.
    pub dead: Vec<JobRef>,
}

impl StalledSweep {
    /// Total rows touched by the sweep.
    pub fn total(&self) -> usize {
        self.reclaimed.len() + self.dead.len()
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusCounts {
    /// Jobs waiting to be leased.
    pub pending: i64,
    /// Jobs currently leased.
    pub processing: i64,
    /// Successfully completed jobs.
    pub completed: i64,
    /// Failed jobs (retryable and dead).
    pub failed: i64,
    /// Cancelled jobs.
    pub cancelled: i64,
}

/// Counts of terminal jobs deleted by a cleanup pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CleanupCounts {
    /// Completed jobs deleted.
    pub completed: u64,
    /// Cancelled jobs deleted.
    pub cancelled: u64,
    /// Dead failed jobs deleted.
    pub failed_dead: u64,
}

impl CleanupCounts {
    /// Total jobs deleted.
    pub fn total(&self) -> u64 {
        self.completed + self.cancelled + self.failed_dead
    }
}

/// Repository for background job rows and queue transitions.
#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    /// Create a new job repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a job by ID.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find job", e))
    }

    /// Find a job by its deduplication key.
    pub async fn find_by_dedup_key(&self, key: &str) -> AppResult<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE dedup_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to find job by dedup key", e)
            })
    }

    /// Insert a new pending job row. This is the durable commit point of
    /// `enqueue`: once this returns, the job cannot be lost.
    ///
    /// Returns `None` when a dedup key collides with an existing row, which
    /// makes re-running the enqueue step after a partial failure a no-op.
    pub async fn insert(&self, data: &CreateJob) -> AppResult<Option<Job>> {
        sqlx::query_as::<_, Job>(
            "INSERT INTO jobs (kind, priority, payload, max_attempts, dedup_key, scheduled_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (dedup_key) DO NOTHING \
             RETURNING *",
        )
        .bind(data.kind)
        .bind(data.priority)
        .bind(&data.payload)
        .bind(data.max_attempts)
        .bind(&data.dedup_key)
        .bind(data.scheduled_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to insert job", e))
    }

    /// Atomically lease the next mature pending job of a kind.
    ///
    /// Exactly one caller wins per job under concurrency: the claim is a
    /// conditional update over a `FOR UPDATE SKIP LOCKED` sub-select, never
    /// a read-then-write. The attempt counter increments here and only here.
    pub async fn lease_next(
        &self,
        kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>> {
        let sql = format!(
            "UPDATE jobs SET status = 'processing', worker_id = $2, \
             attempts = attempts + 1, \
             started_at = COALESCE(started_at, NOW()), \
             lease_expires_at = NOW() + make_interval(secs => $3), \
             updated_at = NOW() \
             WHERE id = ( \
                SELECT id FROM jobs \
                WHERE kind = $1 AND status = 'pending' \
                AND (scheduled_at IS NULL OR scheduled_at <= NOW()) \
                ORDER BY {PRIORITY_ORDER}, created_at ASC \
                FOR UPDATE SKIP LOCKED \
                LIMIT 1 \
             ) RETURNING *"
        );

        sqlx::query_as::<_, Job>(&sql)
            .bind(kind)
            .bind(worker_id)
            .bind(lease_seconds as f64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to lease job", e))
    }

    /// Atomically lease a specific job popped from the broker.
    ///
    /// Returns `None` when the job was already claimed, cancelled, or not
    /// yet mature — a stale broker handle is harmless.
    pub async fn lease_by_id(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>> {
        sqlx::query_as::<_, Job>(
            "UPDATE jobs SET status = 'processing', worker_id = $2, \
             attempts = attempts + 1, \
             started_at = COALESCE(started_at, NOW()), \
             lease_expires_at = NOW() + make_interval(secs => $3), \
             updated_at = NOW() \
             WHERE id = $1 AND status = 'pending' \
             AND (scheduled_at IS NULL OR scheduled_at <= NOW()) \
             RETURNING *",
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease_seconds as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to lease job by id", e))
    }

    /// Extend the lease on a processing job. Returns `false` if the caller
    /// no longer owns the job.
    pub async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = NOW() + make_interval(secs => $3), \
             updated_at = NOW() \
             WHERE id = $1 AND status = 'processing' AND worker_id = $2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease_seconds as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to heartbeat job", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Record handler-reported progress.
    pub async fn update_progress(&self, id: Uuid, percent: i16) -> AppResult<()> {
        sqlx::query(
            "UPDATE jobs SET progress = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(percent.clamp(0, 100))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to update progress", e))?;
        Ok(())
    }

    /// Mark a processing job as completed.
    pub async fn complete(&self, id: Uuid, result: Option<&serde_json::Value>) -> AppResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', result = $2, progress = 100, \
             lease_expires_at = NULL, finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to complete job", e))?;
        Ok(())
    }

    /// Mark a processing job as failed. The row is kept (not deleted) so a
    /// dead job remains inspectable and a retryable one can be reset.
    ///
    /// A permanent failure exhausts the attempt budget in the same update,
    /// so `retry_failed` and retention treat the row as dead no matter how
    /// many attempts it had left.
    pub async fn fail(&self, id: Uuid, error_message: &str, permanent: bool) -> AppResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = $2, \
             attempts = CASE WHEN $3 THEN GREATEST(attempts, max_attempts) ELSE attempts END, \
             lease_expires_at = NULL, finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(error_message)
        .bind(permanent)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to mark job failed", e))?;
        Ok(())
    }

    /// Return a failed processing attempt to pending with a backoff delay,
    /// keeping the error for diagnostics.
    pub async fn reschedule(
        &self,
        id: Uuid,
        error_message: &str,
        delay_seconds: i64,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'pending', last_error = $2, \
             scheduled_at = NOW() + make_interval(secs => $3), \
             lease_expires_at = NULL, worker_id = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(error_message)
        .bind(delay_seconds as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to reschedule job", e))?;
        Ok(())
    }

    /// Cancel a single pending job.
    pub async fn cancel(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to cancel job", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Reset failed jobs with remaining attempt budget to pending.
    /// Dead jobs (attempts >= max) are left for inspection.
    pub async fn retry_failed(&self) -> AppResult<Vec<JobRef>> {
        sqlx::query_as::<_, JobRef>(
            "UPDATE jobs SET status = 'pending', last_error = NULL, \
             scheduled_at = NULL, lease_expires_at = NULL, worker_id = NULL, \
             finished_at = NULL, updated_at = NOW() \
             WHERE status = 'failed' AND attempts < max_attempts \
             RETURNING id, kind, priority",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to retry failed jobs", e))
    }

    /// Sweep processing jobs whose lease expired past the grace window.
    ///
    /// Rows with attempt budget left go back to pending with their attempt
    /// count kept; rows already at their budget move to failed instead, so
    /// a job that stalls on every attempt cannot be re-leased forever.
    pub async fn clear_stalled(&self, grace_seconds: i64) -> AppResult<StalledSweep> {
        let dead = sqlx::query_as::<_, JobRef>(
            "UPDATE jobs SET status = 'failed', \
             last_error = 'Lease expired with no attempt budget remaining', \
             lease_expires_at = NULL, worker_id = NULL, \
             finished_at = NOW(), updated_at = NOW() \
             WHERE status = 'processing' \
             AND lease_expires_at < NOW() - make_interval(secs => $1) \
             AND attempts >= max_attempts \
             RETURNING id, kind, priority",
        )
        .bind(grace_seconds as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to dead-letter stalled jobs", e)
        })?;

        let reclaimed = sqlx::query_as::<_, JobRef>(
            "UPDATE jobs SET status = 'pending', \
             lease_expires_at = NULL, worker_id = NULL, updated_at = NOW() \
             WHERE status = 'processing' \
             AND lease_expires_at < NOW() - make_interval(secs => $1) \
             AND attempts < max_attempts \
             RETURNING id, kind, priority",
        )
        .bind(grace_seconds as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to clear stalled jobs", e)
        })?;

        Ok(StalledSweep { reclaimed, dead })
    }

    /// Cancel all pending jobs. Processing jobs are never touched.
    pub async fn cancel_pending(&self) -> AppResult<Vec<JobRef>> {
        sqlx::query_as::<_, JobRef>(
            "UPDATE jobs SET status = 'cancelled', finished_at = NOW(), updated_at = NOW() \
             WHERE status = 'pending' \
             RETURNING id, kind, priority",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to cancel pending jobs", e))
    }

    /// Delete terminal jobs older than the cutoff: completed, cancelled,
    /// and dead failed rows. Pending and processing rows are never deleted
    /// regardless of age; retryable failed rows are also kept.
    pub async fn cleanup(&self, before: DateTime<Utc>) -> AppResult<CleanupCounts> {
        let statuses: Vec<JobStatus> = sqlx::query_scalar(
            "DELETE FROM jobs \
             WHERE updated_at < $1 AND ( \
                status IN ('completed', 'cancelled') \
                OR (status = 'failed' AND attempts >= max_attempts) \
             ) RETURNING status",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to cleanup jobs", e))?;

        let mut counts = CleanupCounts::default();
        for status in statuses {
            match status {
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
                JobStatus::Failed => counts.failed_dead += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Find mature pending jobs that have sat unleased for longer than the
    /// grace period — candidates for re-offering to the broker.
    pub async fn find_pending_for_reconcile(&self, grace_seconds: i64) -> AppResult<Vec<JobRef>> {
        sqlx::query_as::<_, JobRef>(
            "SELECT id, kind, priority FROM jobs \
             WHERE status = 'pending' \
             AND (scheduled_at IS NULL OR scheduled_at <= NOW()) \
             AND updated_at < NOW() - make_interval(secs => $1) \
             ORDER BY created_at ASC",
        )
        .bind(grace_seconds as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to scan pending jobs", e)
        })
    }

    /// Count jobs per status.
    pub async fn count_by_status(&self) -> AppResult<StatusCounts> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to count jobs", e)
                })?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Processing => counts.processing = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
                JobStatus::Cancelled => counts.cancelled = count,
            }
        }
        Ok(counts)
    }
}
