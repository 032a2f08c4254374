//! Persistence seams for the service layer.
//!
//! Services talk to these traits rather than to the sqlx repositories
//! directly, so the queue and upload logic can be exercised against
//! in-memory stores. The production implementations forward to
//! `partflow-database`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use partflow_core::result::AppResult;
use partflow_database::repositories::job::{
    CleanupCounts, JobRef, JobRepository, StalledSweep, StatusCounts,
};
use partflow_database::repositories::{FileRepository, UploadSessionRepository};
use partflow_entity::file::{CreateStoredFile, StoredFile};
use partflow_entity::job::{CreateJob, Job, JobKind};
use partflow_entity::upload::{CreateUploadSession, UploadSession};

/// Durable job-row store backing the queue.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Insert a pending job; `None` on a dedup-key collision.
    async fn insert(&self, data: &CreateJob) -> AppResult<Option<Job>>;
    /// Find a job by ID.
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Job>>;
    /// Lease the next mature pending job of a kind.
    async fn lease_next(
        &self,
        kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>>;
    /// Lease a specific pending job (broker-popped handle).
    async fn lease_by_id(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>>;
    /// Extend a lease; `false` when the worker no longer owns the job.
    async fn heartbeat(&self, id: Uuid, worker_id: &str, lease_seconds: i64) -> AppResult<bool>;
    /// Record handler-reported progress.
    async fn update_progress(&self, id: Uuid, percent: i16) -> AppResult<()>;
    /// Mark a processing job completed.
    async fn complete(&self, id: Uuid, result: Option<&serde_json::Value>) -> AppResult<()>;
    /// Mark a processing job failed; a permanent failure also exhausts the
    /// attempt budget so nothing resurrects the row.
    async fn fail(&self, id: Uuid, error_message: &str, permanent: bool) -> AppResult<()>;
    /// Return a processing job to pending with a retry delay.
    async fn reschedule(&self, id: Uuid, error_message: &str, delay_seconds: i64) -> AppResult<()>;
    /// Cancel a single pending job.
    async fn cancel(&self, id: Uuid) -> AppResult<bool>;
    /// Reset retryable failed jobs to pending.
    async fn retry_failed(&self) -> AppResult<Vec<JobRef>>;
    /// Sweep processing jobs whose lease expired past the grace window,
    /// splitting reclaimed rows from out-of-budget ones.
    async fn clear_stalled(&self, grace_seconds: i64) -> AppResult<StalledSweep>;
    /// Cancel every pending job.
    async fn cancel_pending(&self) -> AppResult<Vec<JobRef>>;
    /// Delete terminal jobs older than the cutoff.
    async fn cleanup(&self, before: DateTime<Utc>) -> AppResult<CleanupCounts>;
    /// Mature pending jobs that have sat unleased past the grace window.
    async fn find_pending_for_reconcile(&self, grace_seconds: i64) -> AppResult<Vec<JobRef>>;
    /// Per-status job counts.
    async fn count_by_status(&self) -> AppResult<StatusCounts>;
}

#[async_trait]
impl JobStore for JobRepository {
    async fn insert(&self, data: &CreateJob) -> AppResult<Option<Job>> {
        JobRepository::insert(self, data).await
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Job>> {
        JobRepository::find_by_id(self, id).await
    }

    async fn lease_next(
        &self,
        kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>> {
        JobRepository::lease_next(self, kind, worker_id, lease_seconds).await
    }

    async fn lease_by_id(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>> {
        JobRepository::lease_by_id(self, id, worker_id, lease_seconds).await
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str, lease_seconds: i64) -> AppResult<bool> {
        JobRepository::heartbeat(self, id, worker_id, lease_seconds).await
    }

    async fn update_progress(&self, id: Uuid, percent: i16) -> AppResult<()> {
        JobRepository::update_progress(self, id, percent).await
    }

    async fn complete(&self, id: Uuid, result: Option<&serde_json::Value>) -> AppResult<()> {
        JobRepository::complete(self, id, result).await
    }

    async fn fail(&self, id: Uuid, error_message: &str, permanent: bool) -> AppResult<()> {
        JobRepository::fail(self, id, error_message, permanent).await
    }

    async fn reschedule(&self, id: Uuid, error_message: &str, delay_seconds: i64) -> AppResult<()> {
        JobRepository::reschedule(self, id, error_message, delay_seconds).await
    }

    async fn cancel(&self, id: Uuid) -> AppResult<bool> {
        JobRepository::cancel(self, id).await
    }

    async fn retry_failed(&self) -> AppResult<Vec<JobRef>> {
        JobRepository::retry_failed(self).await
    }

    async fn clear_stalled(&self, grace_seconds: i64) -> AppResult<StalledSweep> {
        JobRepository::clear_stalled(self, grace_seconds).await
    }

    async fn cancel_pending(&self) -> AppResult<Vec<JobRef>> {
        JobRepository::cancel_pending(self).await
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> AppResult<CleanupCounts> {
        JobRepository::cleanup(self, before).await
    }

    async fn find_pending_for_reconcile(&self, grace_seconds: i64) -> AppResult<Vec<JobRef>> {
        JobRepository::find_pending_for_reconcile(self, grace_seconds).await
    }

    async fn count_by_status(&self) -> AppResult<StatusCounts> {
        JobRepository::count_by_status(self).await
    }
}

/// Durable upload-session store.
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Open a new session.
    async fn create(&self, data: &CreateUploadSession) -> AppResult<UploadSession>;
    /// Find a session by ID.
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<UploadSession>>;
    /// Record a chunk index; `None` when the session is not open or the
    /// index is a duplicate.
    async fn record_chunk(&self, id: Uuid, index: i32) -> AppResult<Option<UploadSession>>;
    /// Acquire the finalize lock (`open -> assembling`).
    async fn begin_assembly(
        &self,
        id: Uuid,
        assembly_ttl_seconds: i64,
        failed_retry_window_minutes: i64,
    ) -> AppResult<Option<UploadSession>>;
    /// Mark a session finalized with its registered file.
    async fn mark_finalized(&self, id: Uuid, file_id: Uuid) -> AppResult<()>;
    /// Record an integrity failure.
    async fn mark_failed_assembly(&self, id: Uuid, error: &str) -> AppResult<()>;
    /// Release the finalize lock after a transient failure.
    async fn reopen(&self, id: Uuid, error: &str) -> AppResult<()>;
    /// Expire timed-out sessions, returning them for chunk purging.
    async fn expire_stale(&self, failed_retention_minutes: i64) -> AppResult<Vec<UploadSession>>;
}

#[async_trait]
impl SessionStore for UploadSessionRepository {
    async fn create(&self, data: &CreateUploadSession) -> AppResult<UploadSession> {
        UploadSessionRepository::create(self, data).await
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<UploadSession>> {
        UploadSessionRepository::find_by_id(self, id).await
    }

    async fn record_chunk(&self, id: Uuid, index: i32) -> AppResult<Option<UploadSession>> {
        UploadSessionRepository::record_chunk(self, id, index).await
    }

    async fn begin_assembly(
        &self,
        id: Uuid,
        assembly_ttl_seconds: i64,
        failed_retry_window_minutes: i64,
    ) -> AppResult<Option<UploadSession>> {
        UploadSessionRepository::begin_assembly(
            self,
            id,
            assembly_ttl_seconds,
            failed_retry_window_minutes,
        )
        .await
    }

    async fn mark_finalized(&self, id: Uuid, file_id: Uuid) -> AppResult<()> {
        UploadSessionRepository::mark_finalized(self, id, file_id).await
    }

    async fn mark_failed_assembly(&self, id: Uuid, error: &str) -> AppResult<()> {
        UploadSessionRepository::mark_failed_assembly(self, id, error).await
    }

    async fn reopen(&self, id: Uuid, error: &str) -> AppResult<()> {
        UploadSessionRepository::reopen(self, id, error).await
    }

    async fn expire_stale(&self, failed_retention_minutes: i64) -> AppResult<Vec<UploadSession>> {
        UploadSessionRepository::expire_stale(self, failed_retention_minutes).await
    }
}

/// Registered-file store.
#[async_trait]
pub trait FileStore: Send + Sync + std::fmt::Debug {
    /// Register a file.
    async fn create(&self, data: &CreateStoredFile) -> AppResult<StoredFile>;
    /// Find a file by ID.
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<StoredFile>>;
}

#[async_trait]
impl FileStore for FileRepository {
    async fn create(&self, data: &CreateStoredFile) -> AppResult<StoredFile> {
        FileRepository::create(self, data).await
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<StoredFile>> {
        FileRepository::find_by_id(self, id).await
    }
}
