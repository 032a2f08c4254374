//! In-memory store and broker fakes for service-layer tests.
//!
//! The memory job store mirrors the conditional-update semantics of the
//! Postgres repository: a transition only happens when the row is in the
//! expected state, so the tests cover the same races the SQL guards
//! against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use partflow_broker::backend::QueueBroker;
use partflow_broker::BrokerManager;
use partflow_broker::memory::MemoryQueueBroker;
use partflow_core::error::AppError;
use partflow_core::result::AppResult;
use partflow_database::repositories::job::{CleanupCounts, JobRef, StalledSweep, StatusCounts};
use partflow_entity::file::{CreateStoredFile, StoredFile};
use partflow_entity::job::{CreateJob, Job, JobKind, JobStatus};
use partflow_entity::upload::{CreateUploadSession, SessionStatus, UploadSession};
use partflow_notify::ProgressNotifier;

use crate::queue::JobQueue;
use crate::store::{FileStore, JobStore, SessionStore};

/// A job queue over the memory store and memory broker.
pub fn memory_queue(backoff_base_seconds: i64) -> JobQueue {
    memory_queue_with_store(backoff_base_seconds).0
}

/// Like [`memory_queue`], also handing back the concrete store for tests
/// that need to manipulate row timestamps.
pub fn memory_queue_with_store(backoff_base_seconds: i64) -> (JobQueue, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::default());
    let queue = JobQueue::new(
        store.clone(),
        BrokerManager::from_provider(Arc::new(MemoryQueueBroker::new())),
        ProgressNotifier::default(),
        backoff_base_seconds,
    );
    (queue, store)
}

/// A job queue whose broker refuses every operation.
pub fn failing_broker(backoff_base_seconds: i64) -> JobQueue {
    JobQueue::new(
        Arc::new(MemoryJobStore::default()),
        BrokerManager::from_provider(Arc::new(UnreachableBroker)),
        ProgressNotifier::default(),
        backoff_base_seconds,
    )
}

/// Broker fake that fails every call, as a disconnected Redis would.
#[derive(Debug)]
pub struct UnreachableBroker;

#[async_trait]
impl QueueBroker for UnreachableBroker {
    fn provider_type(&self) -> &str {
        "unreachable"
    }

    async fn health_check(&self) -> AppResult<bool> {
        Err(AppError::broker("connection refused"))
    }

    async fn push(&self, _kind: JobKind, _job_id: Uuid, _priority: partflow_entity::job::JobPriority) -> AppResult<()> {
        Err(AppError::broker("connection refused"))
    }

    async fn pop(&self, _kind: JobKind) -> AppResult<Option<Uuid>> {
        Err(AppError::broker("connection refused"))
    }

    async fn remove(&self, _kind: JobKind, _job_id: Uuid) -> AppResult<bool> {
        Err(AppError::broker("connection refused"))
    }

    async fn dead_letter(&self, _kind: JobKind, _job_id: Uuid) -> AppResult<()> {
        Err(AppError::broker("connection refused"))
    }

    async fn depth(&self, _kind: JobKind) -> AppResult<u64> {
        Err(AppError::broker("connection refused"))
    }
}

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    /// Force a row's lease expiry into the past, simulating a worker that
    /// stopped heartbeating.
    pub fn expire_lease(&self, id: Uuid, seconds_ago: i64) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.get_mut(&id) {
            job.lease_expires_at = Some(Utc::now() - Duration::seconds(seconds_ago));
        }
    }

    /// Backdate a row's updated_at, for retention and reconcile tests.
    pub fn backdate(&self, id: Uuid, seconds_ago: i64) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.get_mut(&id) {
            job.updated_at = Utc::now() - Duration::seconds(seconds_ago);
        }
    }

    fn mature(job: &Job, now: DateTime<Utc>) -> bool {
        job.scheduled_at.is_none_or(|at| at <= now)
    }

    fn lease(job: &mut Job, worker_id: &str, lease_seconds: i64, now: DateTime<Utc>) {
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.attempts += 1;
        job.started_at = job.started_at.or(Some(now));
        job.lease_expires_at = Some(now + Duration::seconds(lease_seconds));
        job.updated_at = now;
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, data: &CreateJob) -> AppResult<Option<Job>> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(key) = &data.dedup_key {
            if rows.values().any(|j| j.dedup_key.as_ref() == Some(key)) {
                return Ok(None);
            }
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            kind: data.kind,
            priority: data.priority,
            payload: data.payload.clone(),
            result: None,
            last_error: None,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: data.max_attempts,
            progress: 0,
            dedup_key: data.dedup_key.clone(),
            scheduled_at: data.scheduled_at,
            lease_expires_at: None,
            worker_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        rows.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Job>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn lease_next(
        &self,
        kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();

        let next = rows
            .values()
            .filter(|j| j.kind == kind && j.status == JobStatus::Pending && Self::mature(j, now))
            .max_by_key(|j| (j.priority, std::cmp::Reverse(j.created_at)))
            .map(|j| j.id);

        let Some(id) = next else { return Ok(None) };
        let job = rows.get_mut(&id).map(|j| {
            Self::lease(j, worker_id, lease_seconds, now);
            j.clone()
        });
        Ok(job)
    }

    async fn lease_by_id(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> AppResult<Option<Job>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending && Self::mature(job, now) => {
                Self::lease(job, worker_id, lease_seconds, now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str, lease_seconds: i64) -> AppResult<bool> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.worker_id.as_deref() == Some(worker_id) =>
            {
                job.lease_expires_at = Some(now + Duration::seconds(lease_seconds));
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(&self, id: Uuid, percent: i16) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.progress = percent.clamp(0, 100);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid, result: Option<&serde_json::Value>) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Completed;
                job.result = result.cloned();
                job.progress = 100;
                job.lease_expires_at = None;
                job.finished_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error_message: &str, permanent: bool) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Failed;
                job.last_error = Some(error_message.to_string());
                if permanent {
                    job.attempts = job.attempts.max(job.max_attempts);
                }
                job.lease_expires_at = None;
                job.finished_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, error_message: &str, delay_seconds: i64) -> AppResult<()> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.last_error = Some(error_message.to_string());
                job.scheduled_at = Some(now + Duration::seconds(delay_seconds));
                job.lease_expires_at = None;
                job.worker_id = None;
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry_failed(&self) -> AppResult<Vec<JobRef>> {
        let mut rows = self.rows.lock().unwrap();
        let mut refs = Vec::new();
        for job in rows.values_mut() {
            if job.status == JobStatus::Failed && job.attempts < job.max_attempts {
                job.status = JobStatus::Pending;
                job.last_error = None;
                job.scheduled_at = None;
                job.lease_expires_at = None;
                job.worker_id = None;
                job.finished_at = None;
                job.updated_at = Utc::now();
                refs.push(JobRef {
                    id: job.id,
                    kind: job.kind,
                    priority: job.priority,
                });
            }
        }
        Ok(refs)
    }

    async fn clear_stalled(&self, grace_seconds: i64) -> AppResult<StalledSweep> {
        let cutoff = Utc::now() - Duration::seconds(grace_seconds);
        let mut rows = self.rows.lock().unwrap();
        let mut sweep = StalledSweep::default();
        for job in rows.values_mut() {
            if job.status == JobStatus::Processing
                && job.lease_expires_at.is_some_and(|at| at < cutoff)
            {
                let job_ref = JobRef {
                    id: job.id,
                    kind: job.kind,
                    priority: job.priority,
                };
                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.last_error =
                        Some("Lease expired with no attempt budget remaining".to_string());
                    job.finished_at = Some(Utc::now());
                    sweep.dead.push(job_ref);
                } else {
                    job.status = JobStatus::Pending;
                    sweep.reclaimed.push(job_ref);
                }
                job.lease_expires_at = None;
                job.worker_id = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(sweep)
    }

    async fn cancel_pending(&self) -> AppResult<Vec<JobRef>> {
        let mut rows = self.rows.lock().unwrap();
        let mut refs = Vec::new();
        for job in rows.values_mut() {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                job.updated_at = Utc::now();
                refs.push(JobRef {
                    id: job.id,
                    kind: job.kind,
                    priority: job.priority,
                });
            }
        }
        Ok(refs)
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> AppResult<CleanupCounts> {
        let mut rows = self.rows.lock().unwrap();
        let mut counts = CleanupCounts::default();
        rows.retain(|_, job| {
            let deletable = job.updated_at < before
                && match job.status {
                    JobStatus::Completed => {
                        counts.completed += 1;
                        true
                    }
                    JobStatus::Cancelled => {
                        counts.cancelled += 1;
                        true
                    }
                    JobStatus::Failed if job.attempts >= job.max_attempts => {
                        counts.failed_dead += 1;
                        true
                    }
                    _ => false,
                };
            !deletable
        });
        Ok(counts)
    }

    async fn find_pending_for_reconcile(&self, grace_seconds: i64) -> AppResult<Vec<JobRef>> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(grace_seconds);
        let rows = self.rows.lock().unwrap();
        let mut pending: Vec<_> = rows
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending && Self::mature(j, now) && j.updated_at < cutoff
            })
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending
            .into_iter()
            .map(|j| JobRef {
                id: j.id,
                kind: j.kind,
                priority: j.priority,
            })
            .collect())
    }

    async fn count_by_status(&self) -> AppResult<StatusCounts> {
        let rows = self.rows.lock().unwrap();
        let mut counts = StatusCounts::default();
        for job in rows.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }
}

/// In-memory [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    rows: Mutex<HashMap<Uuid, UploadSession>>,
}

impl MemorySessionStore {
    /// Backdate a session's expiry, for sweep tests.
    pub fn force_expiry(&self, id: Uuid) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(s) = rows.get_mut(&id) {
            s.expires_at = Utc::now() - Duration::minutes(1);
        }
    }

    fn received(session: &UploadSession) -> Vec<i32> {
        serde_json::from_value(session.received_chunks.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, data: &CreateUploadSession) -> AppResult<UploadSession> {
        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            owner_id: data.owner_id,
            file_name: data.file_name.clone(),
            total_size: data.total_size,
            chunk_size: data.chunk_size,
            total_chunks: data.total_chunks,
            received_chunks: serde_json::json!([]),
            declared_sha256: data.declared_sha256.clone(),
            mime_type: data.mime_type.clone(),
            status: SessionStatus::Open,
            finalized_file_id: None,
            assembly_started_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            expires_at: data.expires_at,
        };
        self.rows.lock().unwrap().insert(session.id, session.clone());
        Ok(session)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<UploadSession>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn record_chunk(&self, id: Uuid, index: i32) -> AppResult<Option<UploadSession>> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(session) if session.status == SessionStatus::Open => {
                let mut received = Self::received(session);
                if received.contains(&index) {
                    return Ok(None);
                }
                received.push(index);
                session.received_chunks = serde_json::json!(received);
                session.updated_at = Utc::now();
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn begin_assembly(
        &self,
        id: Uuid,
        assembly_ttl_seconds: i64,
        failed_retry_window_minutes: i64,
    ) -> AppResult<Option<UploadSession>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let Some(session) = rows.get_mut(&id) else {
            return Ok(None);
        };

        let eligible = match session.status {
            SessionStatus::Open => true,
            SessionStatus::Assembling => session
                .assembly_started_at
                .is_some_and(|at| at < now - Duration::seconds(assembly_ttl_seconds)),
            SessionStatus::FailedAssembly => {
                session.updated_at > now - Duration::minutes(failed_retry_window_minutes)
            }
            _ => false,
        };
        if !eligible {
            return Ok(None);
        }

        session.status = SessionStatus::Assembling;
        session.assembly_started_at = Some(now);
        session.updated_at = now;
        Ok(Some(session.clone()))
    }

    async fn mark_finalized(&self, id: Uuid, file_id: Uuid) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(session) = rows.get_mut(&id) {
            if session.status == SessionStatus::Assembling {
                session.status = SessionStatus::Finalized;
                session.finalized_file_id = Some(file_id);
                session.last_error = None;
                session.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_failed_assembly(&self, id: Uuid, error: &str) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(session) = rows.get_mut(&id) {
            if session.status == SessionStatus::Assembling {
                session.status = SessionStatus::FailedAssembly;
                session.last_error = Some(error.to_string());
                session.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn reopen(&self, id: Uuid, error: &str) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(session) = rows.get_mut(&id) {
            if session.status == SessionStatus::Assembling {
                session.status = SessionStatus::Open;
                session.assembly_started_at = None;
                session.last_error = Some(error.to_string());
                session.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn expire_stale(&self, failed_retention_minutes: i64) -> AppResult<Vec<UploadSession>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let mut expired = Vec::new();
        for session in rows.values_mut() {
            let stale = match session.status {
                SessionStatus::Open => session.expires_at < now,
                SessionStatus::FailedAssembly => {
                    session.updated_at < now - Duration::minutes(failed_retention_minutes)
                }
                _ => false,
            };
            if stale {
                session.status = SessionStatus::Expired;
                session.updated_at = now;
                expired.push(session.clone());
            }
        }
        Ok(expired)
    }
}

/// In-memory [`FileStore`].
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    rows: Mutex<HashMap<Uuid, StoredFile>>,
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn create(&self, data: &CreateStoredFile) -> AppResult<StoredFile> {
        let file = StoredFile {
            id: Uuid::new_v4(),
            owner_id: data.owner_id,
            name: data.name.clone(),
            storage_path: data.storage_path.clone(),
            size_bytes: data.size_bytes,
            checksum_sha256: data.checksum_sha256.clone(),
            mime_type: data.mime_type.clone(),
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().insert(file.id, file.clone());
        Ok(file)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<StoredFile>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }
}
