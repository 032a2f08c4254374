//! Handler registry and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use partflow_core::error::AppError;
use partflow_entity::job::{Job, JobKind};
use partflow_service::JobQueue;

/// Outcome classification for a failed execution attempt.
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// Retrying cannot help (bad payload, undecodable input).
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    /// Worth retrying after backoff (I/O, tool unavailable).
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// Infrastructure error surfaced from below; treated as transient.
    #[error("Internal error: {0}")]
    Internal(#[from] AppError),
}

/// Per-execution context handed to handlers.
///
/// Progress reports are best-effort: a failure to record one is logged and
/// never fails the job.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: Uuid,
    queue: JobQueue,
}

impl JobContext {
    /// Create a context for one job execution.
    pub fn new(job_id: Uuid, queue: JobQueue) -> Self {
        Self { job_id, queue }
    }

    /// The job being executed.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Report execution progress (0-100).
    pub async fn progress(&self, percent: i16) {
        if let Err(e) = self.queue.progress(self.job_id, percent).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to record job progress");
        }
    }
}

/// A handler for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// The kind this handler processes.
    fn kind(&self) -> JobKind;

    /// Execute the job.
    async fn execute(&self, job: &Job, ctx: &JobContext)
        -> Result<Option<Value>, JobExecutionError>;
}

/// Dispatches jobs to the handler registered for their kind.
#[derive(Debug, Default)]
pub struct JobExecutor {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The kind is taken from the handler itself, so a
    /// handler can never be registered under the wrong kind.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let kind = handler.kind();
        info!(kind = %kind, "Registered job handler");
        self.handlers.insert(kind, handler);
    }

    /// Execute a job through its handler.
    pub async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
    ) -> Result<Option<Value>, JobExecutionError> {
        let handler = self.handlers.get(&job.kind).ok_or_else(|| {
            JobExecutionError::Permanent(format!("No handler registered for kind '{}'", job.kind))
        })?;

        info!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Executing job"
        );
        handler.execute(job, ctx).await
    }

    /// Whether a handler is registered for a kind.
    pub fn has_handler(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Kinds with a registered handler.
    pub fn registered_kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use partflow_entity::job::{JobPriority, JobStatus};

    #[derive(Debug)]
    struct NoopHandler(JobKind);

    #[async_trait]
    impl JobHandler for NoopHandler {
        fn kind(&self) -> JobKind {
            self.0
        }

        async fn execute(
            &self,
            _job: &Job,
            _ctx: &JobContext,
        ) -> Result<Option<Value>, JobExecutionError> {
            Ok(Some(serde_json::json!({"ok": true})))
        }
    }

    fn job(kind: JobKind) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            kind,
            priority: JobPriority::Normal,
            payload: serde_json::json!({}),
            result: None,
            last_error: None,
            status: JobStatus::Processing,
            attempts: 1,
            max_attempts: 3,
            progress: 0,
            dedup_key: None,
            scheduled_at: None,
            lease_expires_at: None,
            worker_id: Some("w1".into()),
            created_at: now,
            started_at: Some(now),
            finished_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn test_register_keys_by_handler_kind() {
        let mut executor = JobExecutor::new();
        executor.register(Arc::new(NoopHandler(JobKind::Thumbnail)));

        assert!(executor.has_handler(JobKind::Thumbnail));
        assert!(!executor.has_handler(JobKind::Transcode));
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_permanent_failure() {
        let executor = JobExecutor::new();
        let ctx = JobContext::new(Uuid::new_v4(), partflow_service::testing::memory_queue(30));

        let err = executor
            .execute(&job(JobKind::Compress), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, JobExecutionError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_registered_handler() {
        let mut executor = JobExecutor::new();
        executor.register(Arc::new(NoopHandler(JobKind::Thumbnail)));
        let ctx = JobContext::new(Uuid::new_v4(), partflow_service::testing::memory_queue(30));

        let result = executor
            .execute(&job(JobKind::Thumbnail), &ctx)
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!({"ok": true})));
    }
}
