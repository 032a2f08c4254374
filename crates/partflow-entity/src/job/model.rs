//! Job entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use partflow_core::error::AppError;
use partflow_core::result::AppResult;

use super::kind::JobKind;
use super::payload::JobPayload;
use super::status::{JobPriority, JobStatus};

/// A background job row — the durable mirror of a queued work item.
///
/// The row is the ground truth: the broker handle is an accelerant that may
/// be lost without losing the job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,
    /// Job kind discriminant.
    pub kind: JobKind,
    /// Job priority.
    pub priority: JobPriority,
    /// Kind-specific payload (JSON, deserializes to [`JobPayload`]).
    pub payload: serde_json::Value,
    /// Result data on completion (JSON).
    pub result: Option<serde_json::Value>,
    /// Last recorded error message.
    pub last_error: Option<String>,
    /// Current job status.
    pub status: JobStatus,
    /// Number of times a worker began executing this job.
    pub attempts: i32,
    /// Maximum allowed attempts.
    pub max_attempts: i32,
    /// Handler-reported progress percentage (0-100).
    pub progress: i16,
    /// Deduplication key; enqueueing the same key twice is a no-op.
    pub dedup_key: Option<String>,
    /// Earliest time the job may be leased (retry backoff).
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Lease expiry while a worker owns the job.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Worker that currently holds (or last held) the lease.
    pub worker_id: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When a worker first started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Check if the job can be retried.
    pub fn can_retry(&self) -> bool {
        self.status.can_retry() && self.attempts < self.max_attempts
    }

    /// Check if the job exhausted its retry budget (dead-letter).
    pub fn is_dead(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts >= self.max_attempts
    }

    /// Check if the job's lease has expired (stalled).
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.is_some_and(|exp| exp < now)
    }

    /// Deserialize the payload column against the typed sum type.
    pub fn typed_payload(&self) -> AppResult<JobPayload> {
        let payload: JobPayload = serde_json::from_value(self.payload.clone())?;
        if payload.kind() != self.kind {
            return Err(AppError::internal(format!(
                "Job {} payload kind '{}' does not match row kind '{}'",
                self.id,
                payload.kind(),
                self.kind
            )));
        }
        Ok(payload)
    }
}

/// Data required to create a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJob {
    /// Job kind discriminant.
    pub kind: JobKind,
    /// Priority.
    pub priority: JobPriority,
    /// Kind-specific payload.
    pub payload: serde_json::Value,
    /// Maximum retry attempts.
    pub max_attempts: i32,
    /// Deduplication key; `None` disables deduplication.
    pub dedup_key: Option<String>,
    /// Earliest time the job may be leased.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl CreateJob {
    /// Build a create request from a typed payload.
    pub fn from_payload(payload: &JobPayload, priority: JobPriority) -> AppResult<Self> {
        Ok(Self {
            kind: payload.kind(),
            priority,
            payload: serde_json::to_value(payload)?,
            max_attempts: 3,
            dedup_key: None,
            scheduled_at: None,
        })
    }

    /// Set the deduplication key.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Set the maximum attempts.
    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus, attempts: i32, max: i32) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            kind: JobKind::Thumbnail,
            priority: JobPriority::Normal,
            payload: serde_json::json!({
                "kind": "thumbnail",
                "file_id": Uuid::new_v4(),
                "source_path": "objects/ab/abcd",
                "sizes": [128],
            }),
            result: None,
            last_error: None,
            status,
            attempts,
            max_attempts: max,
            progress: 0,
            dedup_key: None,
            scheduled_at: None,
            lease_expires_at: None,
            worker_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn test_retry_budget() {
        assert!(job(JobStatus::Failed, 1, 3).can_retry());
        assert!(!job(JobStatus::Failed, 3, 3).can_retry());
        assert!(job(JobStatus::Failed, 3, 3).is_dead());
        assert!(!job(JobStatus::Completed, 1, 3).can_retry());
    }

    #[test]
    fn test_stalled_detection() {
        let now = Utc::now();
        let mut j = job(JobStatus::Processing, 1, 3);
        j.lease_expires_at = Some(now - chrono::Duration::seconds(10));
        assert!(j.is_stalled(now));

        j.lease_expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(!j.is_stalled(now));
    }

    #[test]
    fn test_typed_payload_kind_mismatch() {
        let mut j = job(JobStatus::Pending, 0, 3);
        j.kind = JobKind::Transcode;
        assert!(j.typed_payload().is_err());
    }
}
