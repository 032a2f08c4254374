//! Job lifecycle events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events related to background job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// A job was enqueued.
    Queued {
        /// The job ID.
        job_id: Uuid,
        /// The job kind discriminant.
        kind: String,
    },
    /// A worker leased the job and started executing it.
    Started {
        /// The job ID.
        job_id: Uuid,
        /// The job kind discriminant.
        kind: String,
        /// The attempt number (1-based).
        attempt: i32,
    },
    /// A handler reported execution progress.
    Progress {
        /// The job ID.
        job_id: Uuid,
        /// Progress percentage (0-100).
        percent: i16,
    },
    /// The job completed successfully.
    Completed {
        /// The job ID.
        job_id: Uuid,
        /// The job kind discriminant.
        kind: String,
    },
    /// The job failed.
    Failed {
        /// The job ID.
        job_id: Uuid,
        /// The job kind discriminant.
        kind: String,
        /// The recorded error message.
        error: String,
        /// Whether the job exhausted its retry budget.
        dead: bool,
    },
    /// The job was cancelled before a worker picked it up.
    Cancelled {
        /// The job ID.
        job_id: Uuid,
    },
}

impl JobEvent {
    /// The notifier topic for a specific job's events.
    pub fn topic(job_id: Uuid) -> String {
        format!("job:{job_id}")
    }

    /// The job ID this event refers to.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Queued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => *job_id,
        }
    }
}
