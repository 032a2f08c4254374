//! Upload session entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Status of a chunked upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting chunks.
    Open,
    /// All chunks received, assembly in progress. Doubles as the
    /// per-session finalize lock: exactly one caller wins the
    /// `open -> assembling` transition.
    Assembling,
    /// Assembled, verified, and registered. Terminal.
    Finalized,
    /// Assembly hash check failed; chunks retained for one retry window.
    FailedAssembly,
    /// Timed out with no activity; all chunks purged. Terminal.
    Expired,
}

impl SessionStatus {
    /// Check if the session is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Expired)
    }

    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assembling => "assembling",
            Self::Finalized => "finalized",
            Self::FailedAssembly => "failed_assembly",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A chunked upload session tracking progress of a multi-part upload.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UploadSession {
    /// Unique upload session identifier.
    pub id: Uuid,
    /// The user performing the upload.
    pub owner_id: Uuid,
    /// The intended file name.
    pub file_name: String,
    /// Total file size in bytes.
    pub total_size: i64,
    /// Size of each chunk in bytes (the last chunk may be shorter).
    pub chunk_size: i32,
    /// Total number of chunks expected.
    pub total_chunks: i32,
    /// Sorted array of received chunk indices (JSON array).
    pub received_chunks: serde_json::Value,
    /// Expected SHA-256 checksum of the final assembled file, if the
    /// client declared one at session creation.
    pub declared_sha256: Option<String>,
    /// MIME type (if known). Drives which post-processing jobs are
    /// enqueued after finalize.
    pub mime_type: Option<String>,
    /// Current session status.
    pub status: SessionStatus,
    /// The registered file ID once finalized.
    pub finalized_file_id: Option<Uuid>,
    /// When assembly started (set when the finalize lock is taken).
    pub assembly_started_at: Option<DateTime<Utc>>,
    /// Last recorded assembly error.
    pub last_error: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last touched.
    pub updated_at: DateTime<Utc>,
    /// When the session expires if still open.
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Get the sorted list of received chunk indices.
    pub fn received_indices(&self) -> Vec<i32> {
        let mut indices: Vec<i32> =
            serde_json::from_value(self.received_chunks.clone()).unwrap_or_default();
        indices.sort_unstable();
        indices
    }

    /// Get the list of chunk indices not yet received, used by clients to
    /// resume an interrupted upload.
    pub fn missing_indices(&self) -> Vec<i32> {
        let received = self.received_indices();
        (0..self.total_chunks)
            .filter(|i| received.binary_search(i).is_err())
            .collect()
    }

    /// Get the number of chunks received so far.
    pub fn received_count(&self) -> i32 {
        self.received_indices().len() as i32
    }

    /// Check if every expected chunk has been received.
    pub fn is_complete(&self) -> bool {
        self.received_count() >= self.total_chunks
    }

    /// Calculate the upload progress as a percentage (0-100).
    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks <= 0 {
            return 0.0;
        }
        (self.received_count() as f64 / self.total_chunks as f64) * 100.0
    }
}

/// Data required to open a new upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUploadSession {
    /// The user performing the upload.
    pub owner_id: Uuid,
    /// The intended file name.
    pub file_name: String,
    /// Total file size in bytes.
    pub total_size: i64,
    /// Size of each chunk in bytes.
    pub chunk_size: i32,
    /// Total number of chunks expected.
    pub total_chunks: i32,
    /// Expected SHA-256 checksum of the assembled file.
    pub declared_sha256: Option<String>,
    /// MIME type (if known).
    pub mime_type: Option<String>,
    /// When the session expires.
    pub expires_at: DateTime<Utc>,
}
