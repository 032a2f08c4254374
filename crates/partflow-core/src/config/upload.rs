//! Chunked upload configuration.

use serde::{Deserialize, Serialize};

/// Chunked upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Size of each chunk in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: i32,
    /// Maximum total upload size in bytes.
    #[serde(default = "default_max_upload")]
    pub max_upload_size_bytes: u64,
    /// Hours before an open session with no activity expires.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_hours: i64,
    /// Seconds a session may sit in `assembling` before the transition
    /// lock is considered abandoned and finalize may be retried.
    #[serde(default = "default_assembly_ttl")]
    pub assembly_ttl_seconds: i64,
    /// Minutes that chunks of a failed assembly are retained for a
    /// diagnostic retry before being purged.
    #[serde(default = "default_failed_retention")]
    pub failed_assembly_retention_minutes: i64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            max_upload_size_bytes: default_max_upload(),
            session_ttl_hours: default_session_ttl(),
            assembly_ttl_seconds: default_assembly_ttl(),
            failed_assembly_retention_minutes: default_failed_retention(),
        }
    }
}

fn default_chunk_size() -> i32 {
    5 * 1024 * 1024
}

fn default_max_upload() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_session_ttl() -> i64 {
    24
}

fn default_assembly_ttl() -> i64 {
    300
}

fn default_failed_retention() -> i64 {
    60
}
