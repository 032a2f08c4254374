//! Upload session lifecycle events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events related to chunked upload sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UploadEvent {
    /// A chunk was received and persisted.
    ChunkReceived {
        /// The upload session ID.
        session_id: Uuid,
        /// The chunk index that arrived.
        index: i32,
        /// Number of chunks received so far.
        received: i32,
        /// Total chunks expected.
        total: i32,
    },
    /// All chunks arrived and assembly started.
    Assembling {
        /// The upload session ID.
        session_id: Uuid,
    },
    /// Assembly finished and the file was registered.
    Finalized {
        /// The upload session ID.
        session_id: Uuid,
        /// The registered file ID.
        file_id: Uuid,
        /// Total assembled size in bytes.
        size_bytes: u64,
        /// Content hash of the assembled object.
        sha256: String,
    },
    /// Assembly failed (hash mismatch or storage error).
    AssemblyFailed {
        /// The upload session ID.
        session_id: Uuid,
        /// The failure description.
        error: String,
    },
    /// The session expired and its chunks were purged.
    Expired {
        /// The upload session ID.
        session_id: Uuid,
    },
}

impl UploadEvent {
    /// The notifier topic for a specific session's events.
    pub fn topic(session_id: Uuid) -> String {
        format!("upload:{session_id}")
    }
}
