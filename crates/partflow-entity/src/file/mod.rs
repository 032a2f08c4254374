//! Registered file entities.
//!
//! The wider file-management subsystem owns the full file/folder model;
//! this crate only carries the record the assembler registers when an
//! upload finalizes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered file produced by a finalized upload.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredFile {
    /// Unique file identifier.
    pub id: Uuid,
    /// The owning user.
    pub owner_id: Uuid,
    /// The display name.
    pub name: String,
    /// Content-addressed storage path.
    pub storage_path: String,
    /// Size in bytes.
    pub size_bytes: i64,
    /// SHA-256 checksum of the content.
    pub checksum_sha256: String,
    /// MIME type (if known).
    pub mime_type: Option<String>,
    /// When the file was registered.
    pub created_at: DateTime<Utc>,
}

/// Data required to register a new file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStoredFile {
    /// The owning user.
    pub owner_id: Uuid,
    /// The display name.
    pub name: String,
    /// Content-addressed storage path.
    pub storage_path: String,
    /// Size in bytes.
    pub size_bytes: i64,
    /// SHA-256 checksum of the content.
    pub checksum_sha256: String,
    /// MIME type (if known).
    pub mime_type: Option<String>,
}
