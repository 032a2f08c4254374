//! File record repository implementation.

use sqlx::PgPool;
use uuid::Uuid;

use partflow_core::error::{AppError, ErrorKind};
use partflow_core::result::AppResult;
use partflow_entity::file::{CreateStoredFile, StoredFile};

/// Repository for files registered by finalized uploads.
#[derive(Debug, Clone)]
pub struct FileRepository {
    pool: PgPool,
}

impl FileRepository {
    /// Create a new file repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a new file.
    pub async fn create(&self, data: &CreateStoredFile) -> AppResult<StoredFile> {
        sqlx::query_as::<_, StoredFile>(
            "INSERT INTO files \
             (owner_id, name, storage_path, size_bytes, checksum_sha256, mime_type) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(data.owner_id)
        .bind(&data.name)
        .bind(&data.storage_path)
        .bind(data.size_bytes)
        .bind(&data.checksum_sha256)
        .bind(&data.mime_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create file", e))
    }

    /// Find a file by ID.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<StoredFile>> {
        sqlx::query_as::<_, StoredFile>("SELECT * FROM files WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find file", e))
    }
}
