//! Upload session repository implementation.
//!
//! Chunk receipt and the finalize lock are single conditional updates so
//! that concurrent uploaders and finalizers cannot race.

use sqlx::PgPool;
use uuid::Uuid;

use partflow_core::error::{AppError, ErrorKind};
use partflow_core::result::AppResult;
use partflow_entity::upload::{CreateUploadSession, UploadSession};

/// Repository for chunked upload sessions.
#[derive(Debug, Clone)]
pub struct UploadSessionRepository {
    pool: PgPool,
}

impl UploadSessionRepository {
    /// Create a new upload session repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a new upload session.
    pub async fn create(&self, data: &CreateUploadSession) -> AppResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "INSERT INTO upload_sessions \
             (owner_id, file_name, total_size, chunk_size, total_chunks, \
              declared_sha256, mime_type, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(data.owner_id)
        .bind(&data.file_name)
        .bind(data.total_size)
        .bind(data.chunk_size)
        .bind(data.total_chunks)
        .bind(&data.declared_sha256)
        .bind(&data.mime_type)
        .bind(data.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to create upload session", e)
        })
    }

    /// Find a session by ID.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<UploadSession>> {
        sqlx::query_as::<_, UploadSession>("SELECT * FROM upload_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to find upload session", e)
            })
    }

    /// Record receipt of a chunk index.
    ///
    /// The jsonb containment guard makes a duplicate index a no-op update:
    /// `None` means the session is not open or the chunk already exists, so
    /// the caller can reject instead of silently overwriting a retry.
    pub async fn record_chunk(&self, id: Uuid, index: i32) -> AppResult<Option<UploadSession>> {
        let index_arr = serde_json::json!([index]);
        sqlx::query_as::<_, UploadSession>(
            "UPDATE upload_sessions \
             SET received_chunks = received_chunks || $2::jsonb, updated_at = NOW() \
             WHERE id = $1 AND status = 'open' AND NOT (received_chunks @> $2::jsonb) \
             RETURNING *",
        )
        .bind(id)
        .bind(&index_arr)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to record chunk", e))
    }

    /// Acquire the per-session finalize lock by transitioning to
    /// `assembling`. Exactly one concurrent caller wins; the rest get
    /// `None`.
    ///
    /// The transition is also granted when a previous assembly attempt is
    /// older than the TTL (crashed finalizer) or left the session in
    /// `failed_assembly` within its retry window, so a stuck lock can never
    /// deadlock future attempts.
    pub async fn begin_assembly(
        &self,
        id: Uuid,
        assembly_ttl_seconds: i64,
        failed_retry_window_minutes: i64,
    ) -> AppResult<Option<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(
            "UPDATE upload_sessions \
             SET status = 'assembling', assembly_started_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND ( \
                status = 'open' \
                OR (status = 'assembling' \
                    AND assembly_started_at < NOW() - make_interval(secs => $2)) \
                OR (status = 'failed_assembly' \
                    AND updated_at > NOW() - make_interval(mins => $3)) \
             ) RETURNING *",
        )
        .bind(id)
        .bind(assembly_ttl_seconds as f64)
        .bind(failed_retry_window_minutes as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to begin assembly", e)
        })
    }

    /// Mark a session as finalized with its registered file.
    pub async fn mark_finalized(&self, id: Uuid, file_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE upload_sessions \
             SET status = 'finalized', finalized_file_id = $2, last_error = NULL, \
             updated_at = NOW() \
             WHERE id = $1 AND status = 'assembling'",
        )
        .bind(id)
        .bind(file_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to finalize session", e)
        })?;
        Ok(())
    }

    /// Record an assembly failure (hash mismatch). Chunks stay intact for
    /// one retry window.
    pub async fn mark_failed_assembly(&self, id: Uuid, error: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE upload_sessions \
             SET status = 'failed_assembly', last_error = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'assembling'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to mark assembly failure", e)
        })?;
        Ok(())
    }

    /// Release the finalize lock after a transient storage error so the
    /// next attempt starts clean.
    pub async fn reopen(&self, id: Uuid, error: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE upload_sessions \
             SET status = 'open', assembly_started_at = NULL, last_error = $2, \
             updated_at = NOW() \
             WHERE id = $1 AND status = 'assembling'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to reopen session", e))?;
        Ok(())
    }

    /// Expire open sessions past their TTL and failed assemblies past the
    /// diagnostic retention window. Returns the expired sessions so the
    /// caller can purge their chunks.
    pub async fn expire_stale(
        &self,
        failed_retention_minutes: i64,
    ) -> AppResult<Vec<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(
            "UPDATE upload_sessions \
             SET status = 'expired', updated_at = NOW() \
             WHERE (status = 'open' AND expires_at < NOW()) \
                OR (status = 'failed_assembly' \
                    AND updated_at < NOW() - make_interval(mins => $1)) \
             RETURNING *",
        )
        .bind(failed_retention_minutes as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to expire sessions", e)
        })
    }
}
