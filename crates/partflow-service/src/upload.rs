//! Chunked upload session service.
//!
//! Owns the session lifecycle from `initiate` to `finalize`: chunk receipt
//! validation, the finalize lock, assembly, file registration, and the
//! post-processing jobs enqueued for the registered file.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use partflow_core::config::upload::UploadConfig;
use partflow_core::error::{AppError, ErrorKind};
use partflow_core::events::UploadEvent;
use partflow_core::result::AppResult;
use partflow_entity::file::{CreateStoredFile, StoredFile};
use partflow_entity::job::{CreateJob, JobPayload, JobPriority};
use partflow_entity::upload::{CreateUploadSession, SessionStatus, UploadSession};
use partflow_notify::ProgressNotifier;
use partflow_storage::{Assembler, ChunkStore};

use crate::queue::JobQueue;
use crate::store::{FileStore, SessionStore};

/// Parameters for opening a new upload session.
#[derive(Debug, Clone)]
pub struct InitiateUpload {
    /// The uploading user.
    pub owner_id: Uuid,
    /// The intended file name.
    pub file_name: String,
    /// Total file size in bytes.
    pub total_size: i64,
    /// Expected SHA-256 of the assembled file, if the client knows it.
    pub declared_sha256: Option<String>,
    /// MIME type, if the client declared one.
    pub mime_type: Option<String>,
}

/// Service coordinating chunked uploads end to end.
#[derive(Debug, Clone)]
pub struct UploadService {
    sessions: Arc<dyn SessionStore>,
    files: Arc<dyn FileStore>,
    chunks: ChunkStore,
    assembler: Assembler,
    queue: JobQueue,
    notifier: ProgressNotifier,
    config: UploadConfig,
}

impl UploadService {
    /// Create a new upload service.
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        files: Arc<dyn FileStore>,
        chunks: ChunkStore,
        assembler: Assembler,
        queue: JobQueue,
        notifier: ProgressNotifier,
        config: UploadConfig,
    ) -> Self {
        Self {
            sessions,
            files,
            chunks,
            assembler,
            queue,
            notifier,
            config,
        }
    }

    /// Open a new upload session.
    pub async fn initiate(&self, request: InitiateUpload) -> AppResult<UploadSession> {
        if request.total_size <= 0 {
            return Err(AppError::validation("Upload size must be positive"));
        }
        if request.total_size as u64 > self.config.max_upload_size_bytes {
            return Err(AppError::validation(format!(
                "Upload size {} exceeds the maximum of {} bytes",
                request.total_size, self.config.max_upload_size_bytes
            )));
        }
        if request.file_name.trim().is_empty() {
            return Err(AppError::validation("File name must not be empty"));
        }

        let chunk_size = self.config.chunk_size_bytes;
        let total_chunks = (request.total_size as u64).div_ceil(chunk_size as u64) as i32;

        let session = self
            .sessions
            .create(&CreateUploadSession {
                owner_id: request.owner_id,
                file_name: request.file_name,
                total_size: request.total_size,
                chunk_size,
                total_chunks,
                declared_sha256: request.declared_sha256,
                mime_type: request.mime_type,
                expires_at: chrono::Utc::now()
                    + chrono::Duration::hours(self.config.session_ttl_hours),
            })
            .await?;

        info!(
            session_id = %session.id,
            total_chunks,
            total_size = session.total_size,
            "Opened upload session"
        );
        Ok(session)
    }

    /// Look up a session.
    pub async fn get(&self, session_id: Uuid) -> AppResult<UploadSession> {
        self.sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Upload session {session_id} not found")))
    }

    /// Chunk indices still missing, for upload resumption.
    pub async fn missing_chunks(&self, session_id: Uuid) -> AppResult<Vec<i32>> {
        Ok(self.get(session_id).await?.missing_indices())
    }

    /// Receive one chunk.
    ///
    /// The chunk bytes are persisted before the receipt is recorded, so a
    /// crash between the two leaves a re-sendable chunk, never a recorded
    /// receipt without data. A duplicate index is rejected with `Conflict`
    /// and the stored bytes are left untouched.
    pub async fn put_chunk(
        &self,
        session_id: Uuid,
        index: i32,
        data: Bytes,
    ) -> AppResult<UploadSession> {
        let session = self.get(session_id).await?;

        if session.status != SessionStatus::Open {
            return Err(AppError::conflict(format!(
                "Session {session_id} is {}, not accepting chunks",
                session.status
            )));
        }
        if index < 0 || index >= session.total_chunks {
            return Err(AppError::validation(format!(
                "Chunk index {index} out of range 0..{}",
                session.total_chunks
            )));
        }

        let expected = Self::expected_chunk_size(&session, index);
        if data.len() as i64 != expected {
            return Err(AppError::validation(format!(
                "Chunk {index} is {} bytes, expected {expected}",
                data.len()
            )));
        }

        if session.received_indices().contains(&index) {
            return Err(AppError::conflict(format!(
                "Chunk {index} already received for session {session_id}"
            )));
        }

        self.chunks.put(session_id, index, data).await?;

        let Some(updated) = self.sessions.record_chunk(session_id, index).await? else {
            // Lost a race with a concurrent retry of the same index.
            return Err(AppError::conflict(format!(
                "Chunk {index} already received for session {session_id}"
            )));
        };

        self.notifier.publish_upload(
            session_id,
            &UploadEvent::ChunkReceived {
                session_id,
                index,
                received: updated.received_count(),
                total: updated.total_chunks,
            },
        );
        Ok(updated)
    }

    /// Finalize a complete session: assemble, verify, register, enqueue.
    ///
    /// Safe to call repeatedly and concurrently. Exactly one caller wins the
    /// `open -> assembling` transition; the rest get `Conflict`. Calling
    /// again on an already finalized session returns the registered file.
    pub async fn try_finalize(&self, session_id: Uuid) -> AppResult<StoredFile> {
        let session = self.get(session_id).await?;

        if session.status == SessionStatus::Finalized {
            return self.registered_file(&session).await;
        }
        if !session.is_complete() {
            return Err(AppError::validation(format!(
                "Session {session_id} is missing {} chunk(s)",
                session.total_chunks - session.received_count()
            )));
        }

        let Some(session) = self
            .sessions
            .begin_assembly(
                session_id,
                self.config.assembly_ttl_seconds,
                self.config.failed_assembly_retention_minutes,
            )
            .await?
        else {
            // Someone else holds the lock, or the session is terminal.
            let current = self.get(session_id).await?;
            if current.status == SessionStatus::Finalized {
                return self.registered_file(&current).await;
            }
            return Err(AppError::conflict(format!(
                "Finalize already in progress for session {session_id}"
            )));
        };

        self.notifier
            .publish_upload(session_id, &UploadEvent::Assembling { session_id });

        let assembled = match self
            .assembler
            .assemble(
                session_id,
                session.total_chunks,
                session.total_size,
                session.declared_sha256.as_deref(),
            )
            .await
        {
            Ok(obj) => obj,
            Err(e) if e.kind == ErrorKind::Validation => {
                // Integrity failure. Keep the chunks for a diagnostic retry.
                self.sessions
                    .mark_failed_assembly(session_id, &e.message)
                    .await?;
                self.notifier.publish_upload(
                    session_id,
                    &UploadEvent::AssemblyFailed {
                        session_id,
                        error: e.message.clone(),
                    },
                );
                return Err(e);
            }
            Err(e) => {
                self.sessions.reopen(session_id, &e.message).await?;
                return Err(e);
            }
        };

        let file = self
            .files
            .create(&CreateStoredFile {
                owner_id: session.owner_id,
                name: session.file_name.clone(),
                storage_path: assembled.storage_path.clone(),
                size_bytes: assembled.size_bytes as i64,
                checksum_sha256: assembled.sha256.clone(),
                mime_type: session.mime_type.clone(),
            })
            .await?;

        self.enqueue_post_processing(&file).await;

        if let Err(e) = self.chunks.purge(session_id).await {
            // Orphaned chunks are swept later; do not fail the finalize.
            warn!(session_id = %session_id, error = %e, "Chunk purge failed");
        }
        self.sessions.mark_finalized(session_id, file.id).await?;

        self.notifier.publish_upload(
            session_id,
            &UploadEvent::Finalized {
                session_id,
                file_id: file.id,
                size_bytes: assembled.size_bytes,
                sha256: assembled.sha256,
            },
        );
        info!(session_id = %session_id, file_id = %file.id, "Finalized upload");
        Ok(file)
    }

    /// Expire timed-out sessions and purge their chunks. Returns the number
    /// of sessions expired.
    pub async fn sweep_expired(&self) -> AppResult<usize> {
        let expired = self
            .sessions
            .expire_stale(self.config.failed_assembly_retention_minutes)
            .await?;

        for session in &expired {
            if let Err(e) = self.chunks.purge(session.id).await {
                warn!(session_id = %session.id, error = %e, "Chunk purge failed during sweep");
            }
            self.notifier.publish_upload(
                session.id,
                &UploadEvent::Expired {
                    session_id: session.id,
                },
            );
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale upload sessions");
        }
        Ok(expired.len())
    }

    /// Jobs to run for a freshly registered file, keyed so a finalize retry
    /// cannot enqueue them twice.
    fn plan_jobs(file: &StoredFile) -> Vec<CreateJob> {
        let mime = file.mime_type.as_deref().unwrap_or("");
        let mut payloads: Vec<(JobPayload, JobPriority)> = Vec::new();

        if mime.starts_with("video/") {
            payloads.push((
                JobPayload::Transcode {
                    file_id: file.id,
                    source_path: file.storage_path.clone(),
                    preset: "mp4".into(),
                },
                JobPriority::Normal,
            ));
            payloads.push((
                JobPayload::Thumbnail {
                    file_id: file.id,
                    source_path: file.storage_path.clone(),
                    sizes: vec![128, 512],
                },
                JobPriority::High,
            ));
        } else if mime.starts_with("image/") {
            payloads.push((
                JobPayload::Thumbnail {
                    file_id: file.id,
                    source_path: file.storage_path.clone(),
                    sizes: vec![128, 512],
                },
                JobPriority::High,
            ));
        } else if Self::is_convertible_document(mime) {
            payloads.push((
                JobPayload::ConvertDocument {
                    file_id: file.id,
                    source_path: file.storage_path.clone(),
                    target_format: "pdf".into(),
                },
                JobPriority::Normal,
            ));
        }

        payloads
            .into_iter()
            .filter_map(|(payload, priority)| {
                let kind = payload.kind();
                CreateJob::from_payload(&payload, priority)
                    .ok()
                    .map(|j| j.with_dedup_key(format!("{kind}:{}", file.id)))
            })
            .collect()
    }

    fn is_convertible_document(mime: &str) -> bool {
        matches!(mime, "application/msword" | "application/rtf" | "text/plain")
            || mime.starts_with("application/vnd.openxmlformats-officedocument")
            || mime.starts_with("application/vnd.oasis.opendocument")
    }

    async fn enqueue_post_processing(&self, file: &StoredFile) {
        for job in Self::plan_jobs(file) {
            let kind = job.kind;
            if let Err(e) = self.queue.enqueue(job).await {
                // The job row failed to land; the file itself is registered.
                warn!(file_id = %file.id, kind = %kind, error = %e, "Post-processing enqueue failed");
            }
        }
    }

    async fn registered_file(&self, session: &UploadSession) -> AppResult<StoredFile> {
        let file_id = session.finalized_file_id.ok_or_else(|| {
            AppError::internal(format!(
                "Finalized session {} has no registered file",
                session.id
            ))
        })?;
        self.files
            .find_by_id(file_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("File {file_id} not found")))
    }

    fn expected_chunk_size(session: &UploadSession, index: i32) -> i64 {
        if index == session.total_chunks - 1 {
            session.total_size - (session.total_chunks as i64 - 1) * session.chunk_size as i64
        } else {
            session.chunk_size as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_queue, MemoryFileStore, MemorySessionStore};
    use partflow_core::traits::storage::StorageProvider;
    use partflow_entity::job::JobKind;
    use partflow_storage::LocalStorageProvider;
    use sha2::{Digest, Sha256};

    struct Fixture {
        _dir: tempfile::TempDir,
        sessions: Arc<MemorySessionStore>,
        service: UploadService,
        queue: JobQueue,
    }

    async fn fixture(config: UploadConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn StorageProvider> = Arc::new(
            LocalStorageProvider::new(dir.path().join("storage").to_str().unwrap())
                .await
                .unwrap(),
        );
        let chunks = ChunkStore::new(provider.clone());
        let assembler = Assembler::new(
            chunks.clone(),
            provider,
            dir.path().join("scratch").to_str().unwrap(),
        );
        let sessions = Arc::new(MemorySessionStore::default());
        let queue = memory_queue(30);
        let service = UploadService::new(
            sessions.clone(),
            Arc::new(MemoryFileStore::default()),
            chunks,
            assembler,
            queue.clone(),
            ProgressNotifier::default(),
            config,
        );
        Fixture {
            _dir: dir,
            sessions,
            service,
            queue,
        }
    }

    fn small_config() -> UploadConfig {
        UploadConfig {
            chunk_size_bytes: 4,
            ..UploadConfig::default()
        }
    }

    fn initiate_video(total_size: i64, sha256: Option<String>) -> InitiateUpload {
        InitiateUpload {
            owner_id: Uuid::new_v4(),
            file_name: "clip.mp4".into(),
            total_size,
            declared_sha256: sha256,
            mime_type: Some("video/mp4".into()),
        }
    }

    #[tokio::test]
    async fn test_full_upload_lifecycle() {
        let f = fixture(small_config()).await;
        let content = b"abcdefghij"; // 3 chunks of 4/4/2
        let declared = hex::encode(Sha256::digest(content));

        let session = f
            .service
            .initiate(initiate_video(content.len() as i64, Some(declared.clone())))
            .await
            .unwrap();
        assert_eq!(session.total_chunks, 3);

        // Deliver out of order.
        f.service
            .put_chunk(session.id, 2, Bytes::from_static(b"ij"))
            .await
            .unwrap();
        f.service
            .put_chunk(session.id, 0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        assert_eq!(f.service.missing_chunks(session.id).await.unwrap(), vec![1]);
        f.service
            .put_chunk(session.id, 1, Bytes::from_static(b"efgh"))
            .await
            .unwrap();

        let file = f.service.try_finalize(session.id).await.unwrap();
        assert_eq!(file.checksum_sha256, declared);
        assert_eq!(file.size_bytes, content.len() as i64);

        // Finalize is idempotent: the same file comes back.
        let again = f.service.try_finalize(session.id).await.unwrap();
        assert_eq!(again.id, file.id);

        // Video uploads fan out into transcode + thumbnail jobs, once.
        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.statuses.pending, 2);
        assert_eq!(stats.broker_depths["transcode"], 1);
        assert_eq!(stats.broker_depths["thumbnail"], 1);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_rejected() {
        let f = fixture(small_config()).await;
        let session = f.service.initiate(initiate_video(8, None)).await.unwrap();

        f.service
            .put_chunk(session.id, 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        let err = f
            .service
            .put_chunk(session.id, 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_chunk_index_and_size_validation() {
        let f = fixture(small_config()).await;
        let session = f.service.initiate(initiate_video(10, None)).await.unwrap();

        let out_of_range = f
            .service
            .put_chunk(session.id, 3, Bytes::from_static(b"xxxx"))
            .await
            .unwrap_err();
        assert_eq!(out_of_range.kind, ErrorKind::Validation);

        // Interior chunk must be exactly chunk_size; the last chunk shorter.
        let wrong_size = f
            .service
            .put_chunk(session.id, 0, Bytes::from_static(b"xx"))
            .await
            .unwrap_err();
        assert_eq!(wrong_size.kind, ErrorKind::Validation);

        f.service
            .put_chunk(session.id, 2, Bytes::from_static(b"xx"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finalize_incomplete_session_fails() {
        let f = fixture(small_config()).await;
        let session = f.service.initiate(initiate_video(8, None)).await.unwrap();
        f.service
            .put_chunk(session.id, 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();

        let err = f.service.try_finalize(session.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_marks_failed_assembly() {
        let f = fixture(small_config()).await;
        let bogus = hex::encode(Sha256::digest(b"not the content"));
        let session = f
            .service
            .initiate(initiate_video(4, Some(bogus)))
            .await
            .unwrap();
        f.service
            .put_chunk(session.id, 0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();

        let err = f.service.try_finalize(session.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let session = f.service.get(session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::FailedAssembly);
        assert!(session.last_error.is_some());

        // No post-processing jobs for a failed assembly.
        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.statuses.pending, 0);
    }

    #[tokio::test]
    async fn test_concurrent_finalize_single_winner() {
        let f = fixture(small_config()).await;
        let content = b"abcd";
        let session = f
            .service
            .initiate(initiate_video(4, Some(hex::encode(Sha256::digest(content)))))
            .await
            .unwrap();
        f.service
            .put_chunk(session.id, 0, Bytes::from_static(content))
            .await
            .unwrap();

        let a = f.service.clone();
        let b = f.service.clone();
        let (ra, rb) = tokio::join!(a.try_finalize(session.id), b.try_finalize(session.id));

        // At least one side registers the file; the loser either observes
        // the in-flight lock or the completed finalize.
        let file_id = match (&ra, &rb) {
            (Ok(f), _) => f.id,
            (_, Ok(f)) => f.id,
            (Err(a), Err(b)) => panic!("both finalizers failed: {a} / {b}"),
        };
        for r in [ra, rb] {
            match r {
                Ok(f) => assert_eq!(f.id, file_id),
                Err(e) => assert_eq!(e.kind, ErrorKind::Conflict),
            }
        }

        // Jobs were enqueued exactly once despite the race.
        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.statuses.pending, 2);
    }

    #[tokio::test]
    async fn test_sweep_expires_sessions_and_purges_chunks() {
        let f = fixture(small_config()).await;
        let session = f.service.initiate(initiate_video(8, None)).await.unwrap();
        f.service
            .put_chunk(session.id, 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();

        f.sessions.force_expiry(session.id);
        assert_eq!(f.service.sweep_expired().await.unwrap(), 1);

        let session = f.service.get(session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Expired);

        // An expired session no longer accepts chunks.
        let err = f
            .service
            .put_chunk(session.id, 1, Bytes::from_static(b"bbbb"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_image_upload_plans_thumbnail_only() {
        let f = fixture(small_config()).await;
        let content = b"pngs";
        let session = f
            .service
            .initiate(InitiateUpload {
                owner_id: Uuid::new_v4(),
                file_name: "photo.png".into(),
                total_size: 4,
                declared_sha256: Some(hex::encode(Sha256::digest(content))),
                mime_type: Some("image/png".into()),
            })
            .await
            .unwrap();
        f.service
            .put_chunk(session.id, 0, Bytes::from_static(content))
            .await
            .unwrap();
        f.service.try_finalize(session.id).await.unwrap();

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.statuses.pending, 1);
        assert_eq!(stats.broker_depths["thumbnail"], 1);
        assert_eq!(
            f.queue.broker().depth(JobKind::Transcode).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_initiate_validates_size() {
        let f = fixture(small_config()).await;
        assert!(f.service.initiate(initiate_video(0, None)).await.is_err());

        let too_big = InitiateUpload {
            total_size: (f.service.config.max_upload_size_bytes + 1) as i64,
            ..initiate_video(1, None)
        };
        assert!(f.service.initiate(too_big).await.is_err());
    }
}
