//! Assembler that concatenates verified chunks into a published object.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;

use futures::StreamExt;
use partflow_core::error::{AppError, ErrorKind};
use partflow_core::result::AppResult;
use partflow_core::traits::storage::StorageProvider;

use super::store::ChunkStore;

/// A finalized object produced by assembly.
#[derive(Debug, Clone)]
pub struct AssembledObject {
    /// Content-addressed path of the object in the storage provider.
    pub storage_path: String,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the assembled content.
    pub sha256: String,
}

/// Concatenates session chunks in index order, verifies integrity, and
/// publishes the result at a content-addressed path.
///
/// Assembly streams through a scratch file so a multi-gigabyte upload is
/// never held in memory, and the digest is computed during the same pass.
/// The final `objects/{aa}/{hash}` path only appears once the object is
/// complete, via the provider's atomic publish.
#[derive(Debug, Clone)]
pub struct Assembler {
    chunks: ChunkStore,
    provider: Arc<dyn StorageProvider>,
    scratch_dir: PathBuf,
}

impl Assembler {
    /// Create a new assembler using the given scratch directory.
    pub fn new(chunks: ChunkStore, provider: Arc<dyn StorageProvider>, scratch_dir: &str) -> Self {
        Self {
            chunks,
            provider,
            scratch_dir: PathBuf::from(scratch_dir),
        }
    }

    /// Assemble all chunks of a session into a single published object.
    ///
    /// Verifies the total size against the declared upload size and, when a
    /// declared SHA-256 is present, the digest of the assembled content.
    /// Integrity failures come back as `Validation` errors so the caller can
    /// distinguish a corrupt upload from a transient storage fault.
    pub async fn assemble(
        &self,
        session_id: Uuid,
        total_chunks: i32,
        expected_size: i64,
        declared_sha256: Option<&str>,
    ) -> AppResult<AssembledObject> {
        let scratch_path = self
            .scratch_dir
            .join(format!("assemble-{session_id}-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Storage, "Failed to create scratch directory", e)
            })?;

        let result = self
            .assemble_to_scratch(session_id, total_chunks, &scratch_path)
            .await;
        let (size_bytes, sha256) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = tokio::fs::remove_file(&scratch_path).await;
                return Err(e);
            }
        };

        if let Err(e) = Self::verify(size_bytes, &sha256, expected_size, declared_sha256) {
            let _ = tokio::fs::remove_file(&scratch_path).await;
            return Err(e);
        }

        let storage_path = Self::object_path(&sha256);
        let publish = self.publish_scratch(&scratch_path, &storage_path).await;
        let _ = tokio::fs::remove_file(&scratch_path).await;
        publish?;

        info!(
            session_id = %session_id,
            path = %storage_path,
            bytes = size_bytes,
            "Assembled upload"
        );

        Ok(AssembledObject {
            storage_path,
            size_bytes,
            sha256,
        })
    }

    /// Content-addressed object path: two-character fan-out over the digest.
    pub fn object_path(sha256: &str) -> String {
        format!("objects/{}/{}", &sha256[..2], sha256)
    }

    async fn assemble_to_scratch(
        &self,
        session_id: Uuid,
        total_chunks: i32,
        scratch_path: &PathBuf,
    ) -> AppResult<(u64, String)> {
        let mut file = tokio::fs::File::create(scratch_path).await.map_err(|e| {
            AppError::with_source(ErrorKind::Storage, "Failed to create scratch file", e)
        })?;

        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;

        for index in 0..total_chunks {
            let mut stream = self
                .provider
                .read(&ChunkStore::chunk_path(session_id, index))
                .await
                .map_err(|e| {
                    if e.kind == ErrorKind::NotFound {
                        AppError::validation(format!(
                            "Chunk {index} missing for session {session_id}"
                        ))
                    } else {
                        e
                    }
                })?;

            while let Some(piece) = stream.next().await {
                let piece = piece.map_err(|e| {
                    AppError::with_source(ErrorKind::Storage, "Chunk read error", e)
                })?;
                hasher.update(&piece);
                total_bytes += piece.len() as u64;
                file.write_all(&piece).await.map_err(|e| {
                    AppError::with_source(ErrorKind::Storage, "Failed to write scratch file", e)
                })?;
            }
        }

        file.flush().await.map_err(|e| {
            AppError::with_source(ErrorKind::Storage, "Failed to flush scratch file", e)
        })?;

        Ok((total_bytes, hex::encode(hasher.finalize())))
    }

    fn verify(
        size_bytes: u64,
        sha256: &str,
        expected_size: i64,
        declared_sha256: Option<&str>,
    ) -> AppResult<()> {
        if size_bytes != expected_size as u64 {
            return Err(AppError::validation(format!(
                "Assembled size {size_bytes} does not match declared size {expected_size}"
            )));
        }
        if let Some(declared) = declared_sha256 {
            if !declared.eq_ignore_ascii_case(sha256) {
                return Err(AppError::validation(format!(
                    "Checksum mismatch: declared {declared}, computed {sha256}"
                )));
            }
        }
        Ok(())
    }

    async fn publish_scratch(&self, scratch_path: &PathBuf, storage_path: &str) -> AppResult<()> {
        // Identical content assembles to the same path; re-publishing is a no-op.
        if self.provider.exists(storage_path).await? {
            return Ok(());
        }

        let file = tokio::fs::File::open(scratch_path).await.map_err(|e| {
            AppError::with_source(ErrorKind::Storage, "Failed to reopen scratch file", e)
        })?;
        let stream = ReaderStream::new(file).map(|r| r.map(|b| b.into()));
        self.provider
            .write_stream(storage_path, Box::pin(stream))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LocalStorageProvider;
    use bytes::Bytes;

    async fn setup() -> (tempfile::TempDir, ChunkStore, Assembler) {
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
        (dir, chunks, assembler)
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_assembles_chunks_in_index_order() {
        let (_dir, chunks, assembler) = setup().await;
        let id = Uuid::new_v4();

        // Write out of order; assembly must still follow index order.
        chunks.put(id, 2, Bytes::from_static(b"gamma")).await.unwrap();
        chunks.put(id, 0, Bytes::from_static(b"alpha")).await.unwrap();
        chunks.put(id, 1, Bytes::from_static(b"beta")).await.unwrap();

        let expected = b"alphabetagamma";
        let obj = assembler
            .assemble(id, 3, expected.len() as i64, Some(&sha256_hex(expected)))
            .await
            .unwrap();

        assert_eq!(obj.size_bytes, expected.len() as u64);
        assert_eq!(obj.sha256, sha256_hex(expected));
        assert_eq!(obj.storage_path, Assembler::object_path(&obj.sha256));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_validation_error() {
        let (_dir, chunks, assembler) = setup().await;
        let id = Uuid::new_v4();
        chunks.put(id, 0, Bytes::from_static(b"data")).await.unwrap();

        let bogus = sha256_hex(b"something else");
        let err = assembler
            .assemble(id, 1, 4, Some(&bogus))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_validation_error() {
        let (_dir, chunks, assembler) = setup().await;
        let id = Uuid::new_v4();
        chunks.put(id, 0, Bytes::from_static(b"data")).await.unwrap();

        let err = assembler.assemble(id, 1, 99, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_validation_error() {
        let (_dir, chunks, assembler) = setup().await;
        let id = Uuid::new_v4();
        chunks.put(id, 0, Bytes::from_static(b"only")).await.unwrap();

        let err = assembler.assemble(id, 2, 4, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
