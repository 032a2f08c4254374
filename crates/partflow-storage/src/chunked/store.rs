//! Chunk store for multi-part upload sessions.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use partflow_core::result::AppResult;
use partflow_core::traits::storage::StorageProvider;

/// Persists individual upload chunks until their session is assembled.
///
/// Chunks live under a session-scoped directory in the staging area of the
/// storage provider. Writing a chunk that already exists overwrites it with
/// identical content, so a retried part is harmless at this layer.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    /// Storage provider backing the staging area.
    provider: Arc<dyn StorageProvider>,
}

impl ChunkStore {
    /// Create a new chunk store on the given provider.
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self { provider }
    }

    /// Write a single chunk. Returns the number of bytes stored.
    pub async fn put(&self, session_id: Uuid, index: i32, data: Bytes) -> AppResult<u64> {
        let path = Self::chunk_path(session_id, index);
        let size = data.len() as u64;
        self.provider.write(&path, data).await?;
        Ok(size)
    }

    /// Read a chunk back.
    pub async fn read(&self, session_id: Uuid, index: i32) -> AppResult<Bytes> {
        let path = Self::chunk_path(session_id, index);
        self.provider.read_bytes(&path).await
    }

    /// Whether a chunk is present.
    pub async fn exists(&self, session_id: Uuid, index: i32) -> AppResult<bool> {
        let path = Self::chunk_path(session_id, index);
        self.provider.exists(&path).await
    }

    /// Size of a stored chunk in bytes.
    pub async fn size(&self, session_id: Uuid, index: i32) -> AppResult<u64> {
        let path = Self::chunk_path(session_id, index);
        let meta = self.provider.metadata(&path).await?;
        Ok(meta.size_bytes)
    }

    /// Delete a single chunk.
    pub async fn delete(&self, session_id: Uuid, index: i32) -> AppResult<()> {
        let path = Self::chunk_path(session_id, index);
        self.provider.delete(&path).await
    }

    /// Remove every chunk for a session along with its staging directory.
    ///
    /// Missing chunks are ignored; purge is called both after successful
    /// assembly and when an expired session is swept.
    pub async fn purge(&self, session_id: Uuid) -> AppResult<()> {
        let dir = Self::session_dir(session_id);
        self.provider.delete_dir(&dir).await
    }

    /// Staging path for a chunk.
    pub fn chunk_path(session_id: Uuid, index: i32) -> String {
        format!("_chunks/{session_id}/{index:06}")
    }

    /// Staging directory for a session.
    pub fn session_dir(session_id: Uuid) -> String {
        format!("_chunks/{session_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LocalStorageProvider;

    async fn store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalStorageProvider::new(dir.path().to_str().unwrap())
            .await
            .unwrap();
        (dir, ChunkStore::new(Arc::new(provider)))
    }

    #[test]
    fn test_chunk_path_is_zero_padded() {
        let id = Uuid::nil();
        assert_eq!(
            ChunkStore::chunk_path(id, 7),
            format!("_chunks/{id}/000007")
        );
    }

    #[tokio::test]
    async fn test_put_overwrite_is_idempotent() {
        let (_dir, store) = store().await;
        let id = Uuid::new_v4();
        store.put(id, 0, Bytes::from_static(b"part")).await.unwrap();
        store.put(id, 0, Bytes::from_static(b"part")).await.unwrap();
        assert_eq!(&store.read(id, 0).await.unwrap()[..], b"part");
    }

    #[tokio::test]
    async fn test_purge_removes_all_chunks() {
        let (_dir, store) = store().await;
        let id = Uuid::new_v4();
        store.put(id, 0, Bytes::from_static(b"a")).await.unwrap();
        store.put(id, 1, Bytes::from_static(b"b")).await.unwrap();

        store.purge(id).await.unwrap();
        assert!(!store.exists(id, 0).await.unwrap());
        assert!(!store.exists(id, 1).await.unwrap());
    }
}
