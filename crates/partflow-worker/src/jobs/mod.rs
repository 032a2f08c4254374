//! Job handler implementations.
//!
//! Handlers that work on file content stage the source object into a local
//! scratch directory, do their work, and publish derivatives back through
//! the storage provider under `derived/{file_id}/`.

pub mod cleanup;
pub mod compress;
pub mod convert;
pub mod thumbnail;
pub mod transcode;

pub use cleanup::CleanupExtensionsJobHandler;
pub use compress::CompressJobHandler;
pub use convert::ConvertDocumentJobHandler;
pub use thumbnail::ThumbnailJobHandler;
pub use transcode::TranscodeJobHandler;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use partflow_core::error::ErrorKind;
use partflow_core::traits::storage::StorageProvider;

use crate::executor::JobExecutionError;

/// Derived-object path for a file's post-processing outputs.
pub(crate) fn derived_path(file_id: Uuid, name: &str) -> String {
    format!("derived/{file_id}/{name}")
}

/// Stream a stored object into the scratch directory.
///
/// A missing source is permanent: retrying cannot make the object appear.
/// Everything else is a transient storage fault.
pub(crate) async fn stage_to_scratch(
    storage: &Arc<dyn StorageProvider>,
    source_path: &str,
    scratch_dir: &Path,
) -> Result<PathBuf, JobExecutionError> {
    tokio::fs::create_dir_all(scratch_dir)
        .await
        .map_err(|e| JobExecutionError::Transient(format!("Scratch dir unavailable: {e}")))?;

    let extension = Path::new(source_path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let local = scratch_dir.join(format!("stage-{}{extension}", Uuid::new_v4()));

    let mut stream = storage.read(source_path).await.map_err(|e| {
        if e.kind == ErrorKind::NotFound {
            JobExecutionError::Permanent(format!("Source object missing: {source_path}"))
        } else {
            JobExecutionError::Transient(format!("Failed to open source {source_path}: {e}"))
        }
    })?;

    let mut file = tokio::fs::File::create(&local)
        .await
        .map_err(|e| JobExecutionError::Transient(format!("Failed to create staging file: {e}")))?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| JobExecutionError::Transient(format!("Failed to read source: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| JobExecutionError::Transient(format!("Failed to stage source: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| JobExecutionError::Transient(format!("Failed to flush staging file: {e}")))?;

    Ok(local)
}

/// Publish a local file into the storage provider.
pub(crate) async fn publish_from_scratch(
    storage: &Arc<dyn StorageProvider>,
    local: &Path,
    storage_path: &str,
) -> Result<u64, JobExecutionError> {
    let file = tokio::fs::File::open(local)
        .await
        .map_err(|e| JobExecutionError::Transient(format!("Failed to reopen output: {e}")))?;
    let stream = ReaderStream::new(file);
    storage
        .write_stream(storage_path, Box::pin(stream))
        .await
        .map_err(|e| JobExecutionError::Transient(format!("Failed to publish output: {e}")))
}

/// Remove scratch files, ignoring errors.
pub(crate) async fn discard(paths: &[PathBuf]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}
