//! Archive compression handler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use partflow_core::traits::storage::StorageProvider;
use partflow_entity::job::{Job, JobKind, JobPayload};

use crate::executor::{JobContext, JobExecutionError, JobHandler};

use super::{discard, publish_from_scratch, stage_to_scratch};

/// Bundles a set of stored objects into a gzipped tar archive.
#[derive(Debug)]
pub struct CompressJobHandler {
    storage: Arc<dyn StorageProvider>,
    scratch_dir: PathBuf,
}

impl CompressJobHandler {
    /// Create a new compression handler.
    pub fn new(storage: Arc<dyn StorageProvider>, scratch_dir: &str) -> Self {
        Self {
            storage,
            scratch_dir: PathBuf::from(scratch_dir),
        }
    }

    /// Archive entry name for a storage path: the file name, qualified by
    /// position when names collide.
    fn entry_name(storage_path: &str, index: usize, seen: &mut Vec<String>) -> String {
        let base = Path::new(storage_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("entry-{index}"));
        let name = if seen.contains(&base) {
            format!("{index}-{base}")
        } else {
            base
        };
        seen.push(name.clone());
        name
    }
}

#[async_trait]
impl JobHandler for CompressJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Compress
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
    ) -> Result<Option<Value>, JobExecutionError> {
        let JobPayload::Compress {
            source_paths,
            archive_path,
        } = job
            .typed_payload()
            .map_err(|e| JobExecutionError::Permanent(e.to_string()))?
        else {
            return Err(JobExecutionError::Permanent(
                "Payload is not a compression request".into(),
            ));
        };

        if source_paths.is_empty() {
            return Err(JobExecutionError::Permanent(
                "Compression request has no sources".into(),
            ));
        }

        let mut staged = Vec::with_capacity(source_paths.len());
        for (i, source) in source_paths.iter().enumerate() {
            let local = match stage_to_scratch(&self.storage, source, &self.scratch_dir).await {
                Ok(p) => p,
                Err(e) => {
                    discard(&staged).await;
                    return Err(e);
                }
            };
            staged.push(local);
            ctx.progress((((i + 1) * 50) / source_paths.len()) as i16).await;
        }

        let archive_local = self
            .scratch_dir
            .join(format!("archive-{}.tar.gz", Uuid::new_v4()));

        // tar + flate2 are blocking writers.
        let build = {
            let staged = staged.clone();
            let sources = source_paths.clone();
            let archive_local = archive_local.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let file = std::fs::File::create(&archive_local)?;
                let encoder = GzEncoder::new(file, Compression::default());
                let mut builder = tar::Builder::new(encoder);

                let mut seen = Vec::new();
                for (i, (local, source)) in staged.iter().zip(&sources).enumerate() {
                    let name = Self::entry_name(source, i, &mut seen);
                    builder.append_path_with_name(local, name)?;
                }
                builder.into_inner()?.finish()?;
                Ok(())
            })
            .await
        };

        let build_result = match build {
            Ok(r) => r,
            Err(e) => {
                discard(&staged).await;
                return Err(JobExecutionError::Transient(format!(
                    "Archive task failed: {e}"
                )));
            }
        };
        if let Err(e) = build_result {
            discard(&staged).await;
            let _ = tokio::fs::remove_file(&archive_local).await;
            return Err(JobExecutionError::Transient(format!(
                "Failed to build archive: {e}"
            )));
        }
        ctx.progress(80).await;

        let publish = publish_from_scratch(&self.storage, &archive_local, &archive_path).await;
        discard(&staged).await;
        let _ = tokio::fs::remove_file(&archive_local).await;
        let size_bytes = publish?;

        info!(
            archive = %archive_path,
            entries = source_paths.len(),
            size_bytes,
            "Archive built"
        );
        Ok(Some(serde_json::json!({
            "archive_path": archive_path,
            "entries": source_paths.len(),
            "size_bytes": size_bytes,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flate2::read::GzDecoder;
    use partflow_entity::job::{CreateJob, JobPriority, JobStatus};
    use partflow_service::testing::memory_queue;
    use partflow_storage::LocalStorageProvider;
    use std::io::Read;

    fn compress_job(source_paths: Vec<String>, archive_path: &str) -> Job {
        let data = CreateJob::from_payload(
            &JobPayload::Compress {
                source_paths,
                archive_path: archive_path.into(),
            },
            JobPriority::Normal,
        )
        .unwrap();
        let now = chrono::Utc::now();
        Job {
            id: Uuid::new_v4(),
            kind: data.kind,
            priority: data.priority,
            payload: data.payload,
            result: None,
            last_error: None,
            status: JobStatus::Processing,
            attempts: 1,
            max_attempts: 3,
            progress: 0,
            dedup_key: None,
            scheduled_at: None,
            lease_expires_at: None,
            worker_id: Some("w1".into()),
            created_at: now,
            started_at: Some(now),
            finished_at: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_archives_all_sources() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageProvider> = Arc::new(
            LocalStorageProvider::new(dir.path().join("s").to_str().unwrap())
                .await
                .unwrap(),
        );
        storage
            .write("objects/aa/one.txt", Bytes::from_static(b"first"))
            .await
            .unwrap();
        storage
            .write("objects/bb/two.txt", Bytes::from_static(b"second"))
            .await
            .unwrap();

        let handler =
            CompressJobHandler::new(storage.clone(), dir.path().join("scratch").to_str().unwrap());
        let job = compress_job(
            vec!["objects/aa/one.txt".into(), "objects/bb/two.txt".into()],
            "archives/bundle.tar.gz",
        );
        let ctx = JobContext::new(job.id, memory_queue(30));

        let result = handler.execute(&job, &ctx).await.unwrap().unwrap();
        assert_eq!(result["entries"], 2);

        // The published archive decompresses back to the source contents.
        let archive = storage.read_bytes("archives/bundle.tar.gz").await.unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(&archive[..]));
        let mut names = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            names.push((name, contents));
        }
        names.sort();
        assert_eq!(
            names,
            vec![
                ("one.txt".to_string(), "first".to_string()),
                ("two.txt".to_string(), "second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageProvider> = Arc::new(
            LocalStorageProvider::new(dir.path().join("s").to_str().unwrap())
                .await
                .unwrap(),
        );
        let handler =
            CompressJobHandler::new(storage, dir.path().join("scratch").to_str().unwrap());
        let job = compress_job(vec!["objects/aa/gone".into()], "archives/x.tar.gz");
        let ctx = JobContext::new(job.id, memory_queue(30));

        let err = handler.execute(&job, &ctx).await.unwrap_err();
        assert!(matches!(err, JobExecutionError::Permanent(_)));
    }

    #[test]
    fn test_entry_names_deduplicate() {
        let mut seen = Vec::new();
        assert_eq!(
            CompressJobHandler::entry_name("a/report.pdf", 0, &mut seen),
            "report.pdf"
        );
        assert_eq!(
            CompressJobHandler::entry_name("b/report.pdf", 1, &mut seen),
            "1-report.pdf"
        );
    }
}
