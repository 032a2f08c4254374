//! Derivative cleanup handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use partflow_core::traits::storage::StorageProvider;
use partflow_entity::job::{Job, JobKind, JobPayload};

use crate::executor::{JobContext, JobExecutionError, JobHandler};

/// Deletes files with the given extensions under a storage prefix.
#[derive(Debug)]
pub struct CleanupExtensionsJobHandler {
    storage: Arc<dyn StorageProvider>,
}

impl CleanupExtensionsJobHandler {
    /// Create a new cleanup handler.
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    fn matches(path: &str, extensions: &[String]) -> bool {
        extensions
            .iter()
            .any(|ext| path.ends_with(&format!(".{}", ext.trim_start_matches('.'))))
    }
}

#[async_trait]
impl JobHandler for CleanupExtensionsJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::CleanupExtensions
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
    ) -> Result<Option<Value>, JobExecutionError> {
        let JobPayload::CleanupExtensions { prefix, extensions } = job
            .typed_payload()
            .map_err(|e| JobExecutionError::Permanent(e.to_string()))?
        else {
            return Err(JobExecutionError::Permanent(
                "Payload is not a cleanup request".into(),
            ));
        };

        if extensions.is_empty() {
            return Err(JobExecutionError::Permanent(
                "Cleanup request has no extensions".into(),
            ));
        }

        // Breadth-first walk under the prefix.
        let mut deleted = 0u64;
        let mut pending = vec![prefix.clone()];
        while let Some(dir) = pending.pop() {
            let entries = self
                .storage
                .list(&dir)
                .await
                .map_err(|e| JobExecutionError::Transient(e.to_string()))?;

            for entry in entries {
                if entry.is_directory {
                    pending.push(entry.path);
                } else if Self::matches(&entry.path, &extensions) {
                    self.storage
                        .delete(&entry.path)
                        .await
                        .map_err(|e| JobExecutionError::Transient(e.to_string()))?;
                    deleted += 1;
                }
            }
        }
        ctx.progress(100).await;

        info!(prefix = %prefix, deleted, "Cleanup pass complete");
        Ok(Some(serde_json::json!({ "deleted": deleted })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use partflow_entity::job::{CreateJob, JobPriority, JobStatus};
    use partflow_service::testing::memory_queue;
    use partflow_storage::LocalStorageProvider;
    use uuid::Uuid;

    fn cleanup_job(prefix: &str, extensions: Vec<String>) -> Job {
        let data = CreateJob::from_payload(
            &JobPayload::CleanupExtensions {
                prefix: prefix.into(),
                extensions,
            },
            JobPriority::Low,
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
    async fn test_deletes_matching_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageProvider> = Arc::new(
            LocalStorageProvider::new(dir.path().to_str().unwrap())
                .await
                .unwrap(),
        );
        storage
            .write("derived/a/thumb.tmp", Bytes::from_static(b"x"))
            .await
            .unwrap();
        storage
            .write("derived/a/nested/old.bak", Bytes::from_static(b"x"))
            .await
            .unwrap();
        storage
            .write("derived/a/keep.png", Bytes::from_static(b"x"))
            .await
            .unwrap();
        storage
            .write("objects/outside.tmp", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let handler = CleanupExtensionsJobHandler::new(storage.clone());
        let job = cleanup_job("derived", vec!["tmp".into(), "bak".into()]);
        let ctx = JobContext::new(job.id, memory_queue(30));

        let result = handler.execute(&job, &ctx).await.unwrap().unwrap();
        assert_eq!(result["deleted"], 2);

        assert!(!storage.exists("derived/a/thumb.tmp").await.unwrap());
        assert!(!storage.exists("derived/a/nested/old.bak").await.unwrap());
        assert!(storage.exists("derived/a/keep.png").await.unwrap());
        // Files outside the prefix are untouched.
        assert!(storage.exists("objects/outside.tmp").await.unwrap());
    }

    #[test]
    fn test_extension_matching_handles_leading_dot() {
        assert!(CleanupExtensionsJobHandler::matches(
            "a/b.tmp",
            &[".tmp".into()]
        ));
        assert!(!CleanupExtensionsJobHandler::matches(
            "a/btmp",
            &["tmp".into()]
        ));
    }
}
