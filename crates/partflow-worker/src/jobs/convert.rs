//! Document conversion handler driving a LibreOffice-compatible CLI.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::info;

use partflow_core::traits::storage::StorageProvider;
use partflow_entity::job::{Job, JobKind, JobPayload};

use crate::executor::{JobContext, JobExecutionError, JobHandler};

use super::{derived_path, discard, publish_from_scratch, stage_to_scratch};

const CONVERT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Converts document uploads to a target format with an external tool.
#[derive(Debug)]
pub struct ConvertDocumentJobHandler {
    storage: Arc<dyn StorageProvider>,
    scratch_dir: PathBuf,
    command: String,
}

impl ConvertDocumentJobHandler {
    /// Create a new document conversion handler.
    pub fn new(storage: Arc<dyn StorageProvider>, scratch_dir: &str, command: &str) -> Self {
        Self {
            storage,
            scratch_dir: PathBuf::from(scratch_dir),
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl JobHandler for ConvertDocumentJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::ConvertDocument
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
    ) -> Result<Option<Value>, JobExecutionError> {
        let JobPayload::ConvertDocument {
            file_id,
            source_path,
            target_format,
        } = job
            .typed_payload()
            .map_err(|e| JobExecutionError::Permanent(e.to_string()))?
        else {
            return Err(JobExecutionError::Permanent(
                "Payload is not a document conversion request".into(),
            ));
        };

        let input = stage_to_scratch(&self.storage, &source_path, &self.scratch_dir).await?;
        ctx.progress(10).await;

        // The converter writes `<stem>.<format>` into the output directory.
        let out_dir = &self.scratch_dir;
        let output = input.with_extension(&target_format);

        let run = Command::new(&self.command)
            .arg("--headless")
            .arg("--convert-to")
            .arg(&target_format)
            .arg("--outdir")
            .arg(out_dir)
            .arg(&input)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let result = tokio::time::timeout(CONVERT_TIMEOUT, run).await;
        let outcome = match result {
            Err(_) => Err(JobExecutionError::Transient(format!(
                "Conversion timed out after {}s",
                CONVERT_TIMEOUT.as_secs()
            ))),
            Ok(Err(e)) => Err(JobExecutionError::Transient(format!(
                "Failed to run '{}': {e}",
                self.command
            ))),
            Ok(Ok(out)) if !out.status.success() => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                Err(JobExecutionError::Permanent(format!(
                    "Converter exited with {}: {}",
                    out.status,
                    stderr.trim().chars().take(500).collect::<String>()
                )))
            }
            Ok(Ok(_)) if !output.exists() => Err(JobExecutionError::Permanent(
                "Converter produced no output".into(),
            )),
            Ok(Ok(_)) => Ok(()),
        };

        if let Err(e) = outcome {
            discard(&[input, output]).await;
            return Err(e);
        }
        ctx.progress(80).await;

        let target = derived_path(file_id, &format!("converted.{target_format}"));
        let publish = publish_from_scratch(&self.storage, &output, &target).await;
        discard(&[input, output]).await;
        let size_bytes = publish?;

        info!(file_id = %file_id, format = %target_format, size_bytes, "Conversion complete");
        Ok(Some(serde_json::json!({
            "output_path": target,
            "format": target_format,
            "size_bytes": size_bytes,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partflow_entity::job::{CreateJob, JobPriority, JobStatus};
    use partflow_service::testing::memory_queue;
    use partflow_storage::LocalStorageProvider;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_unavailable_tool_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageProvider> = Arc::new(
            LocalStorageProvider::new(dir.path().join("s").to_str().unwrap())
                .await
                .unwrap(),
        );
        storage
            .write("objects/ab/doc.odt", bytes::Bytes::from_static(b"fake"))
            .await
            .unwrap();

        let handler = ConvertDocumentJobHandler::new(
            storage,
            dir.path().join("scratch").to_str().unwrap(),
            "definitely-not-a-real-converter",
        );

        let data = CreateJob::from_payload(
            &JobPayload::ConvertDocument {
                file_id: Uuid::new_v4(),
                source_path: "objects/ab/doc.odt".into(),
                target_format: "pdf".into(),
            },
            JobPriority::Normal,
        )
        .unwrap();
        let now = chrono::Utc::now();
        let job = Job {
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
        };

        let ctx = JobContext::new(job.id, memory_queue(30));
        let err = handler.execute(&job, &ctx).await.unwrap_err();
        assert!(matches!(err, JobExecutionError::Transient(_)));
    }
}
