//! Video transcode handler driving an ffmpeg-compatible CLI.

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

/// Hard ceiling on a single transcode run.
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Transcodes video uploads to a target preset with an external tool.
#[derive(Debug)]
pub struct TranscodeJobHandler {
    storage: Arc<dyn StorageProvider>,
    scratch_dir: PathBuf,
    command: String,
}

impl TranscodeJobHandler {
    /// Create a new transcode handler using the given tool command.
    pub fn new(storage: Arc<dyn StorageProvider>, scratch_dir: &str, command: &str) -> Self {
        Self {
            storage,
            scratch_dir: PathBuf::from(scratch_dir),
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl JobHandler for TranscodeJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Transcode
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
    ) -> Result<Option<Value>, JobExecutionError> {
        let JobPayload::Transcode {
            file_id,
            source_path,
            preset,
        } = job
            .typed_payload()
            .map_err(|e| JobExecutionError::Permanent(e.to_string()))?
        else {
            return Err(JobExecutionError::Permanent(
                "Payload is not a transcode request".into(),
            ));
        };

        let input = stage_to_scratch(&self.storage, &source_path, &self.scratch_dir).await?;
        let output = input.with_extension(format!("out.{preset}"));
        ctx.progress(10).await;

        let run = Command::new(&self.command)
            .arg("-y")
            .arg("-i")
            .arg(&input)
            .arg("-loglevel")
            .arg("error")
            .arg(&output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let result = tokio::time::timeout(TRANSCODE_TIMEOUT, run).await;
        let outcome = match result {
            Err(_) => Err(JobExecutionError::Transient(format!(
                "Transcode timed out after {}s",
                TRANSCODE_TIMEOUT.as_secs()
            ))),
            // A missing or broken tool is an environment problem; another
            // node or a later attempt may have it.
            Ok(Err(e)) => Err(JobExecutionError::Transient(format!(
                "Failed to run '{}': {e}",
                self.command
            ))),
            Ok(Ok(out)) if !out.status.success() => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                Err(JobExecutionError::Permanent(format!(
                    "Transcoder exited with {}: {}",
                    out.status,
                    stderr.trim().chars().take(500).collect::<String>()
                )))
            }
            Ok(Ok(_)) => Ok(()),
        };

        if let Err(e) = outcome {
            discard(&[input, output]).await;
            return Err(e);
        }
        ctx.progress(80).await;

        let target = derived_path(file_id, &format!("transcode.{preset}"));
        let publish = publish_from_scratch(&self.storage, &output, &target).await;
        discard(&[input, output]).await;
        let size_bytes = publish?;

        info!(file_id = %file_id, preset, size_bytes, "Transcode complete");
        Ok(Some(serde_json::json!({
            "output_path": target,
            "preset": preset,
            "size_bytes": size_bytes,
        })))
    }
}
