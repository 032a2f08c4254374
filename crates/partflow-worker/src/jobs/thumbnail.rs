//! Thumbnail generation handler.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use partflow_core::traits::storage::StorageProvider;
use partflow_entity::job::{Job, JobKind, JobPayload};

use crate::executor::{JobContext, JobExecutionError, JobHandler};

use super::derived_path;

/// Generates square PNG thumbnails for image uploads.
#[derive(Debug)]
pub struct ThumbnailJobHandler {
    storage: Arc<dyn StorageProvider>,
}

impl ThumbnailJobHandler {
    /// Create a new thumbnail handler.
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for ThumbnailJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Thumbnail
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
    ) -> Result<Option<Value>, JobExecutionError> {
        let JobPayload::Thumbnail {
            file_id,
            source_path,
            sizes,
        } = job
            .typed_payload()
            .map_err(|e| JobExecutionError::Permanent(e.to_string()))?
        else {
            return Err(JobExecutionError::Permanent(
                "Payload is not a thumbnail request".into(),
            ));
        };

        if sizes.is_empty() {
            return Err(JobExecutionError::Permanent(
                "Thumbnail request has no sizes".into(),
            ));
        }

        let data = self.storage.read_bytes(&source_path).await.map_err(|e| {
            if e.kind == partflow_core::error::ErrorKind::NotFound {
                JobExecutionError::Permanent(format!("Source object missing: {source_path}"))
            } else {
                JobExecutionError::Transient(e.to_string())
            }
        })?;

        // An undecodable image will stay undecodable; do not retry.
        let source = tokio::task::spawn_blocking(move || image::load_from_memory(&data))
            .await
            .map_err(|e| JobExecutionError::Transient(format!("Decode task failed: {e}")))?
            .map_err(|e| JobExecutionError::Permanent(format!("Undecodable image: {e}")))?;

        let total = sizes.len();
        let mut generated = Vec::with_capacity(total);
        for (i, size) in sizes.iter().copied().enumerate() {
            let thumb = source.thumbnail(size, size);
            let mut png = Cursor::new(Vec::new());
            thumb
                .write_to(&mut png, image::ImageFormat::Png)
                .map_err(|e| JobExecutionError::Permanent(format!("PNG encode failed: {e}")))?;

            let path = derived_path(file_id, &format!("thumb_{size}.png"));
            self.storage
                .write(&path, png.into_inner().into())
                .await
                .map_err(|e| JobExecutionError::Transient(e.to_string()))?;
            generated.push(path);

            ctx.progress(((i + 1) * 100 / total) as i16).await;
        }

        info!(file_id = %file_id, count = generated.len(), "Generated thumbnails");
        Ok(Some(serde_json::json!({ "thumbnails": generated })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use image::{DynamicImage, RgbImage};
    use partflow_entity::job::{CreateJob, JobPriority, JobStatus};
    use partflow_service::testing::memory_queue;
    use partflow_storage::LocalStorageProvider;
    use uuid::Uuid;

    async fn storage() -> (tempfile::TempDir, Arc<dyn StorageProvider>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalStorageProvider::new(dir.path().to_str().unwrap())
            .await
            .unwrap();
        (dir, Arc::new(provider))
    }

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            image::Rgb([120, 30, 200]),
        ));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        Bytes::from(cursor.into_inner())
    }

    fn thumbnail_job(file_id: Uuid, source_path: &str, sizes: Vec<u32>) -> Job {
        let data = CreateJob::from_payload(
            &JobPayload::Thumbnail {
                file_id,
                source_path: source_path.into(),
                sizes,
            },
            JobPriority::High,
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
    async fn test_generates_requested_sizes() {
        let (_dir, storage) = storage().await;
        let file_id = Uuid::new_v4();
        storage
            .write("objects/ab/abcd", png_bytes(64, 48))
            .await
            .unwrap();

        let handler = ThumbnailJobHandler::new(storage.clone());
        let job = thumbnail_job(file_id, "objects/ab/abcd", vec![16, 32]);
        let ctx = JobContext::new(job.id, memory_queue(30));

        let result = handler.execute(&job, &ctx).await.unwrap().unwrap();
        let thumbs = result["thumbnails"].as_array().unwrap();
        assert_eq!(thumbs.len(), 2);

        for (size, path) in [(16u32, &thumbs[0]), (32, &thumbs[1])] {
            let data = storage.read_bytes(path.as_str().unwrap()).await.unwrap();
            let thumb = image::load_from_memory(&data).unwrap();
            // Aspect ratio preserved: the longer edge matches the size.
            assert_eq!(thumb.width(), size);
        }
    }

    #[tokio::test]
    async fn test_undecodable_source_is_permanent() {
        let (_dir, storage) = storage().await;
        storage
            .write("objects/ab/junk", Bytes::from_static(b"not an image"))
            .await
            .unwrap();

        let handler = ThumbnailJobHandler::new(storage.clone());
        let job = thumbnail_job(Uuid::new_v4(), "objects/ab/junk", vec![16]);
        let ctx = JobContext::new(job.id, memory_queue(30));

        let err = handler.execute(&job, &ctx).await.unwrap_err();
        assert!(matches!(err, JobExecutionError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let (_dir, storage) = storage().await;
        let handler = ThumbnailJobHandler::new(storage);
        let job = thumbnail_job(Uuid::new_v4(), "objects/ab/nope", vec![16]);
        let ctx = JobContext::new(job.id, memory_queue(30));

        let err = handler.execute(&job, &ctx).await.unwrap_err();
        assert!(matches!(err, JobExecutionError::Permanent(_)));
    }
}
