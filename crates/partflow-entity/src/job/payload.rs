//! Typed job payload definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::kind::JobKind;

/// Typed payloads for the closed set of job kinds.
///
/// The discriminant mirrors [`JobKind`] so a payload can never be handed to
/// the wrong handler; deserializing a row's JSON payload against this enum
/// is the only place the opaque column is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Transcode a video file to a target preset.
    Transcode {
        /// The registered file ID.
        file_id: Uuid,
        /// Storage path of the source object.
        source_path: String,
        /// Target container/preset (e.g., "mp4", "webm").
        preset: String,
    },
    /// Generate thumbnails for an image or video poster frame.
    Thumbnail {
        /// The registered file ID.
        file_id: Uuid,
        /// Storage path of the source object.
        source_path: String,
        /// Requested square sizes in pixels.
        sizes: Vec<u32>,
    },
    /// Convert a document to another format.
    ConvertDocument {
        /// The registered file ID.
        file_id: Uuid,
        /// Storage path of the source object.
        source_path: String,
        /// Target format extension (e.g., "pdf").
        target_format: String,
    },
    /// Compress a set of objects into a tar.gz archive.
    Compress {
        /// Storage paths of the objects to archive.
        source_paths: Vec<String>,
        /// Storage path of the resulting archive.
        archive_path: String,
    },
    /// Delete derivative files with the given extensions under a prefix.
    CleanupExtensions {
        /// Storage path prefix to scan.
        prefix: String,
        /// Extensions to delete (without the leading dot).
        extensions: Vec<String>,
    },
}

impl JobPayload {
    /// The job kind this payload belongs to.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Transcode { .. } => JobKind::Transcode,
            Self::Thumbnail { .. } => JobKind::Thumbnail,
            Self::ConvertDocument { .. } => JobKind::ConvertDocument,
            Self::Compress { .. } => JobKind::Compress,
            Self::CleanupExtensions { .. } => JobKind::CleanupExtensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip_kind_tag() {
        let payload = JobPayload::Thumbnail {
            file_id: Uuid::new_v4(),
            source_path: "objects/ab/abcd".to_string(),
            sizes: vec![128, 512],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "thumbnail");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), JobKind::Thumbnail);
    }

    #[test]
    fn test_kind_discriminant_matches() {
        let payload = JobPayload::CleanupExtensions {
            prefix: "derived/".to_string(),
            extensions: vec!["tmp".to_string()],
        };
        assert_eq!(payload.kind().as_str(), "cleanup_extensions");
    }
}
