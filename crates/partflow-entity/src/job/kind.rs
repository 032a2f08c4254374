//! Job kind enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of background job kinds.
///
/// Each kind has its own bounded worker pool and its own payload variant in
/// [`super::payload::JobPayload`]; handler registration is exhaustive over
/// this enum rather than keyed by free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Video transcoding.
    Transcode,
    /// Thumbnail generation.
    Thumbnail,
    /// Document conversion.
    ConvertDocument,
    /// Archive compression.
    Compress,
    /// Derivative file cleanup by extension.
    CleanupExtensions,
}

impl JobKind {
    /// All job kinds, in the order worker pools are started.
    pub const ALL: [JobKind; 5] = [
        Self::Transcode,
        Self::Thumbnail,
        Self::ConvertDocument,
        Self::Compress,
        Self::CleanupExtensions,
    ];

    /// Return the kind as a snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcode => "transcode",
            Self::Thumbnail => "thumbnail",
            Self::ConvertDocument => "convert_document",
            Self::Compress => "compress",
            Self::CleanupExtensions => "cleanup_extensions",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
