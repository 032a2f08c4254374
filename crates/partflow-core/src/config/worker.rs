//! Background worker and queue administration configuration.

use serde::{Deserialize, Serialize};

/// Background job worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether the worker pools are enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval in seconds between job store polls when the broker is
    /// empty or unreachable.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Lease duration in seconds granted to a worker per job.
    #[serde(default = "default_lease")]
    pub lease_seconds: i64,
    /// Base delay in seconds for exponential retry backoff.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: i64,
    /// Per-kind worker pool sizes.
    #[serde(default)]
    pub pools: PoolSizes,
    /// External tool commands used by job handlers.
    #[serde(default)]
    pub tools: ToolConfig,
    /// Queue administration settings.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Bounded worker pool size per job kind.
///
/// Transcoding is CPU/GPU heavy so its pool defaults small; lighter kinds
/// get more slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSizes {
    /// Video transcoding workers.
    #[serde(default = "default_transcode_pool")]
    pub transcode: usize,
    /// Thumbnail generation workers.
    #[serde(default = "default_thumbnail_pool")]
    pub thumbnail: usize,
    /// Document conversion workers.
    #[serde(default = "default_convert_pool")]
    pub convert_document: usize,
    /// Archive compression workers.
    #[serde(default = "default_compress_pool")]
    pub compress: usize,
    /// Derivative cleanup workers.
    #[serde(default = "default_cleanup_pool")]
    pub cleanup_extensions: usize,
}

/// External tool commands invoked by job handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Video transcoder command (ffmpeg-compatible CLI).
    #[serde(default = "default_transcoder")]
    pub transcoder: String,
    /// Document converter command (LibreOffice-compatible CLI).
    #[serde(default = "default_document_converter")]
    pub document_converter: String,
}

/// Queue administration and reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Seconds between reconciliation passes that re-offer pending jobs
    /// to the broker.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
    /// Grace period in seconds before a pending job is considered missed
    /// by the broker and re-offered.
    #[serde(default = "default_reconcile_grace")]
    pub reconcile_grace_seconds: i64,
    /// Grace period in seconds past lease expiry before a processing job
    /// is treated as stalled.
    #[serde(default = "default_stall_grace")]
    pub stall_grace_seconds: i64,
    /// Days that terminal jobs are retained before cleanup deletes them.
    #[serde(default = "default_retention")]
    pub retention_days: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: default_poll_interval(),
            lease_seconds: default_lease(),
            backoff_base_seconds: default_backoff_base(),
            pools: PoolSizes::default(),
            tools: ToolConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            transcode: default_transcode_pool(),
            thumbnail: default_thumbnail_pool(),
            convert_document: default_convert_pool(),
            compress: default_compress_pool(),
            cleanup_extensions: default_cleanup_pool(),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            transcoder: default_transcoder(),
            document_converter: default_document_converter(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: default_reconcile_interval(),
            reconcile_grace_seconds: default_reconcile_grace(),
            stall_grace_seconds: default_stall_grace(),
            retention_days: default_retention(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    5
}

fn default_lease() -> i64 {
    120
}

fn default_backoff_base() -> i64 {
    30
}

fn default_transcode_pool() -> usize {
    2
}

fn default_thumbnail_pool() -> usize {
    4
}

fn default_convert_pool() -> usize {
    2
}

fn default_compress_pool() -> usize {
    2
}

fn default_cleanup_pool() -> usize {
    1
}

fn default_transcoder() -> String {
    "ffmpeg".to_string()
}

fn default_document_converter() -> String {
    "soffice".to_string()
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_reconcile_grace() -> i64 {
    30
}

fn default_stall_grace() -> i64 {
    60
}

fn default_retention() -> i64 {
    7
}
