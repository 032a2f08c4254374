//! File storage configuration.

use serde::{Deserialize, Serialize};

/// File storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_root")]
    pub root: String,
    /// Scratch directory for job handlers and assembly staging.
    #[serde(default = "default_scratch")]
    pub scratch_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            scratch_dir: default_scratch(),
        }
    }
}

fn default_root() -> String {
    "data/storage".to_string()
}

fn default_scratch() -> String {
    "data/scratch".to_string()
}
