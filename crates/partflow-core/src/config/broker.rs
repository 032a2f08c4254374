//! Queue broker configuration.

use serde::{Deserialize, Serialize};

/// Queue broker configuration.
///
/// The broker is optional at runtime; when unreachable the system degrades
/// to polling the durable job store directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker provider: `"memory"` or `"redis"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Redis broker settings (used when provider = "redis").
    #[serde(default)]
    pub redis: RedisBrokerConfig,
}

/// Redis broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBrokerConfig {
    /// Redis connection URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Key prefix for all queue keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            redis: RedisBrokerConfig::default(),
        }
    }
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_provider() -> String {
    "memory".to_string()
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "partflow:".to_string()
}
