//! Broker manager that dispatches to the configured provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};
use uuid::Uuid;

use partflow_core::config::broker::BrokerConfig;
use partflow_core::error::AppError;
use partflow_core::result::AppResult;
use partflow_entity::job::{JobKind, JobPriority};

use crate::backend::QueueBroker;

/// Broker manager that wraps the configured queue broker and tracks its
/// availability.
///
/// One manager is constructed per process and passed by reference to the
/// enqueuer, workers, and administrator — there is no module-level broker
/// client. Every call records whether the broker answered, so callers can
/// cheaply switch to the durable-store polling path while it is down.
#[derive(Debug, Clone)]
pub struct BrokerManager {
    /// The inner queue broker.
    inner: Arc<dyn QueueBroker>,
    /// Whether the last broker operation succeeded.
    available: Arc<AtomicBool>,
}

impl BrokerManager {
    /// Create a new broker manager from configuration.
    pub async fn new(config: &BrokerConfig) -> AppResult<Self> {
        let inner: Arc<dyn QueueBroker> = match config.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => {
                info!("Initializing Redis queue broker");
                let client = crate::redis::RedisClient::connect(&config.redis).await?;
                Arc::new(crate::redis::RedisQueueBroker::new(client))
            }
            #[cfg(feature = "memory")]
            "memory" => {
                info!("Initializing in-memory queue broker");
                Arc::new(crate::memory::MemoryQueueBroker::new())
            }
            other => {
                return Err(AppError::configuration(format!(
                    "Unknown broker provider: '{other}'. Supported: memory, redis"
                )));
            }
        };

        Ok(Self {
            inner,
            available: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Create a broker manager from an existing provider (for testing).
    pub fn from_provider(provider: Arc<dyn QueueBroker>) -> Self {
        Self {
            inner: provider,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the broker answered its most recent operation.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// The provider type of the inner broker.
    pub fn provider_type(&self) -> &str {
        self.inner.provider_type()
    }

    fn record<T>(&self, result: AppResult<T>) -> AppResult<T> {
        match &result {
            Ok(_) => {
                if !self.available.swap(true, Ordering::Relaxed) {
                    info!("Queue broker is reachable again");
                }
            }
            Err(e) => {
                if self.available.swap(false, Ordering::Relaxed) {
                    warn!(error = %e, "Queue broker became unreachable");
                }
            }
        }
        result
    }

    /// Push a job handle; errors are reported, never absorbed — the caller
    /// decides whether the push was best-effort.
    pub async fn push(&self, kind: JobKind, job_id: Uuid, priority: JobPriority) -> AppResult<()> {
        let result = self.inner.push(kind, job_id, priority).await;
        self.record(result)
    }

    /// Pop the next handle for a kind.
    pub async fn pop(&self, kind: JobKind) -> AppResult<Option<Uuid>> {
        let result = self.inner.pop(kind).await;
        self.record(result)
    }

    /// Remove a specific handle.
    pub async fn remove(&self, kind: JobKind, job_id: Uuid) -> AppResult<bool> {
        let result = self.inner.remove(kind, job_id).await;
        self.record(result)
    }

    /// Dead-letter a handle.
    pub async fn dead_letter(&self, kind: JobKind, job_id: Uuid) -> AppResult<()> {
        let result = self.inner.dead_letter(kind, job_id).await;
        self.record(result)
    }

    /// Queue depth for a kind.
    pub async fn depth(&self, kind: JobKind) -> AppResult<u64> {
        let result = self.inner.depth(kind).await;
        self.record(result)
    }

    /// Probe broker health and update the availability flag.
    pub async fn health_check(&self) -> bool {
        let result = self.inner.health_check().await;
        matches!(self.record(result), Ok(true))
    }
}
