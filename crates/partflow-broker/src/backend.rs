//! Queue broker trait.

use async_trait::async_trait;
use uuid::Uuid;

use partflow_core::result::AppResult;
use partflow_entity::job::{JobKind, JobPriority};

/// Trait for broker-backed job queues.
///
/// A broker holds ephemeral job handles (IDs) in one FIFO-with-priority
/// queue per job kind. Handles are hints: popping one does not transfer
/// ownership — only the conditional lease against the job store does.
/// Implementations must therefore tolerate duplicate or stale handles.
#[async_trait]
pub trait QueueBroker: Send + Sync + std::fmt::Debug + 'static {
    /// Return the provider type name (e.g., "redis", "memory").
    fn provider_type(&self) -> &str;

    /// Check whether the broker is healthy and reachable.
    async fn health_check(&self) -> AppResult<bool>;

    /// Push a job handle onto the queue for its kind.
    async fn push(&self, kind: JobKind, job_id: Uuid, priority: JobPriority) -> AppResult<()>;

    /// Pop the highest-priority handle from a kind's queue.
    async fn pop(&self, kind: JobKind) -> AppResult<Option<Uuid>>;

    /// Remove a specific handle from a kind's queue (e.g., on cancel).
    /// Returns `true` if a handle was removed.
    async fn remove(&self, kind: JobKind, job_id: Uuid) -> AppResult<bool>;

    /// Move a handle to the kind's dead-letter list for inspection.
    async fn dead_letter(&self, kind: JobKind, job_id: Uuid) -> AppResult<()>;

    /// Number of handles waiting in a kind's queue.
    async fn depth(&self, kind: JobKind) -> AppResult<u64>;
}
