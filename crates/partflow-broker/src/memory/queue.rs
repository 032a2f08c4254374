//! In-memory priority queue broker for single-node deployments and tests.

use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use partflow_core::result::AppResult;
use partflow_entity::job::{JobKind, JobPriority};

use crate::backend::QueueBroker;

/// A queued handle ordered by priority, then FIFO within a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: JobPriority,
    // Negated insertion sequence so the max-heap pops oldest first
    // within the same priority.
    seq: i64,
    job_id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<JobKind, BinaryHeap<Entry>>,
    dead: HashMap<JobKind, Vec<Uuid>>,
    next_seq: i64,
}

/// In-memory queue broker.
#[derive(Debug, Default)]
pub struct MemoryQueueBroker {
    inner: Mutex<Inner>,
}

impl MemoryQueueBroker {
    /// Create a new in-memory queue broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect a kind's dead-letter list (for tests and diagnostics).
    pub async fn dead_letters(&self, kind: JobKind) -> Vec<Uuid> {
        let inner = self.inner.lock().await;
        inner.dead.get(&kind).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl QueueBroker for MemoryQueueBroker {
    fn provider_type(&self) -> &str {
        "memory"
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }

    async fn push(&self, kind: JobKind, job_id: Uuid, priority: JobPriority) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queues.entry(kind).or_default().push(Entry {
            priority,
            seq: -seq,
            job_id,
        });
        Ok(())
    }

    async fn pop(&self, kind: JobKind) -> AppResult<Option<Uuid>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get_mut(&kind)
            .and_then(|heap| heap.pop())
            .map(|e| e.job_id))
    }

    async fn remove(&self, kind: JobKind, job_id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(heap) = inner.queues.get_mut(&kind) else {
            return Ok(false);
        };
        let before = heap.len();
        let kept: BinaryHeap<Entry> = heap.drain().filter(|e| e.job_id != job_id).collect();
        let removed = kept.len() < before;
        *heap = kept;
        Ok(removed)
    }

    async fn dead_letter(&self, kind: JobKind, job_id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.dead.entry(kind).or_default().push(job_id);
        Ok(())
    }

    async fn depth(&self, kind: JobKind) -> AppResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(&kind).map_or(0, |h| h.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let broker = MemoryQueueBroker::new();
        let low = Uuid::new_v4();
        let first_normal = Uuid::new_v4();
        let second_normal = Uuid::new_v4();
        let critical = Uuid::new_v4();

        broker
            .push(JobKind::Thumbnail, low, JobPriority::Low)
            .await
            .unwrap();
        broker
            .push(JobKind::Thumbnail, first_normal, JobPriority::Normal)
            .await
            .unwrap();
        broker
            .push(JobKind::Thumbnail, second_normal, JobPriority::Normal)
            .await
            .unwrap();
        broker
            .push(JobKind::Thumbnail, critical, JobPriority::Critical)
            .await
            .unwrap();

        assert_eq!(broker.pop(JobKind::Thumbnail).await.unwrap(), Some(critical));
        assert_eq!(
            broker.pop(JobKind::Thumbnail).await.unwrap(),
            Some(first_normal)
        );
        assert_eq!(
            broker.pop(JobKind::Thumbnail).await.unwrap(),
            Some(second_normal)
        );
        assert_eq!(broker.pop(JobKind::Thumbnail).await.unwrap(), Some(low));
        assert_eq!(broker.pop(JobKind::Thumbnail).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queues_are_isolated_per_kind() {
        let broker = MemoryQueueBroker::new();
        let id = Uuid::new_v4();
        broker
            .push(JobKind::Transcode, id, JobPriority::Normal)
            .await
            .unwrap();

        assert_eq!(broker.pop(JobKind::Thumbnail).await.unwrap(), None);
        assert_eq!(broker.depth(JobKind::Transcode).await.unwrap(), 1);
        assert_eq!(broker.pop(JobKind::Transcode).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_remove_specific_handle() {
        let broker = MemoryQueueBroker::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        broker
            .push(JobKind::Compress, keep, JobPriority::Normal)
            .await
            .unwrap();
        broker
            .push(JobKind::Compress, drop, JobPriority::Normal)
            .await
            .unwrap();

        assert!(broker.remove(JobKind::Compress, drop).await.unwrap());
        assert!(!broker.remove(JobKind::Compress, drop).await.unwrap());
        assert_eq!(broker.pop(JobKind::Compress).await.unwrap(), Some(keep));
        assert_eq!(broker.pop(JobKind::Compress).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dead_letter() {
        let broker = MemoryQueueBroker::new();
        let id = Uuid::new_v4();
        broker.dead_letter(JobKind::Transcode, id).await.unwrap();
        assert_eq!(broker.dead_letters(JobKind::Transcode).await, vec![id]);
    }
}
