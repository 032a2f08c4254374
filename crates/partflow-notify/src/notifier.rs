//! Topic-based broadcast notifier.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use partflow_core::events::{JobEvent, UploadEvent};

/// A published event together with its topic and publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic the event was published on.
    pub topic: String,
    /// Event payload, serialized as tagged JSON.
    pub event: serde_json::Value,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
}

/// Fan-out hub for progress events.
///
/// One notifier is shared across the process. Per-topic channels are created
/// lazily on first subscription and dropped once the last subscriber goes
/// away; publishing to a topic nobody watches is free. The firehose channel
/// receives every event regardless of topic.
#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    topics: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
    firehose: broadcast::Sender<Envelope>,
    buffer_size: usize,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ProgressNotifier {
    /// Create a notifier with the given per-channel buffer size.
    pub fn new(buffer_size: usize) -> Self {
        let (firehose, _) = broadcast::channel(buffer_size);
        Self {
            topics: Arc::new(DashMap::new()),
            firehose,
            buffer_size,
        }
    }

    /// Subscribe to a single topic.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .subscribe()
    }

    /// Subscribe to all events regardless of topic.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Envelope> {
        self.firehose.subscribe()
    }

    /// Publish a job lifecycle event.
    pub fn publish_job(&self, event: &JobEvent) {
        self.publish(&JobEvent::topic(event.job_id()), event);
    }

    /// Publish an upload session lifecycle event.
    pub fn publish_upload(&self, session_id: Uuid, event: &UploadEvent) {
        self.publish(&UploadEvent::topic(session_id), event);
    }

    /// Publish a serializable event on an explicit topic.
    ///
    /// Never fails and never blocks: serialization problems are logged and
    /// dropped, and so are events on topics with no listeners.
    pub fn publish<E: Serialize>(&self, topic: &str, event: &E) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                trace!(topic, error = %e, "Dropping unserializable event");
                return;
            }
        };

        let envelope = Envelope {
            topic: topic.to_string(),
            event: payload,
            published_at: Utc::now(),
        };

        let _ = self.firehose.send(envelope.clone());

        if let Some(sender) = self.topics.get(topic) {
            if sender.send(envelope).is_err() {
                // Last subscriber went away; retire the channel.
                drop(sender);
                self.topics
                    .remove_if(topic, |_, s| s.receiver_count() == 0);
            }
        }
    }

    /// Number of live topic channels.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_topic_events() {
        let notifier = ProgressNotifier::default();
        let job_id = Uuid::new_v4();
        let mut rx = notifier.subscribe(&JobEvent::topic(job_id));

        notifier.publish_job(&JobEvent::Queued {
            job_id,
            kind: "thumbnail".into(),
        });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, format!("job:{job_id}"));
        assert_eq!(envelope.event["type"], "Queued");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let notifier = ProgressNotifier::default();
        notifier.publish_job(&JobEvent::Cancelled {
            job_id: Uuid::new_v4(),
        });
    }

    #[tokio::test]
    async fn test_firehose_sees_all_topics() {
        let notifier = ProgressNotifier::default();
        let mut rx = notifier.subscribe_all();

        let session_id = Uuid::new_v4();
        notifier.publish_upload(session_id, &UploadEvent::Assembling { session_id });
        notifier.publish_job(&JobEvent::Cancelled {
            job_id: Uuid::new_v4(),
        });

        assert_eq!(rx.recv().await.unwrap().topic, format!("upload:{session_id}"));
        assert!(rx.recv().await.unwrap().topic.starts_with("job:"));
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let notifier = ProgressNotifier::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = notifier.subscribe(&JobEvent::topic(a));
        let _rx_b = notifier.subscribe(&JobEvent::topic(b));

        notifier.publish_job(&JobEvent::Cancelled { job_id: b });
        assert!(rx_a.try_recv().is_err());
    }
}
