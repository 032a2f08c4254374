//! Redis sorted-set queue broker implementation.
//!
//! Each job kind gets one sorted set. The score encodes priority in the
//! high digits and enqueue time in the low digits, so `ZPOPMIN` yields
//! FIFO-within-priority ordering. Dead-lettered handles go to a plain list
//! per kind.

use async_trait::async_trait;
use redis::AsyncCommands;
use uuid::Uuid;

use partflow_core::error::{AppError, ErrorKind};
use partflow_core::result::AppResult;
use partflow_entity::job::{JobKind, JobPriority};

use crate::backend::QueueBroker;
use crate::keys;

use super::client::RedisClient;

/// Multiplier separating the priority band from the millisecond timestamp.
/// Timestamps stay below this for the next few centuries, and the combined
/// score stays well inside f64's exact integer range.
const PRIORITY_BAND: f64 = 1e13;

/// Redis-backed queue broker.
#[derive(Debug, Clone)]
pub struct RedisQueueBroker {
    /// Redis client.
    client: RedisClient,
}

impl RedisQueueBroker {
    /// Create a new Redis queue broker.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Map a Redis error to an AppError.
    fn map_err(e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Broker, format!("Redis error: {e}"), e)
    }

    /// Compute the sort score: lower pops first.
    fn score(priority: JobPriority) -> f64 {
        let band = (4 - priority.numeric_priority()) as f64;
        band * PRIORITY_BAND + chrono::Utc::now().timestamp_millis() as f64
    }
}

#[async_trait]
impl QueueBroker for RedisQueueBroker {
    fn provider_type(&self) -> &str {
        "redis"
    }

    async fn health_check(&self) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(pong == "PONG")
    }

    async fn push(&self, kind: JobKind, job_id: Uuid, priority: JobPriority) -> AppResult<()> {
        let key = self.client.prefixed_key(&keys::queue(kind));
        let mut conn = self.client.conn_mut();
        let _: () = conn
            .zadd(&key, job_id.to_string(), Self::score(priority))
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn pop(&self, kind: JobKind) -> AppResult<Option<Uuid>> {
        let key = self.client.prefixed_key(&keys::queue(kind));
        let mut conn = self.client.conn_mut();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(&key)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        match popped.into_iter().next() {
            Some((member, _score)) => {
                let id = Uuid::parse_str(&member).map_err(|e| {
                    AppError::with_source(
                        ErrorKind::Broker,
                        format!("Malformed job handle in queue '{key}'"),
                        e,
                    )
                })?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, kind: JobKind, job_id: Uuid) -> AppResult<bool> {
        let key = self.client.prefixed_key(&keys::queue(kind));
        let mut conn = self.client.conn_mut();
        let removed: i64 = conn
            .zrem(&key, job_id.to_string())
            .await
            .map_err(Self::map_err)?;
        Ok(removed > 0)
    }

    async fn dead_letter(&self, kind: JobKind, job_id: Uuid) -> AppResult<()> {
        let key = self.client.prefixed_key(&keys::dead_letter(kind));
        let mut conn = self.client.conn_mut();
        let _: () = conn
            .lpush(&key, job_id.to_string())
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn depth(&self, kind: JobKind) -> AppResult<u64> {
        let key = self.client.prefixed_key(&keys::queue(kind));
        let mut conn = self.client.conn_mut();
        let count: u64 = conn.zcard(&key).await.map_err(Self::map_err)?;
        Ok(count)
    }
}
