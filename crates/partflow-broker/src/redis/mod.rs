//! Redis-backed broker implementation.

pub mod client;
pub mod queue;

pub use client::RedisClient;
pub use queue::RedisQueueBroker;
