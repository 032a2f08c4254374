//! # partflow-broker
//!
//! Queue broker backends for Partflow. Supports two modes:
//!
//! - **memory**: In-process priority queues for single-node deployments
//! - **redis**: Redis-backed sorted-set queues using the [redis](https://crates.io/crates/redis) crate
//!
//! The broker is a performance accelerant over the durable job store, never
//! a source of truth: every operation here may fail or lose handles without
//! losing jobs. The provider is selected at runtime based on configuration.

pub mod backend;
pub mod keys;
pub mod manager;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use backend::QueueBroker;
pub use manager::BrokerManager;
