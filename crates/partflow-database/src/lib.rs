//! # partflow-database
//!
//! PostgreSQL connection management and concrete repository implementations
//! for the Partflow entities. The job table here is the durable mirror of
//! the queue: the ground truth when the broker is unavailable and the audit
//! trail when it is.

pub mod connection;
pub mod migration;
pub mod repositories;

pub use connection::DatabasePool;
