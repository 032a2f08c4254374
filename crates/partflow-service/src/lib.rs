//! # partflow-service
//!
//! The operations layer: chunked upload sessions, job enqueueing against
//! the dual queue backend, and queue administration. Services own the
//! business rules; the database, broker, and storage crates stay mechanism.

pub mod admin;
pub mod queue;
pub mod store;
pub mod upload;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use admin::{AdminReport, QueueAdmin};
pub use queue::{JobQueue, QueueStats};
pub use store::{FileStore, JobStore, SessionStore};
pub use upload::UploadService;
