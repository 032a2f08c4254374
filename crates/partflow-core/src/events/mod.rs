//! Lifecycle events emitted by Partflow operations.
//!
//! Events are published through the progress notifier and consumed by the
//! serving layer, which relays them to connected clients. Delivery is
//! fire-and-forget: a notification failure never blocks a state transition.

pub mod job;
pub mod upload;

pub use job::JobEvent;
pub use upload::UploadEvent;
