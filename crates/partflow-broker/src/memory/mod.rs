//! In-process broker implementation.

pub mod queue;

pub use queue::MemoryQueueBroker;
