//! # partflow-notify
//!
//! In-process progress notification fan-out. Operations publish lifecycle
//! events to per-entity topics; subscribers (the serving layer, tests)
//! receive them over broadcast channels. Delivery is best-effort — a topic
//! with no subscribers drops the event, and a slow subscriber that lags
//! behind the channel buffer loses the oldest events, never blocking the
//! publisher.

pub mod notifier;

pub use notifier::{Envelope, ProgressNotifier};
