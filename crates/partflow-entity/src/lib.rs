//! # partflow-entity
//!
//! Domain entities shared across the Partflow crates: chunked upload
//! sessions, background jobs with their typed payloads, and registered
//! file records.

pub mod file;
pub mod job;
pub mod upload;
