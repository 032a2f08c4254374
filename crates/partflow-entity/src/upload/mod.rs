//! Chunked upload domain entities.

pub mod session;

pub use session::{CreateUploadSession, SessionStatus, UploadSession};
