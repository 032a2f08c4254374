//! # partflow-core
//!
//! Shared foundation for the Partflow upload and job-orchestration system:
//! the unified error type, configuration schemas, lifecycle events, and the
//! storage provider trait implemented by `partflow-storage`.

pub mod config;
pub mod error;
pub mod events;
pub mod result;
pub mod traits;

pub use error::{AppError, ErrorKind};
pub use result::AppResult;
