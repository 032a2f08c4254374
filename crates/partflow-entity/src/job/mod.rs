//! Background job domain entities.

pub mod kind;
pub mod model;
pub mod payload;
pub mod status;

pub use kind::JobKind;
pub use model::{CreateJob, Job};
pub use payload::JobPayload;
pub use status::{JobPriority, JobStatus};
