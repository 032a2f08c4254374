//! # partflow-worker
//!
//! Job execution: per-kind bounded worker pools that lease jobs from the
//! dual queue backend, the handler registry they dispatch through, and the
//! cron scheduler driving periodic maintenance (reconcile, stall
//! reclamation, session expiry, retention cleanup).

pub mod executor;
pub mod jobs;
pub mod runner;
pub mod scheduler;

pub use executor::{JobContext, JobExecutionError, JobExecutor, JobHandler};
pub use runner::WorkerPool;
pub use scheduler::MaintenanceScheduler;
