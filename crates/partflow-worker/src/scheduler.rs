//! Cron scheduler for periodic queue and upload maintenance.

use std::time::Duration;

use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info};

use partflow_core::config::worker::AdminConfig;
use partflow_core::error::AppError;
use partflow_core::result::AppResult;
use partflow_service::{QueueAdmin, UploadService};

/// Schedules the recurring maintenance passes:
///
/// - reconcile: re-offer unleased pending jobs to the broker
/// - stall reclamation: return expired-lease jobs to pending
/// - session sweep: expire stale upload sessions and purge chunks
/// - retention cleanup: delete terminal jobs past the retention window
pub struct MaintenanceScheduler {
    scheduler: JobScheduler,
    admin: QueueAdmin,
    uploads: UploadService,
    config: AdminConfig,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler").finish()
    }
}

impl MaintenanceScheduler {
    /// Create a new maintenance scheduler.
    pub async fn new(
        admin: QueueAdmin,
        uploads: UploadService,
        config: AdminConfig,
    ) -> AppResult<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::internal(format!("Failed to create scheduler: {e}")))?;
        Ok(Self {
            scheduler,
            admin,
            uploads,
            config,
        })
    }

    /// Register all maintenance tasks and start the scheduler.
    pub async fn start(&self) -> AppResult<()> {
        self.register_reconcile().await?;
        self.register_stall_reclamation().await?;
        self.register_session_sweep().await?;
        self.register_retention_cleanup().await?;

        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::internal(format!("Failed to start scheduler: {e}")))?;
        info!("Maintenance scheduler started");
        Ok(())
    }

    /// Shut the scheduler down.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::internal(format!("Failed to shutdown scheduler: {e}")))?;
        info!("Maintenance scheduler shut down");
        Ok(())
    }

    async fn register_reconcile(&self) -> AppResult<()> {
        let admin = self.admin.clone();
        let grace = self.config.reconcile_grace_seconds;
        let interval = Duration::from_secs(self.config.reconcile_interval_seconds.max(1));

        let job = CronJob::new_repeated_async(interval, move |_id, _lock| {
            let admin = admin.clone();
            Box::pin(async move {
                if let Err(e) = admin.reconcile(grace).await {
                    error!(error = %e, "Reconcile pass failed");
                }
            })
        })
        .map_err(|e| AppError::internal(format!("Failed to create reconcile task: {e}")))?;

        self.add(job, "reconcile").await
    }

    async fn register_stall_reclamation(&self) -> AppResult<()> {
        let admin = self.admin.clone();
        let grace = self.config.stall_grace_seconds;
        // Half the grace window keeps worst-case reclamation latency at
        // 1.5x the grace.
        let interval = Duration::from_secs((self.config.stall_grace_seconds as u64 / 2).max(1));

        let job = CronJob::new_repeated_async(interval, move |_id, _lock| {
            let admin = admin.clone();
            Box::pin(async move {
                if let Err(e) = admin.clear_stalled(grace).await {
                    error!(error = %e, "Stall reclamation failed");
                }
            })
        })
        .map_err(|e| AppError::internal(format!("Failed to create stall task: {e}")))?;

        self.add(job, "stall-reclamation").await
    }

    async fn register_session_sweep(&self) -> AppResult<()> {
        let uploads = self.uploads.clone();

        // Every 5 minutes.
        let job = CronJob::new_async("0 */5 * * * *", move |_id, _lock| {
            let uploads = uploads.clone();
            Box::pin(async move {
                if let Err(e) = uploads.sweep_expired().await {
                    error!(error = %e, "Upload session sweep failed");
                }
            })
        })
        .map_err(|e| AppError::internal(format!("Failed to create sweep task: {e}")))?;

        self.add(job, "session-sweep").await
    }

    async fn register_retention_cleanup(&self) -> AppResult<()> {
        let admin = self.admin.clone();
        let retention_days = self.config.retention_days;

        // Daily at 03:00.
        let job = CronJob::new_async("0 0 3 * * *", move |_id, _lock| {
            let admin = admin.clone();
            Box::pin(async move {
                if let Err(e) = admin.cleanup(retention_days).await {
                    error!(error = %e, "Retention cleanup failed");
                }
            })
        })
        .map_err(|e| AppError::internal(format!("Failed to create cleanup task: {e}")))?;

        self.add(job, "retention-cleanup").await
    }

    async fn add(&self, job: CronJob, name: &str) -> AppResult<()> {
        self.scheduler
            .add(job)
            .await
            .map_err(|e| AppError::internal(format!("Failed to add {name} task: {e}")))?;
        info!(task = name, "Registered maintenance task");
        Ok(())
    }
}
