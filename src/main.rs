//! Partflow Server — chunked upload assembly and background job processing.
//!
//! Main entry point that wires all crates together and starts the worker
//! pools and maintenance scheduler.

use std::sync::Arc;

use tokio::sync::watch;
use tracing;
use tracing_subscriber::{EnvFilter, fmt};

use partflow_core::config::AppConfig;
use partflow_core::error::AppError;
use partflow_service::{JobStore, QueueAdmin, UploadService};

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration from file and environment
fn load_configuration() -> Result<AppConfig, AppError> {
    let env = std::env::var("PARTFLOW_ENV").unwrap_or_else(|_| "development".to_string());
    AppConfig::load(&env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting Partflow v{}", env!("CARGO_PKG_VERSION"));

    // ── Step 1: Create data directories ──────────────────────────
    create_data_directories(&config).await?;

    // ── Step 2: Database connection + migrations ─────────────────
    tracing::info!("Connecting to database...");
    let db_pool = partflow_database::DatabasePool::connect(&config.database).await?;

    tracing::info!("Running database migrations...");
    partflow_database::migration::run_migrations(db_pool.pool()).await?;
    tracing::info!("Database migrations complete");

    // ── Step 3: Initialize queue broker ──────────────────────────
    tracing::info!(
        "Initializing queue broker (provider: {})...",
        config.broker.provider
    );
    let broker = partflow_broker::BrokerManager::new(&config.broker).await?;
    tracing::info!("Queue broker initialized");

    // ── Step 4: Initialize storage ───────────────────────────────
    tracing::info!("Initializing storage (root: {})...", config.storage.root);
    let storage: Arc<dyn partflow_core::traits::storage::StorageProvider> = Arc::new(
        partflow_storage::LocalStorageProvider::new(&config.storage.root).await?,
    );
    let chunks = partflow_storage::ChunkStore::new(Arc::clone(&storage));
    let assembler = partflow_storage::Assembler::new(
        chunks.clone(),
        Arc::clone(&storage),
        &config.storage.scratch_dir,
    );
    tracing::info!("Storage initialized");

    // ── Step 5: Initialize repositories ──────────────────────────
    let job_store: Arc<dyn JobStore> = Arc::new(
        partflow_database::repositories::job::JobRepository::new(db_pool.pool().clone()),
    );
    let session_store: Arc<dyn partflow_service::SessionStore> = Arc::new(
        partflow_database::repositories::upload::UploadSessionRepository::new(
            db_pool.pool().clone(),
        ),
    );
    let file_store: Arc<dyn partflow_service::FileStore> = Arc::new(
        partflow_database::repositories::file::FileRepository::new(db_pool.pool().clone()),
    );

    // ── Step 6: Initialize services ──────────────────────────────
    tracing::info!("Initializing services...");
    let notifier = partflow_notify::ProgressNotifier::default();
    let job_queue = partflow_service::JobQueue::new(
        Arc::clone(&job_store),
        broker.clone(),
        notifier.clone(),
        config.worker.backoff_base_seconds,
    );
    let upload_service = UploadService::new(
        session_store,
        file_store,
        chunks,
        assembler,
        job_queue.clone(),
        notifier.clone(),
        config.upload.clone(),
    );
    let queue_admin = QueueAdmin::for_queue(&job_queue);
    tracing::info!("Services initialized");

    // ── Step 7: Shutdown channel ─────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Step 8: Start worker pools ───────────────────────────────
    let worker_handles = if config.worker.enabled {
        tracing::info!("Starting worker pools...");

        let mut executor = partflow_worker::JobExecutor::new();
        executor.register(Arc::new(
            partflow_worker::jobs::ThumbnailJobHandler::new(Arc::clone(&storage)),
        ));
        executor.register(Arc::new(partflow_worker::jobs::TranscodeJobHandler::new(
            Arc::clone(&storage),
            &config.storage.scratch_dir,
            &config.worker.tools.transcoder,
        )));
        executor.register(Arc::new(
            partflow_worker::jobs::ConvertDocumentJobHandler::new(
                Arc::clone(&storage),
                &config.storage.scratch_dir,
                &config.worker.tools.document_converter,
            ),
        ));
        executor.register(Arc::new(partflow_worker::jobs::CompressJobHandler::new(
            Arc::clone(&storage),
            &config.storage.scratch_dir,
        )));
        executor.register(Arc::new(
            partflow_worker::jobs::CleanupExtensionsJobHandler::new(Arc::clone(&storage)),
        ));

        let pool = partflow_worker::WorkerPool::new(
            job_queue.clone(),
            Arc::new(executor),
            config.worker.clone(),
        );
        let handles = pool.spawn(shutdown_rx.clone());

        tracing::info!(workers = handles.len(), "Worker pools started");
        handles
    } else {
        tracing::info!("Worker pools disabled");
        Vec::new()
    };

    // ── Step 9: Start maintenance scheduler ──────────────────────
    tracing::info!("Starting maintenance scheduler...");
    let mut scheduler = partflow_worker::MaintenanceScheduler::new(
        queue_admin,
        upload_service,
        config.worker.admin.clone(),
    )
    .await?;
    scheduler.start().await?;
    tracing::info!("Maintenance scheduler started");

    tracing::info!("Partflow server running");

    // ── Step 10: Graceful shutdown ───────────────────────────────
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }

    tracing::info!("Waiting for workers to drain...");
    for handle in worker_handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(30), handle).await;
    }

    tracing::info!("Partflow server shut down gracefully");
    Ok(())
}

/// Create required data directories
async fn create_data_directories(config: &AppConfig) -> Result<(), AppError> {
    let dirs = [&config.storage.root, &config.storage.scratch_dir];

    for dir in &dirs {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AppError::internal(format!("Failed to create dir '{}': {}", dir, e)))?;
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
