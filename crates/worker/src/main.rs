use std::sync::Arc;

use anyhow::{Context, Result};
use photoflow_durable::clock::SystemClock;
use photoflow_durable::SqliteWorkflowEventStore;
use photoflow_worker::gallery::{BlobGalleryRepository, FsBlobStore, GalleryServices, LogMailer};
use photoflow_worker::telemetry::{init_telemetry, TelemetryConfig};
use photoflow_worker::{GalleryRuntime, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    init_telemetry(TelemetryConfig::from_env());

    let config = WorkerConfig::from_env();
    tracing::info!(
        database = %config.database_url(),
        worker_id = %config.worker_id,
        "photoflow-worker starting..."
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    let store = SqliteWorkflowEventStore::connect(&config.database_url())
        .await
        .context("Failed to open workflow database")?;

    let blobs = FsBlobStore::new(config.storage_dir());
    let services = GalleryServices {
        repository: Arc::new(BlobGalleryRepository::new(blobs.clone())),
        blobs: Arc::new(blobs),
        mailer: Arc::new(LogMailer),
    };

    let runtime = GalleryRuntime::new(&config, Arc::new(store), &services, Arc::new(SystemClock));
    runtime
        .pool
        .start()
        .context("Failed to start worker pool")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    runtime
        .pool
        .shutdown()
        .await
        .context("Worker pool did not drain in time")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
