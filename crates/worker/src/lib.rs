//! Photoflow worker
//!
//! Runs the gallery post-processing workflow on the durable engine. The
//! binary wires a SQLite store, filesystem-backed collaborators and a worker
//! pool; tests build the same runtime over in-memory parts.

pub mod config;
pub mod gallery;
pub mod telemetry;

pub use config::WorkerConfig;

use std::sync::Arc;

use photoflow_durable::clock::SharedClock;
use photoflow_durable::{
    ActivityRegistry, TaskDispatcher, WorkerPool, WorkerPoolConfig, WorkflowClient,
    WorkflowEventStore, WorkflowExecutor, WorkflowRegistry,
};
use tracing::info;

use gallery::{GalleryLimits, GalleryServices};

/// Client and worker pool sharing one executor
pub struct GalleryRuntime {
    pub client: WorkflowClient,
    pub pool: WorkerPool,
}

impl GalleryRuntime {
    pub fn new(
        config: &WorkerConfig,
        store: Arc<dyn WorkflowEventStore>,
        services: &GalleryServices,
        clock: SharedClock,
    ) -> Self {
        let mut workflows = WorkflowRegistry::new();
        gallery::register_workflows(&mut workflows, config.default_timeout);

        let mut activities = ActivityRegistry::new();
        gallery::register_activities(
            &mut activities,
            services,
            GalleryLimits {
                max_images: config.gallery_max_images,
                max_file_size: config.gallery_max_file_size,
            },
        );

        let executor =
            Arc::new(WorkflowExecutor::new(store.clone(), workflows).with_clock(clock));

        let pool_config = WorkerPoolConfig::new()
            .with_worker_id(config.worker_id.clone())
            .with_max_concurrency(config.max_concurrent_tasks)
            .with_lease_duration(config.lease_duration);
        let dispatcher = TaskDispatcher::new(
            executor.clone(),
            Arc::new(activities),
            pool_config.worker_id.clone(),
            pool_config.poller.lease_duration,
        );

        info!(
            worker_id = %config.worker_id,
            max_concurrent = config.max_concurrent_tasks,
            default_timeout_secs = config.default_timeout.as_secs(),
            "gallery runtime assembled"
        );

        Self {
            client: WorkflowClient::new(executor),
            pool: WorkerPool::new(store, dispatcher, pool_config),
        }
    }
}
