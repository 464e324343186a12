//! Worker process configuration
//!
//! Every setting has a default and can be overridden from the environment
//! (a `.env` file is loaded by the binary before this is read).

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Configuration for the photoflow worker process
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// SQLite file holding workflow history and the task queue
    pub db_name: String,
    /// Directory the database and blob storage live in
    pub data_dir: PathBuf,
    /// How long the gallery workflow waits for `processing_complete`
    pub default_timeout: Duration,
    /// Largest gallery the image processing activity accepts
    pub gallery_max_images: usize,
    /// Largest single image, in bytes
    pub gallery_max_file_size: u64,
    pub worker_id: String,
    pub max_concurrent_tasks: usize,
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_name: "workflow.db".to_string(),
            data_dir: PathBuf::from("pb_data"),
            default_timeout: Duration::from_secs(300),
            gallery_max_images: 100,
            gallery_max_file_size: 100 * 1024 * 1024,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrent_tasks: 10,
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKFLOW_DB_NAME`: database file name (default: "workflow.db")
    /// - `WORKFLOW_DATA_DIR`: data directory (default: "pb_data")
    /// - `WORKFLOW_DEFAULT_TIMEOUT`: signal wait in seconds (default: 300)
    /// - `GALLERY_MAX_IMAGES`: image count limit (default: 100)
    /// - `GALLERY_MAX_FILE_SIZE`: per-image byte limit (default: 100 MiB)
    /// - `WORKER_ID`: worker identity (default: "worker-<uuid>")
    /// - `MAX_CONCURRENT_TASKS`: concurrent task limit (default: 10)
    /// - `LEASE_DURATION_SECS`: task lease in seconds (default: 60)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            db_name: lookup("WORKFLOW_DB_NAME")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.db_name),
            data_dir: lookup("WORKFLOW_DATA_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            default_timeout: parsed("WORKFLOW_DEFAULT_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            gallery_max_images: parsed("GALLERY_MAX_IMAGES")
                .map(|v| v as usize)
                .unwrap_or(defaults.gallery_max_images),
            gallery_max_file_size: parsed("GALLERY_MAX_FILE_SIZE")
                .unwrap_or(defaults.gallery_max_file_size),
            worker_id: lookup("WORKER_ID")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.worker_id),
            max_concurrent_tasks: parsed("MAX_CONCURRENT_TASKS")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_concurrent_tasks),
            lease_duration: parsed("LEASE_DURATION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
        }
    }

    /// sqlx connection URL for the workflow database
    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join(&self.db_name).to_string_lossy()
        )
    }

    /// Root of the blob storage
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("storage")
    }
}
