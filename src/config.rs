//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Which store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// libSQL database file (one atomic statement per claim).
    Sqlite,
    /// JSON document guarded by a sidecar lock file.
    JsonFile,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Root directory for persisted state (database or JSON document).
    pub data_dir: PathBuf,
    /// Directory stage outputs are written under.
    pub output_dir: PathBuf,
    /// Store backend selected at construction time.
    pub backend: StoreBackend,
    /// Size of the worker slot pool.
    pub slot_count: u32,
    /// Maximum queue-level retries before a failed task stays FAILED.
    pub max_task_retries: u32,
    /// Whether `fail_task` requeues tasks that are under the retry limit.
    pub retry_on_failure: bool,
    /// Maximum generation retries at a single stage before the task moves
    /// to the pipeline's failure terminal.
    pub max_stage_retries: u32,
    /// Timeout applied to each generation call.
    pub generation_timeout: Duration,
    /// How long a caller waits for the JSON store's file lock.
    pub lock_timeout: Duration,
    /// Poll interval while waiting for the file lock.
    pub lock_poll_interval: Duration,
    /// Workers whose last heartbeat is older than this are stale.
    pub heartbeat_stale_after: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            output_dir: PathBuf::from("./data/outputs"),
            backend: StoreBackend::Sqlite,
            slot_count: 8,
            max_task_retries: 3,
            retry_on_failure: true,
            max_stage_retries: 2,
            generation_timeout: Duration::from_secs(300), // 5 minutes
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
            heartbeat_stale_after: Duration::from_secs(120), // 2 minutes
        }
    }
}
