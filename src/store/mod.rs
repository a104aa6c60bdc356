//! Persistence layer: the shared coordination store behind the task
//! queue, worker/slot registry, event log, and project metadata.
//!
//! Two backends satisfy the same [`CoordStore`] contract: libSQL (every
//! mutation one atomic statement) and a JSON document guarded by a sidecar
//! lock file.

use std::sync::Arc;

use crate::config::{CoordConfig, StoreBackend};
use crate::error::StoreError;

pub mod json_backend;
pub mod libsql_backend;
pub mod lock;
pub mod migrations;
pub mod traits;

pub use json_backend::JsonStore;
pub use libsql_backend::LibSqlStore;
pub use traits::{CoordStore, QueueCounts};

/// Open the configured backend under `config.data_dir`.
pub async fn open_store(config: &CoordConfig) -> Result<Arc<dyn CoordStore>, StoreError> {
    match config.backend {
        StoreBackend::Sqlite => {
            let path = config.data_dir.join("coord.db");
            Ok(Arc::new(LibSqlStore::new_local(&path, config).await?))
        }
        StoreBackend::JsonFile => {
            let path = config.data_dir.join("coord.json");
            Ok(Arc::new(JsonStore::open(&path, config).await?))
        }
    }
}
