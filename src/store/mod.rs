//! Persistence layer — task and schedule storage.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::TaskStore;

use std::sync::Arc;

use crate::config::StoreBackend;
use crate::error::DatabaseError;

/// Open the store selected by configuration.
pub async fn open(backend: &StoreBackend) -> Result<Arc<dyn TaskStore>, DatabaseError> {
    match backend {
        StoreBackend::LibSql { path } => Ok(Arc::new(LibSqlBackend::new_local(path).await?)),
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory task store; tasks will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
