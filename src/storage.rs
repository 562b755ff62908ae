use std::sync::Arc;

use welfund_memory::InMemoryStorage;
use welfund_postgres::PostgresStorage;
use welfund_sqlite::SqliteStorage;

use crate::config::{StorageConfig, StorageKind};

// Re-export core storage types so callers only depend on this crate
pub use welfund_core::storage::{StorageBackend, StorageError, TransactionId};

/// Opens the backend selected in configuration.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let storage: Arc<dyn StorageBackend> = match config.backend {
        StorageKind::Memory => Arc::new(InMemoryStorage::new()),
        StorageKind::Sqlite => Arc::new(SqliteStorage::new(&config.path)?),
        StorageKind::Postgres => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| StorageError::Other("storage.url is required for postgres".to_string()))?;
            Arc::new(PostgresStorage::new(url)?)
        }
    };
    tracing::info!(backend = ?config.backend, "Storage opened");
    Ok(storage)
}
