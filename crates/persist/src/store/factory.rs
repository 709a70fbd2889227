use std::sync::Arc;

use tracing::info;

use crate::store::{DatabaseConfig, DatabaseType, ObjectStorageBackend, SqliteBackend};

/// Pool size used when neither the config nor the caller picks one.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Builds the configured object store and runs its migrations.
pub async fn create_store(config: &DatabaseConfig) -> crate::Result<Arc<dyn ObjectStorageBackend>> {
    config.validate().map_err(crate::Error::Config)?;

    match config.db_type {
        DatabaseType::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .ok_or_else(|| crate::Error::Config("SQLite path not configured".into()))?
                .to_str()
                .ok_or_else(|| crate::Error::Config("SQLite path is not valid UTF-8".into()))?;
            let max_connections = config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
            info!("Creating SQLite object store at {} ({} connections)", path, max_connections);

            let store = SqliteBackend::connect(path, max_connections).await?;
            store.initialize().await?;
            Ok(Arc::new(store))
        }
    }
}
