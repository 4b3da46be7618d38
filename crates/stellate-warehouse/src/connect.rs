//! Open warehouses and source connections from configuration

use std::sync::Arc;

use stellate_core::{ConnectionConfig, ConnectionKind};

use crate::adapter::{Connection, Warehouse, WarehouseError};
use crate::memory::{MemoryConnection, MemoryWarehouse};
use crate::postgres::PostgresWarehouse;

async fn connect_postgres(config: &ConnectionConfig) -> Result<PostgresWarehouse, WarehouseError> {
    let conn_str = config
        .connection_string()
        .map_err(|e| WarehouseError::ConfigError(e.to_string()))?;

    if config.tls {
        PostgresWarehouse::from_connection_string_with_tls(&conn_str).await
    } else {
        PostgresWarehouse::from_connection_string(&conn_str).await
    }
}

/// Open the target warehouse
#[cfg(feature = "postgres")]
pub async fn connect_warehouse(
    config: &ConnectionConfig,
) -> Result<Arc<dyn Warehouse>, WarehouseError> {
    match config.kind {
        ConnectionKind::Memory => Ok(Arc::new(MemoryWarehouse::new())),
        ConnectionKind::Postgres => {
            let warehouse = connect_postgres(config).await?;
            tracing::info!(
                host = %warehouse.host(),
                port = warehouse.port(),
                database = %warehouse.database(),
                "Connected to warehouse"
            );
            Ok(Arc::new(warehouse))
        }
    }
}

/// Open the target warehouse
#[cfg(not(feature = "postgres"))]
pub async fn connect_warehouse(
    config: &ConnectionConfig,
) -> Result<Arc<dyn Warehouse>, WarehouseError> {
    match config.kind {
        ConnectionKind::Memory => Ok(Arc::new(MemoryWarehouse::new())),
        ConnectionKind::Postgres => {
            // Fails with a configuration error naming the missing feature
            connect_postgres(config).await?;
            Err(WarehouseError::ConfigError(
                "PostgreSQL support not compiled".to_string(),
            ))
        }
    }
}

/// Open a named source database
#[cfg(feature = "postgres")]
pub async fn connect_source(
    name: &str,
    config: &ConnectionConfig,
) -> Result<Arc<dyn Connection>, WarehouseError> {
    match config.kind {
        ConnectionKind::Memory => Ok(Arc::new(MemoryConnection::new(name))),
        ConnectionKind::Postgres => {
            let connection = connect_postgres(config).await?;
            tracing::debug!(source = %name, database = %connection.database(), "Connected to source");
            Ok(Arc::new(connection))
        }
    }
}

/// Open a named source database
#[cfg(not(feature = "postgres"))]
pub async fn connect_source(
    name: &str,
    config: &ConnectionConfig,
) -> Result<Arc<dyn Connection>, WarehouseError> {
    match config.kind {
        ConnectionKind::Memory => Ok(Arc::new(MemoryConnection::new(name))),
        ConnectionKind::Postgres => {
            // Fails with a configuration error naming the missing feature
            connect_postgres(config).await?;
            Err(WarehouseError::ConfigError(
                "PostgreSQL support not compiled".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_connections() {
        let config = ConnectionConfig {
            kind: ConnectionKind::Memory,
            ..Default::default()
        };

        let warehouse = connect_warehouse(&config).await.unwrap();
        assert_eq!(warehouse.name(), "Memory");

        let source = connect_source("shop", &config).await.unwrap();
        assert_eq!(source.name(), "shop");
    }

    #[tokio::test]
    async fn postgres_requires_connection_string() {
        let config = ConnectionConfig::default();
        let err = connect_warehouse(&config).await.err().unwrap();
        assert!(matches!(err, WarehouseError::ConfigError(_)));
    }
}
