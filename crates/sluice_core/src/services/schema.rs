//! Schema introspection service.
//!
//! Lists databases and tables and describes table structure for the schema
//! browser. Listings are never fatal: an unknown connection, or a failure
//! that survives the single reconnect-and-retry, yields an empty result.

use crate::error::EngineResult;
use crate::models::{DatabaseSummary, TableEntry, TableStructure};
use crate::services::registry::ConnectionRegistry;

use std::sync::Arc;
use uuid::Uuid;

/// Schema introspection service.
#[derive(Clone)]
pub struct SchemaService {
    registry: Arc<ConnectionRegistry>,
}

impl SchemaService {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Tables and views in `database`, or in the connected database.
    pub async fn get_tables(&self, connection_id: Uuid, database: Option<&str>) -> Vec<TableEntry> {
        let result = self
            .registry
            .with_reconnect(connection_id, |live| async move {
                live.handle().list_tables(database).await
            })
            .await;
        Self::or_empty(connection_id, "get_tables", result)
    }

    /// Databases with their table counts.
    pub async fn get_databases(&self, connection_id: Uuid) -> Vec<DatabaseSummary> {
        let result = self
            .registry
            .with_reconnect(connection_id, |live| async move {
                live.handle().list_databases().await
            })
            .await;
        Self::or_empty(connection_id, "get_databases", result)
    }

    /// Columns, row count and indexes of one table.
    pub async fn get_table_structure(&self, connection_id: Uuid, table: &str) -> TableStructure {
        let result = self
            .registry
            .with_reconnect(connection_id, |live| async move {
                live.handle().describe_table(table).await
            })
            .await;
        Self::or_empty(connection_id, "get_table_structure", result)
    }

    fn or_empty<T: Default>(connection_id: Uuid, operation: &str, result: EngineResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(e) if e.is_not_connected() => {
                tracing::debug!(connection_id = %connection_id, operation, "No active connection");
                T::default()
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    operation,
                    error = %e,
                    "Introspection failed, returning empty result"
                );
                T::default()
            }
        }
    }
}
