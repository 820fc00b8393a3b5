//! Query execution service.
//!
//! Runs a statement against a registered connection with the engine's
//! single reconnect-and-retry policy:
//! - Unknown connection ids fail fast with `NotConnected`
//! - A connection-loss error triggers one reconnect and one retry
//! - Every other failure is folded into `QueryResult::Failure`

use crate::error::EngineError;
use crate::models::QueryResult;
use crate::services::registry::ConnectionRegistry;

use std::sync::Arc;
use uuid::Uuid;

/// Service for executing queries on registered connections.
#[derive(Clone)]
pub struct QueryService {
    registry: Arc<ConnectionRegistry>,
}

impl QueryService {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Execute one statement (or driver-native batch).
    ///
    /// Returns `Err` only for an unknown connection id, before any driver
    /// call. Driver, reconnect and retry failures come back as
    /// `Ok(QueryResult::Failure)` carrying the final error message.
    pub async fn query(&self, connection_id: Uuid, sql: &str) -> Result<QueryResult, EngineError> {
        if !self.registry.is_connected(connection_id) {
            return Err(EngineError::not_connected(connection_id));
        }

        tracing::debug!(connection_id = %connection_id, sql_len = sql.len(), "Executing query");

        let result = self
            .registry
            .with_reconnect(connection_id, |live| async move { live.handle().execute(sql).await })
            .await;

        match result {
            Ok(output) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    row_count = output.row_count,
                    execution_time_ms = output.execution_time_ms,
                    "Query completed"
                );
                Ok(QueryResult::Success(output))
            }
            // Includes NotConnected from a disconnect racing the retry.
            Err(e) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    category = e.category(),
                    error = %e,
                    "Query failed"
                );
                Ok(QueryResult::failure(e.to_string()))
            }
        }
    }

    /// Alias of [`QueryService::query`].
    pub async fn execute_query(
        &self,
        connection_id: Uuid,
        sql: &str,
    ) -> Result<QueryResult, EngineError> {
        self.query(connection_id, sql).await
    }
}
