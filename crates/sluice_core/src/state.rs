//! Engine facade.
//!
//! `SluiceEngine` is created once by the application root and owns the
//! connection registry together with the query and schema services. Every
//! upward-facing operation goes through it.

use crate::drivers::DriverSet;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ConnectionSpec, ConnectionState, DatabaseSummary, QueryResult, TableEntry, TableStructure,
};
use crate::services::{
    ConnectionRegistry, QueryService, SchemaService, SshTunnelManager, TunnelProvider,
};

use std::sync::Arc;
use uuid::Uuid;

/// Connection and query execution engine.
pub struct SluiceEngine {
    registry: Arc<ConnectionRegistry>,
    queries: QueryService,
    schema: SchemaService,
}

impl SluiceEngine {
    /// Create an engine with the MySQL, PostgreSQL and SQLite drivers and
    /// the SSH tunnel manager.
    pub fn new() -> Self {
        Self::with_parts(DriverSet::with_defaults(), Arc::new(SshTunnelManager::new()))
    }

    /// Create an engine from explicit drivers and tunnel provider.
    pub fn with_parts(drivers: DriverSet, tunnels: Arc<dyn TunnelProvider>) -> Self {
        let engines: Vec<&str> = drivers.engines().iter().map(|e| e.as_str()).collect();
        tracing::info!(engines = ?engines, "Sluice engine initialized");

        let registry = Arc::new(ConnectionRegistry::new(drivers, tunnels));
        Self {
            queries: QueryService::new(Arc::clone(&registry)),
            schema: SchemaService::new(Arc::clone(&registry)),
            registry,
        }
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    // ========== Connection Lifecycle ==========

    /// Open a connection (tunnel first when SSH is enabled) and register it.
    ///
    /// Secrets in `spec` must already be resolved. A connection with the
    /// same id is replaced.
    pub async fn connect(&self, spec: ConnectionSpec) -> EngineResult<()> {
        tracing::debug!(
            connection_id = %spec.id,
            engine = %spec.engine,
            target = %spec.display_url(),
            tunneled = spec.active_tunnel().is_some(),
            "Connecting"
        );
        self.registry.connect(spec).await
    }

    /// Close a connection and its tunnel. Unknown ids are a no-op.
    pub async fn disconnect(&self, connection_id: Uuid) -> EngineResult<()> {
        self.registry.disconnect(connection_id).await
    }

    /// Close every connection. Individual failures are logged.
    pub async fn disconnect_all(&self) {
        self.registry.disconnect_all().await;
    }

    /// True iff at least one connection is registered.
    pub fn has_active_connections(&self) -> bool {
        self.registry.has_active_connections()
    }

    /// Lifecycle state of a connection id.
    pub fn connection_state(&self, connection_id: Uuid) -> ConnectionState {
        self.registry.state(connection_id)
    }

    /// Ids of all registered connections.
    pub fn connection_ids(&self) -> Vec<Uuid> {
        self.registry.connection_ids()
    }

    /// Number of open SSH tunnels.
    pub fn active_tunnel_count(&self) -> usize {
        self.registry.tunnels().active_count()
    }

    /// Close everything before process exit.
    pub async fn shutdown(&self) {
        let count = self.registry.len();
        tracing::info!(connections = count, "Shutting down engine");
        self.registry.disconnect_all().await;
    }

    // ========== Queries ==========

    /// Run a statement. `Err` only for an unknown connection id.
    pub async fn query(&self, connection_id: Uuid, sql: &str) -> Result<QueryResult, EngineError> {
        self.queries.query(connection_id, sql).await
    }

    /// Alias of [`SluiceEngine::query`].
    pub async fn execute_query(
        &self,
        connection_id: Uuid,
        sql: &str,
    ) -> Result<QueryResult, EngineError> {
        self.queries.execute_query(connection_id, sql).await
    }

    // ========== Schema ==========

    /// Tables and views, empty on failure.
    pub async fn get_tables(&self, connection_id: Uuid, database: Option<&str>) -> Vec<TableEntry> {
        self.schema.get_tables(connection_id, database).await
    }

    /// Databases with table counts, empty on failure.
    pub async fn get_databases(&self, connection_id: Uuid) -> Vec<DatabaseSummary> {
        self.schema.get_databases(connection_id).await
    }

    /// Table structure, empty on failure.
    pub async fn get_table_structure(&self, connection_id: Uuid, table: &str) -> TableStructure {
        self.schema.get_table_structure(connection_id, table).await
    }
}

impl Default for SluiceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SluiceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SluiceEngine")
            .field("connections", &self.registry.len())
            .field("tunnels", &self.registry.tunnels().active_count())
            .finish()
    }
}
