//! Database driver adapters.
//!
//! Each engine implements [`DriverAdapter`] (opens connections) and
//! [`DriverConnection`] (the live handle). The registry resolves the adapter
//! once from the spec's [`EngineType`] and afterwards only talks to the
//! handle through this interface.
//!
//! - `mysql` - sqlx MySQL pool
//! - `postgres` - deadpool-postgres pool
//! - `sqlite` - rusqlite on the blocking pool

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use crate::error::EngineResult;
use crate::models::{
    flatten_indexes, ColumnDescriptor, ConnectionSpec, DatabaseSummary, EngineType, Endpoint,
    IndexDefinition, QueryOutput, TableEntry, TableStructure,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

/// Factory for live connections of one engine.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    /// Engine this adapter serves.
    fn engine(&self) -> EngineType;

    /// Open a connection against `endpoint` using the spec's credentials.
    ///
    /// `endpoint` is the tunnel's loopback address when SSH is active. SQLite
    /// ignores it and opens `spec.database` as a file path.
    async fn open(
        &self,
        endpoint: &Endpoint,
        spec: &ConnectionSpec,
    ) -> EngineResult<Box<dyn DriverConnection>>;
}

/// A live, engine-specific database handle.
///
/// The required methods are single catalog or statement round-trips.
/// `list_databases` and `describe_table` compose them and apply the
/// partial-failure rules shared by every engine.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Engine of this handle.
    fn engine(&self) -> EngineType;

    /// Release pools and sockets. Safe to call more than once.
    async fn close(&self) -> EngineResult<()>;

    /// Run one statement (or a driver-native batch) to completion.
    async fn execute(&self, sql: &str) -> EngineResult<QueryOutput>;

    /// Names of all visible databases.
    async fn database_names(&self) -> EngineResult<Vec<String>>;

    /// Number of tables in one database.
    async fn count_tables(&self, database: &str) -> EngineResult<u64>;

    /// Tables and views, in the given database or the connected one.
    async fn list_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableEntry>>;

    /// Columns from catalog metadata (information_schema, pg_catalog, PRAGMA).
    async fn catalog_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>>;

    /// Columns from the engine's describe-style fallback.
    async fn fallback_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>>;

    /// Exact row count of a table.
    async fn row_count(&self, table: &str) -> EngineResult<u64>;

    /// Index definitions of a table.
    async fn indexes(&self, table: &str) -> EngineResult<Vec<IndexDefinition>>;

    /// List databases with table counts.
    ///
    /// A failed count degrades that entry to 0; only a failure to list the
    /// names fails the call.
    async fn list_databases(&self) -> EngineResult<Vec<DatabaseSummary>> {
        let names = self.database_names().await?;
        let mut databases = Vec::with_capacity(names.len());

        for name in names {
            let table_count = match self.count_tables(&name).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(
                        engine = %self.engine(),
                        database = %name,
                        error = %e,
                        "Failed to count tables, reporting 0"
                    );
                    0
                }
            };
            databases.push(DatabaseSummary { name, table_count });
        }

        Ok(databases)
    }

    /// Describe a table: columns, row count and flattened indexes.
    ///
    /// Falls back to the describe-style statement when the catalog yields
    /// no columns. Row count and index failures leave those fields `None`.
    async fn describe_table(&self, table: &str) -> EngineResult<TableStructure> {
        let mut columns = self.catalog_columns(table).await?;
        if columns.is_empty() {
            tracing::debug!(
                engine = %self.engine(),
                table = %table,
                "Catalog returned no columns, using fallback"
            );
            columns = self.fallback_columns(table).await?;
        }

        let row_count = match self.row_count(table).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(
                    engine = %self.engine(),
                    table = %table,
                    error = %e,
                    "Row count unavailable"
                );
                None
            }
        };

        let indexes = match self.indexes(table).await {
            Ok(definitions) => Some(flatten_indexes(definitions)),
            Err(e) => {
                tracing::warn!(
                    engine = %self.engine(),
                    table = %table,
                    error = %e,
                    "Indexes unavailable"
                );
                None
            }
        };

        Ok(TableStructure { columns, row_count, indexes })
    }
}

/// Adapters keyed by engine.
#[derive(Clone)]
pub struct DriverSet {
    adapters: HashMap<EngineType, Arc<dyn DriverAdapter>>,
}

impl DriverSet {
    /// Create an empty set.
    pub fn empty() -> Self {
        Self { adapters: HashMap::new() }
    }

    /// Create a set with the MySQL, PostgreSQL and SQLite drivers.
    pub fn with_defaults() -> Self {
        Self::empty()
            .with(Arc::new(MySqlDriver::new()))
            .with(Arc::new(PostgresDriver::new()))
            .with(Arc::new(SqliteDriver::new()))
    }

    /// Register an adapter, replacing any adapter for the same engine.
    pub fn with(mut self, adapter: Arc<dyn DriverAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Register an adapter in place.
    pub fn register(&mut self, adapter: Arc<dyn DriverAdapter>) {
        self.adapters.insert(adapter.engine(), adapter);
    }

    /// Get the adapter for an engine.
    pub fn get(&self, engine: EngineType) -> Option<Arc<dyn DriverAdapter>> {
        self.adapters.get(&engine).cloned()
    }

    /// Engines with a registered adapter.
    pub fn engines(&self) -> Vec<EngineType> {
        let mut engines: Vec<_> = self.adapters.keys().copied().collect();
        engines.sort_by_key(|e| e.as_str());
        engines
    }
}

impl Default for DriverSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Quote an identifier with the given quote character, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str, quote: char) -> String {
    let escaped = name.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}
