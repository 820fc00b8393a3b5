//! Connection and query execution engine for the Sluice database client.
//!
//! - **error**: One error enum with connection-loss classification
//! - **models**: Connection specs, query results, schema descriptors
//! - **drivers**: MySQL (sqlx), PostgreSQL (deadpool-postgres), SQLite (rusqlite)
//! - **services**: SSH tunnels, connection registry, query and schema services, secret store
//! - **state**: The `SluiceEngine` facade
//! - **logging**: Structured logging setup

pub mod drivers;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod testing;

pub use drivers::{DriverAdapter, DriverConnection, DriverSet};
pub use error::{EngineError, EngineResult, TunnelStage};
pub use models::{
    ColumnDescriptor, ConnectionOptions, ConnectionSpec, ConnectionState, DatabaseSummary,
    EngineType, Endpoint, FieldInfo, IndexDescriptor, QueryOutput, QueryResult, QueryType,
    SshTunnelSpec, TableEntry, TableKind, TableStructure,
};
pub use services::{
    ConnectionRegistry, CredentialResolver, KeychainSecretStore, MemorySecretStore, SecretStore,
    SshTunnelManager, TunnelProvider,
};
pub use state::SluiceEngine;
