//! Data models for the Sluice connection engine.
//!
//! - `connection` - ConnectionSpec, SshTunnelSpec, EngineType, ConnectionState
//! - `query` - QueryResult, QueryOutput, FieldInfo, QueryType
//! - `schema` - Database, table and table-structure descriptors

pub mod connection;
pub mod query;
pub mod schema;

pub use connection::{
    ConnectionOptions, ConnectionSpec, ConnectionState, EngineType, Endpoint, SshAuth,
    SshTunnelSpec,
};
pub use query::{FieldInfo, QueryOutput, QueryResult, QueryType, Row};
pub use schema::{
    flatten_indexes, format_column_type, ColumnDescriptor, DatabaseSummary, IndexDefinition,
    IndexDescriptor, TableEntry, TableKind, TableStructure,
};
