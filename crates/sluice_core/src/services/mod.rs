//! Engine services.
//!
//! - `tunnel` - SSH tunnel manager (local listener forwarding over russh)
//! - `registry` - Live connections keyed by id, reconnect policy
//! - `query` - Query execution with one reconnect-and-retry
//! - `schema` - Schema introspection that degrades to empty results
//! - `secrets` - Keychain and in-memory secret stores

pub mod query;
pub mod registry;
pub mod schema;
pub mod secrets;
pub mod tunnel;

pub use query::QueryService;
pub use registry::{ConnectionRegistry, LiveConnection};
pub use schema::SchemaService;
pub use secrets::{
    default_secret_store, CredentialResolver, KeychainSecretStore, MemorySecretStore, SecretStore,
};
pub use tunnel::{SshTunnelManager, TunnelProvider};
