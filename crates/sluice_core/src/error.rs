//! Error types for the Sluice connection engine.
//!
//! One enum covers the whole engine: configuration mistakes, SSH tunnel
//! failures, engine-native driver errors, transient connection loss, and
//! operations against connections that are not registered.

use crate::models::EngineType;

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Substrings that identify a dead transport regardless of engine.
///
/// Matching is case-insensitive. A match triggers one reconnect-and-retry.
pub const COMMON_CONNECTION_LOST_SIGNATURES: &[&str] = &[
    "connection is in closed state",
    "econnrefused",
    "connection lost",
    "connection refused",
    "connection reset",
    "broken pipe",
];

/// MySQL-specific connection-loss substrings (server and sqlx pool wording).
pub const MYSQL_CONNECTION_LOST_SIGNATURES: &[&str] = &[
    "protocol_connection_lost",
    "server has gone away",
    "lost connection to mysql server",
    "closed pool",
];

/// PostgreSQL-specific connection-loss substrings (tokio-postgres and deadpool wording).
pub const POSTGRES_CONNECTION_LOST_SIGNATURES: &[&str] = &[
    "connection closed",
    "terminating connection",
    "error connecting to server",
];

/// SQLite has no transport; only the common signatures apply.
pub const SQLITE_CONNECTION_LOST_SIGNATURES: &[&str] = &[];

/// Check whether a driver message matches a known connection-loss signature.
///
/// With `engine = None` every engine's list is consulted.
pub fn matches_connection_lost(engine: Option<EngineType>, message: &str) -> bool {
    let message = message.to_lowercase();
    let engine_specific: &[&str] = match engine {
        Some(EngineType::Mysql) => MYSQL_CONNECTION_LOST_SIGNATURES,
        Some(EngineType::Postgresql) => POSTGRES_CONNECTION_LOST_SIGNATURES,
        Some(EngineType::Sqlite) => SQLITE_CONNECTION_LOST_SIGNATURES,
        None => &[],
    };

    let all_engines = engine.is_none()
        && MYSQL_CONNECTION_LOST_SIGNATURES
            .iter()
            .chain(POSTGRES_CONNECTION_LOST_SIGNATURES)
            .chain(SQLITE_CONNECTION_LOST_SIGNATURES)
            .any(|sig| message.contains(sig));

    all_engines
        || COMMON_CONNECTION_LOST_SIGNATURES.iter().any(|sig| message.contains(sig))
        || engine_specific.iter().any(|sig| message.contains(sig))
}

/// Phase of tunnel setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStage {
    /// TCP connect or SSH handshake with the jump host.
    Connect,
    /// The jump host rejected the credentials.
    Authenticate,
    /// The local loopback listener could not be bound.
    Bind,
    /// A forwarding channel could not be opened.
    Channel,
}

impl fmt::Display for TunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Connect => "connect",
            Self::Authenticate => "authenticate",
            Self::Bind => "bind",
            Self::Channel => "channel",
        };
        f.write_str(stage)
    }
}

/// Main error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or incomplete connection settings. Never retried.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human-readable error message.
        message: String,
    },

    /// SSH tunnel could not be established.
    #[error("SSH tunnel error ({stage}): {message}")]
    Tunnel {
        /// Which phase of tunnel setup failed.
        stage: TunnelStage,
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Engine-native failure: auth rejected, syntax error, constraint violation.
    #[error("{message}")]
    Driver {
        /// Driver error message.
        message: String,
        /// Engine error code (SQLSTATE or MySQL error number), if known.
        code: Option<String>,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// The transport died; a reconnect may help.
    #[error("Connection lost: {message}")]
    ConnectionLost {
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation on a connection id with no live connection.
    #[error("No active connection found for {connection_id}")]
    NotConnected {
        /// The id that was looked up.
        connection_id: Uuid,
    },

    /// Secret store failure.
    #[error("Secret store error: {message}")]
    Secret {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl EngineError {
    // ========== Constructors ==========

    /// Create a new configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a new tunnel error without an underlying cause.
    pub fn tunnel(stage: TunnelStage, message: impl Into<String>) -> Self {
        Self::Tunnel { stage, message: message.into(), source: None }
    }

    /// Create a new tunnel error carrying its cause.
    pub fn tunnel_with_source(
        stage: TunnelStage,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Tunnel { stage, message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new driver error.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver { message: message.into(), code: None, hint: None }
    }

    /// Create a new driver error with an engine error code.
    pub fn driver_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Driver { message: message.into(), code: Some(code.into()), hint: None }
    }

    /// Create a new connection-lost error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost { message: message.into(), source: None }
    }

    /// Create a new not-connected error.
    pub fn not_connected(connection_id: Uuid) -> Self {
        Self::NotConnected { connection_id }
    }

    /// Create a new secret store error.
    pub fn secret(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Secret { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Classify a raw driver message for the given engine.
    ///
    /// Messages matching a connection-loss signature become `ConnectionLost`,
    /// everything else is a plain `Driver` error.
    pub fn from_driver_message(engine: EngineType, message: impl Into<String>) -> Self {
        let message = message.into();
        if matches_connection_lost(Some(engine), &message) {
            Self::ConnectionLost { message, source: None }
        } else {
            Self::Driver { message, code: None, hint: None }
        }
    }

    // ========== Methods ==========

    /// Check if this error should trigger the reconnect-and-retry policy.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } => true,
            Self::Driver { message, .. } => matches_connection_lost(None, message),
            _ => false,
        }
    }

    /// Check if this error is a configuration problem.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Check if this error is an operation on an unknown connection.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }

    /// Get the tunnel stage, if this is a tunnel error.
    pub fn tunnel_stage(&self) -> Option<TunnelStage> {
        match self {
            Self::Tunnel { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "Configuration",
            Self::Tunnel { .. } => "Tunnel",
            Self::Driver { .. } => "Driver",
            Self::ConnectionLost { .. } => "ConnectionLost",
            Self::NotConnected { .. } => "NotConnected",
            Self::Secret { .. } => "Secret",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => Some("Review the connection settings"),
            Self::Tunnel { stage: TunnelStage::Authenticate, .. } => {
                Some("Check the SSH username and password or private key")
            }
            Self::Tunnel { stage: TunnelStage::Bind, .. } => {
                Some("No local port could be bound for the tunnel")
            }
            Self::Tunnel { stage: TunnelStage::Channel, .. } => {
                Some("The SSH server may not allow TCP forwarding")
            }
            Self::Tunnel { .. } => Some("Verify the SSH server is running and reachable"),
            Self::Driver { hint, .. } => hint.as_deref(),
            Self::ConnectionLost { .. } => Some("Check that the database server is running"),
            Self::NotConnected { .. } => Some("Connect to the database first"),
            Self::Secret { hint, .. } => hint.as_deref(),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get the engine error code (if applicable).
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Driver { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to EngineError.
impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code = db_err.code().code().to_string();

            return match code.as_str() {
                "28P01" => EngineError::Driver {
                    message,
                    code: Some(code),
                    hint: Some("Invalid password - check your credentials".to_string()),
                },
                "28000" => EngineError::Driver {
                    message,
                    code: Some(code),
                    hint: Some(
                        "Authentication failed - check username and permissions".to_string(),
                    ),
                },
                // Connection exceptions and administrator/crash shutdowns
                c if c.starts_with("08") || c == "57P01" || c == "57P02" || c == "57P03" => {
                    EngineError::ConnectionLost { message, source: Some(Box::new(err)) }
                }
                _ => EngineError::Driver {
                    message,
                    code: Some(code),
                    hint: db_err.hint().map(String::from),
                },
            };
        }

        if err.is_closed() {
            return EngineError::ConnectionLost {
                message: "connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        let message = err.to_string();
        if matches_connection_lost(Some(EngineType::Postgresql), &message) {
            EngineError::ConnectionLost { message, source: Some(Box::new(err)) }
        } else {
            EngineError::Driver { message, code: None, hint: None }
        }
    }
}

/// Convert from deadpool_postgres::PoolError to EngineError.
impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => EngineError::from(e),
            deadpool_postgres::PoolError::Closed => {
                EngineError::connection_lost("connection pool is in closed state")
            }
            other => EngineError::from_driver_message(EngineType::Postgresql, other.to_string()),
        }
    }
}

/// Convert from sqlx::Error (MySQL driver) to EngineError.
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.to_string());
                if matches_connection_lost(Some(EngineType::Mysql), &message) {
                    return EngineError::connection_lost(message);
                }
                let hint = if message.contains("Access denied") {
                    Some("Check username and password".to_string())
                } else {
                    None
                };
                EngineError::Driver { message, code, hint }
            }
            sqlx::Error::Io(io) => EngineError::ConnectionLost {
                message: io.to_string(),
                source: Some(Box::new(io)),
            },
            sqlx::Error::PoolClosed => {
                EngineError::connection_lost("attempted to acquire a connection on a closed pool")
            }
            other => EngineError::from_driver_message(EngineType::Mysql, other.to_string()),
        }
    }
}

/// Convert from rusqlite::Error to EngineError.
impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::from_driver_message(EngineType::Sqlite, err.to_string())
    }
}

/// Convert from keyring::Error to EngineError.
impl From<keyring::Error> for EngineError {
    fn from(err: keyring::Error) -> Self {
        EngineError::Secret {
            message: err.to_string(),
            hint: Some("Grant Sluice access to the system keychain".to_string()),
        }
    }
}

/// Convert from serde_json::Error to EngineError.
impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal {
            message: format!("JSON error: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from a panicked or cancelled blocking task.
impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Internal {
            message: format!("Background task failed: {err}"),
            source: Some(Box::new(err)),
        }
    }
}
