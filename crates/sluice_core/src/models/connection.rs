//! Connection settings and lifecycle models.

use crate::error::{EngineError, EngineResult};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Database engine behind a connection.
///
/// Resolved once when a connection is opened and carried alongside the live
/// handle, so every later operation dispatches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Mysql,
    #[serde(alias = "postgres")]
    Postgresql,
    Sqlite,
}

impl EngineType {
    /// All supported engines.
    pub const ALL: [EngineType; 3] = [Self::Mysql, Self::Postgresql, Self::Sqlite];

    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Display name for UI.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mysql => "MySQL",
            Self::Postgresql => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Default port for the engine (0 for file-based engines).
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mysql => 3306,
            Self::Postgresql => 5432,
            Self::Sqlite => 0,
        }
    }

    /// Whether the engine talks to a network endpoint (and can be tunneled).
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" => Ok(Self::Mysql),
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(EngineError::configuration(format!("Unsupported database type: {other}"))),
        }
    }
}

/// Lifecycle state of a connection id inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live connection
    #[default]
    Disconnected,
    /// First connect in progress
    Connecting,
    /// Live, usable connection
    Connected,
    /// Old handle torn down, new one being opened
    Reconnecting,
}

impl ConnectionState {
    /// Check if the connection is usable.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Resolved SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Password authentication
    Password(String),
    /// Private key supplied inline (OpenSSH or PEM text)
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
    /// Private key read from a file at connect time
    PrivateKeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl SshAuth {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKey { .. } => "private-key",
            Self::PrivateKeyFile { .. } => "private-key-file",
        }
    }
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKeyFile { path, .. } => {
                f.debug_struct("PrivateKeyFile").field("path", path).finish_non_exhaustive()
            }
            other => f.write_str(other.kind()),
        }
    }
}

/// SSH tunnel settings for reaching a database behind a jump host.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshTunnelSpec {
    /// Whether the tunnel is used at all
    pub enabled: bool,
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Password auth (plaintext, in memory only)
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Inline private key
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    /// Path to a private key file
    pub private_key_path: Option<PathBuf>,
    /// Passphrase for an encrypted private key
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
    /// Loopback port assigned once the tunnel is bound
    #[serde(skip_deserializing)]
    pub local_port: Option<u16>,
}

impl SshTunnelSpec {
    /// Create an enabled tunnel spec with no auth method yet.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            enabled: true,
            host: host.into(),
            port: 22,
            username: username.into(),
            ..Self::default()
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set password-based authentication.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set key-based authentication with inline key material.
    pub fn with_private_key(mut self, key: impl Into<String>, passphrase: Option<String>) -> Self {
        self.private_key = Some(key.into());
        self.passphrase = passphrase;
        self
    }

    /// Set key-based authentication with a key file.
    pub fn with_private_key_path(
        mut self,
        path: impl Into<PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        self.private_key_path = Some(path.into());
        self.passphrase = passphrase;
        self
    }

    /// Resolve the single configured auth method.
    ///
    /// Exactly one of password, inline key, or key file must be present.
    pub fn auth(&self) -> EngineResult<SshAuth> {
        let non_empty = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

        let mut methods = Vec::with_capacity(1);
        if non_empty(&self.password) {
            methods.push(SshAuth::Password(self.password.clone().unwrap_or_default()));
        }
        if non_empty(&self.private_key) {
            methods.push(SshAuth::PrivateKey {
                key: self.private_key.clone().unwrap_or_default(),
                passphrase: self.passphrase.clone().filter(|p| !p.is_empty()),
            });
        }
        if let Some(path) = self.private_key_path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            methods.push(SshAuth::PrivateKeyFile {
                path: path.clone(),
                passphrase: self.passphrase.clone().filter(|p| !p.is_empty()),
            });
        }

        match methods.len() {
            1 => Ok(methods.remove(0)),
            0 => Err(EngineError::configuration(
                "SSH tunnel requires a password or a private key",
            )),
            _ => Err(EngineError::configuration(
                "SSH tunnel must use exactly one authentication method",
            )),
        }
    }

    /// Validate host, username and auth for an enabled tunnel.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(EngineError::configuration("SSH host is required"));
        }
        if self.username.trim().is_empty() {
            return Err(EngineError::configuration("SSH username is required"));
        }
        if self.port == 0 {
            return Err(EngineError::configuration("SSH port must be non-zero"));
        }
        self.auth().map(|_| ())
    }
}

impl fmt::Debug for SshTunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTunnelSpec")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth().map(|a| a.kind()).unwrap_or("none"))
            .field("local_port", &self.local_port)
            .finish()
    }
}

/// Per-connection tuning options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u32,
    /// Maximum pooled connections per live connection
    pub pool_max_size: u32,
    /// How long to wait for a pooled connection before failing
    pub pool_wait_timeout_secs: u32,
    /// Application name reported to the server where supported
    pub application_name: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            pool_max_size: 4,
            pool_wait_timeout_secs: 30,
            application_name: "Sluice".to_string(),
        }
    }
}

/// Everything needed to open a connection.
///
/// Secrets are plaintext here and only ever held in memory; callers resolve
/// them from the secret store before calling `connect`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    /// Stable unique identifier
    pub id: Uuid,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Database engine
    #[serde(rename = "type")]
    pub engine: EngineType,
    /// Server hostname or IP (unused for SQLite)
    #[serde(default)]
    pub host: String,
    /// Server port (unused for SQLite)
    #[serde(default)]
    pub port: u16,
    /// Database name, or file path for SQLite
    #[serde(default)]
    pub database: Option<String>,
    /// Login username
    #[serde(default)]
    pub username: String,
    /// Login password
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Optional SSH tunnel
    #[serde(default)]
    pub ssh: Option<SshTunnelSpec>,
    /// Tuning options
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl ConnectionSpec {
    /// Create a spec for a network engine.
    pub fn new(
        engine: EngineType,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            engine,
            host: host.into(),
            port: engine.default_port(),
            database: None,
            username: username.into(),
            password: String::new(),
            ssh: None,
            options: ConnectionOptions::default(),
        }
    }

    /// Create a spec for a SQLite file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            database: Some(path.into()),
            ..Self::new(EngineType::Sqlite, "", "")
        }
    }

    /// Set the id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the SSH tunnel.
    pub fn with_ssh(mut self, ssh: SshTunnelSpec) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// Set connection options.
    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// The tunnel settings, if a tunnel is enabled.
    pub fn active_tunnel(&self) -> Option<&SshTunnelSpec> {
        self.ssh.as_ref().filter(|s| s.enabled)
    }

    /// Database name with empty strings treated as absent.
    pub fn database_name(&self) -> Option<&str> {
        self.database.as_deref().map(str::trim).filter(|d| !d.is_empty())
    }

    /// Display label for logs and UI.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.display_url())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> EngineResult<()> {
        if self.engine.is_networked() {
            if self.host.trim().is_empty() {
                return Err(EngineError::configuration("Host is required"));
            }
            if self.username.trim().is_empty() {
                return Err(EngineError::configuration("Username is required"));
            }
            if self.port == 0 {
                return Err(EngineError::configuration("Port must be non-zero"));
            }
        } else {
            if self.database_name().is_none() {
                return Err(EngineError::configuration("SQLite database path is required"));
            }
            if self.active_tunnel().is_some() {
                return Err(EngineError::configuration(
                    "SSH tunneling is not available for SQLite databases",
                ));
            }
        }

        if let Some(ssh) = self.active_tunnel() {
            ssh.validate()?;
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        match self.engine {
            EngineType::Sqlite => format!("sqlite://{}", self.database_name().unwrap_or_default()),
            engine => format!(
                "{}://{}@{}:{}/{}",
                engine,
                self.username,
                self.host,
                self.port,
                self.database_name().unwrap_or_default()
            ),
        }
    }
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssh", &self.ssh)
            .field("options", &self.options)
            .finish()
    }
}

/// Host and port the driver actually dials.
///
/// This is the tunnel's loopback endpoint when SSH is active, otherwise the
/// spec's own host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Loopback endpoint for a tunnel's local listener.
    pub fn loopback(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
