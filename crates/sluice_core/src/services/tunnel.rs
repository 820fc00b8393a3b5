//! SSH tunnel manager.
//!
//! A tunnel is a loopback listener on an OS-assigned port. Every accepted
//! local connection gets its own `direct-tcpip` channel through one shared
//! SSH session, so a pooled driver can open several sockets through the
//! same tunnel.

use crate::error::{EngineError, EngineResult, TunnelStage};
use crate::models::{SshAuth, SshTunnelSpec};

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opens and closes tunnels on behalf of the connection registry.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel to `target_host:target_port` and return the local port.
    ///
    /// Resolves once the listener is bound; no forwarded connection is made.
    async fn open(
        &self,
        spec: &SshTunnelSpec,
        target_host: &str,
        target_port: u16,
        connection_id: Uuid,
    ) -> EngineResult<u16>;

    /// Close the tunnel for a connection. Unknown ids are a no-op.
    async fn close(&self, connection_id: Uuid) -> EngineResult<()>;

    /// Number of open tunnels.
    fn active_count(&self) -> usize;

    /// Local port of a connection's tunnel, if open.
    fn local_port(&self, connection_id: Uuid) -> Option<u16>;
}

/// Byte stream carried by a forwarding channel.
pub(crate) trait ForwardIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardIo for T {}

pub(crate) type ForwardStream = Box<dyn ForwardIo>;

/// An authenticated session able to open forwarding channels.
#[async_trait]
pub(crate) trait ForwardSession: Send + Sync {
    /// Open a channel to `host:port` on the far side.
    async fn open_channel(&self, host: &str, port: u16) -> EngineResult<ForwardStream>;

    /// End the session.
    async fn terminate(&self);
}

/// SSH client handler for russh.
struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys for now
        // TODO: verify against ~/.ssh/known_hosts
        tracing::debug!(fingerprint = %server_public_key.fingerprint(), "Accepting SSH host key");
        Ok(true)
    }
}

/// A russh session to the jump host.
struct SshSession {
    handle: client::Handle<SshClientHandler>,
}

#[async_trait]
impl ForwardSession for SshSession {
    async fn open_channel(&self, host: &str, port: u16) -> EngineResult<ForwardStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                EngineError::tunnel_with_source(
                    TunnelStage::Channel,
                    format!("Failed to open SSH channel to {host}:{port}"),
                    e,
                )
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn terminate(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// Handle to an active tunnel: the listener task and the session.
struct TunnelHandle {
    local_port: u16,
    target: String,
    cancel_token: CancellationToken,
    accept_task: JoinHandle<()>,
    session: Arc<dyn ForwardSession>,
}

impl TunnelHandle {
    /// Stop accepting, drop the listener, then end the session.
    async fn shutdown(mut self) {
        self.cancel_token.cancel();
        // The listener is owned by the accept task and dropped when it exits
        if let Err(e) = (&mut self.accept_task).await {
            tracing::debug!(error = %e, "Tunnel accept task ended abnormally");
        }
        self.session.terminate().await;
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// SSH tunnel manager keyed by connection id.
pub struct SshTunnelManager {
    tunnels: Mutex<HashMap<Uuid, TunnelHandle>>,
    connect_timeout: Duration,
}

impl SshTunnelManager {
    /// Create a manager with a 10 second SSH connect timeout.
    pub fn new() -> Self {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a manager with a custom SSH connect timeout.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { tunnels: Mutex::new(HashMap::new()), connect_timeout }
    }

    /// Connect and authenticate to the jump host.
    async fn connect_session(
        &self,
        spec: &SshTunnelSpec,
        auth: SshAuth,
    ) -> EngineResult<SshSession> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..client::Config::default()
        });

        let connect = client::connect(config, (spec.host.as_str(), spec.port), SshClientHandler);
        let mut handle = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                EngineError::tunnel(
                    TunnelStage::Connect,
                    format!(
                        "Timed out connecting to SSH server {}:{} after {}s",
                        spec.host,
                        spec.port,
                        self.connect_timeout.as_secs()
                    ),
                )
            })?
            .map_err(|e| {
                EngineError::tunnel_with_source(
                    TunnelStage::Connect,
                    format!("Failed to connect to SSH server {}:{}", spec.host, spec.port),
                    e,
                )
            })?;

        let method = auth.kind();
        let authenticated = match auth {
            SshAuth::Password(password) => handle
                .authenticate_password(&spec.username, password)
                .await
                .map_err(|e| auth_error("SSH password authentication failed", e))?,
            SshAuth::PrivateKey { key, passphrase } => {
                let key = decode_key(&key, passphrase.as_deref())?;
                handle
                    .authenticate_publickey(&spec.username, key)
                    .await
                    .map_err(|e| auth_error("SSH key authentication failed", e))?
            }
            SshAuth::PrivateKeyFile { path, passphrase } => {
                let key_data = tokio::fs::read(&path).await.map_err(|e| {
                    EngineError::tunnel_with_source(
                        TunnelStage::Authenticate,
                        format!("Failed to read SSH key file {}", path.display()),
                        e,
                    )
                })?;
                let key = decode_key(&String::from_utf8_lossy(&key_data), passphrase.as_deref())?;
                handle
                    .authenticate_publickey(&spec.username, key)
                    .await
                    .map_err(|e| auth_error("SSH key authentication failed", e))?
            }
        };

        if !authenticated {
            return Err(EngineError::tunnel(
                TunnelStage::Authenticate,
                format!("SSH server rejected {method} authentication for {}", spec.username),
            ));
        }

        tracing::info!(
            ssh_host = %spec.host,
            ssh_port = spec.port,
            username = %spec.username,
            method,
            "SSH authentication successful"
        );
        Ok(SshSession { handle })
    }

    /// Start forwarding `listener` through `session` and register the tunnel.
    pub(crate) fn start_forwarding(
        &self,
        connection_id: Uuid,
        listener: TcpListener,
        session: Arc<dyn ForwardSession>,
        target_host: &str,
        target_port: u16,
    ) -> EngineResult<u16> {
        let local_port = listener
            .local_addr()
            .map_err(|e| {
                EngineError::tunnel_with_source(
                    TunnelStage::Bind,
                    "Failed to read tunnel address",
                    e,
                )
            })?
            .port();

        let cancel_token = CancellationToken::new();
        let accept_task = tokio::spawn(run_listener(
            listener,
            Arc::clone(&session),
            target_host.to_string(),
            target_port,
            connection_id,
            cancel_token.clone(),
        ));

        let handle = TunnelHandle {
            local_port,
            target: format!("{target_host}:{target_port}"),
            cancel_token,
            accept_task,
            session,
        };

        if let Some(previous) = self.tunnels.lock().insert(connection_id, handle) {
            tracing::warn!(connection_id = %connection_id, "Replacing existing tunnel");
            tokio::spawn(previous.shutdown());
        }
        Ok(local_port)
    }
}

impl Default for SshTunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelProvider for SshTunnelManager {
    async fn open(
        &self,
        spec: &SshTunnelSpec,
        target_host: &str,
        target_port: u16,
        connection_id: Uuid,
    ) -> EngineResult<u16> {
        spec.validate()?;
        let auth = spec.auth()?;

        // One tunnel per connection id
        self.close(connection_id).await?;

        tracing::info!(
            connection_id = %connection_id,
            ssh_host = %spec.host,
            ssh_port = spec.port,
            target = %format!("{target_host}:{target_port}"),
            "Establishing SSH tunnel"
        );

        let session = self.connect_session(spec, auth).await?;

        let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                session.terminate().await;
                return Err(EngineError::tunnel_with_source(
                    TunnelStage::Bind,
                    "Failed to bind local port for SSH tunnel",
                    e,
                ));
            }
        };

        let local_port = self.start_forwarding(
            connection_id,
            listener,
            Arc::new(session),
            target_host,
            target_port,
        )?;

        tracing::info!(connection_id = %connection_id, local_port, "SSH tunnel listening");
        Ok(local_port)
    }

    async fn close(&self, connection_id: Uuid) -> EngineResult<()> {
        let Some(handle) = self.tunnels.lock().remove(&connection_id) else {
            return Ok(());
        };

        let local_port = handle.local_port;
        let target = handle.target.clone();
        handle.shutdown().await;

        tracing::info!(
            connection_id = %connection_id,
            local_port,
            target = %target,
            "SSH tunnel closed"
        );
        Ok(())
    }

    fn active_count(&self) -> usize {
        self.tunnels.lock().len()
    }

    fn local_port(&self, connection_id: Uuid) -> Option<u16> {
        self.tunnels.lock().get(&connection_id).map(|t| t.local_port)
    }
}

fn auth_error(message: &str, err: russh::Error) -> EngineError {
    EngineError::tunnel_with_source(TunnelStage::Authenticate, message, err)
}

fn decode_key(
    key: &str,
    passphrase: Option<&str>,
) -> EngineResult<Arc<russh_keys::key::KeyPair>> {
    russh_keys::decode_secret_key(key, passphrase)
        .map(Arc::new)
        .map_err(|e| {
            let message = if passphrase.is_some() {
                "Failed to decrypt SSH key, check the passphrase"
            } else {
                "Failed to parse SSH key; it may be encrypted and need a passphrase"
            };
            EngineError::tunnel_with_source(TunnelStage::Authenticate, message, e)
        })
}

/// Accept local connections until cancelled.
/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Wait out [`ACCEPT_BACKOFF`]. Returns true if the tunnel was cancelled meanwhile.
async fn accept_backoff(cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel_token.cancelled() => true,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
    }
}

async fn run_listener(
    listener: TcpListener,
    session: Arc<dyn ForwardSession>,
    target_host: String,
    target_port: u16,
    connection_id: Uuid,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                tracing::debug!(connection_id = %connection_id, "Tunnel listener stopped");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            peer = %peer_addr,
                            "New tunnel connection"
                        );

                        let session = Arc::clone(&session);
                        let target_host = target_host.clone();
                        let cancel = cancel_token.child_token();

                        tokio::spawn(async move {
                            let forwarded = forward_connection(
                                local_stream,
                                session,
                                &target_host,
                                target_port,
                                cancel,
                            )
                            .await;
                            if let Err(e) = forwarded {
                                tracing::warn!(
                                    connection_id = %connection_id,
                                    error = %e,
                                    "Tunnel forwarding error"
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(
                            connection_id = %connection_id,
                            error = %e,
                            "Failed to accept tunnel connection"
                        );
                        if accept_backoff(&cancel_token).await {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Forward one local connection through a new channel.
async fn forward_connection(
    local_stream: TcpStream,
    session: Arc<dyn ForwardSession>,
    target_host: &str,
    target_port: u16,
    cancel_token: CancellationToken,
) -> EngineResult<()> {
    let channel = session.open_channel(target_host, target_port).await?;
    pipe(local_stream, channel, cancel_token).await.map_err(|e| {
        EngineError::tunnel_with_source(TunnelStage::Channel, "Tunnel stream failed", e)
    })
}

/// Copy bytes both ways until either side closes, errors, or the tunnel is cancelled.
pub(crate) async fn pipe<A, B>(a: A, b: B, cancel_token: CancellationToken) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let upstream = async {
        tokio::io::copy(&mut a_read, &mut b_write).await?;
        b_write.shutdown().await
    };
    let downstream = async {
        tokio::io::copy(&mut b_read, &mut a_write).await?;
        a_write.shutdown().await
    };

    tokio::select! {
        result = upstream => result,
        result = downstream => result,
        _ = cancel_token.cancelled() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// Session whose channels echo back whatever they receive.
    #[derive(Default)]
    struct EchoSession {
        channels: AtomicUsize,
        terminated: AtomicBool,
        refuse_channels: bool,
        last_target: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ForwardSession for EchoSession {
        async fn open_channel(&self, host: &str, port: u16) -> EngineResult<ForwardStream> {
            if self.refuse_channels {
                return Err(EngineError::tunnel(
                    TunnelStage::Channel,
                    "administratively prohibited",
                ));
            }
            self.channels.fetch_add(1, Ordering::SeqCst);
            *self.last_target.lock() = Some(format!("{host}:{port}"));

            let (near, far) = tokio::io::duplex(8192);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
            Ok(Box::new(near))
        }

        async fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    async fn start(manager: &SshTunnelManager, session: Arc<EchoSession>, id: Uuid) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        manager.start_forwarding(id, listener, session, "db.internal", 3306).unwrap()
    }

    async fn round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_forwards_bytes_through_channel() {
        let manager = SshTunnelManager::new();
        let session = Arc::new(EchoSession::default());
        let id = Uuid::new_v4();

        let port = start(&manager, Arc::clone(&session), id).await;
        assert_ne!(port, 0);
        assert_eq!(manager.local_port(id), Some(port));

        assert_eq!(round_trip(port, b"SELECT 1").await, b"SELECT 1");
        assert_eq!(session.last_target.lock().as_deref(), Some("db.internal:3306"));
    }

    #[tokio::test]
    async fn test_accept_backoff_waits_unless_cancelled() {
        let token = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(!accept_backoff(&token).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        token.cancel();
        let started = std::time::Instant::now();
        assert!(accept_backoff(&token).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_concurrent_local_connections_get_own_channels() {
        let manager = SshTunnelManager::new();
        let session = Arc::new(EchoSession::default());
        let port = start(&manager, Arc::clone(&session), Uuid::new_v4()).await;

        let (a, b) = tokio::join!(round_trip(port, b"first"), round_trip(port, b"second"));
        assert_eq!(a, b"first");
        assert_eq!(b, b"second");
        assert_eq!(session.channels.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_releases_listener_and_session() {
        let manager = SshTunnelManager::new();
        let session = Arc::new(EchoSession::default());
        let id = Uuid::new_v4();
        let port = start(&manager, Arc::clone(&session), id).await;

        manager.close(id).await.unwrap();

        assert_eq!(manager.active_count(), 0);
        assert!(session.terminated.load(Ordering::SeqCst));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = SshTunnelManager::new();
        let id = Uuid::new_v4();
        manager.close(id).await.unwrap();

        start(&manager, Arc::new(EchoSession::default()), id).await;
        manager.close(id).await.unwrap();
        manager.close(id).await.unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_channel_closes_local_connection() {
        let manager = SshTunnelManager::new();
        let session = Arc::new(EchoSession { refuse_channels: true, ..EchoSession::default() });
        let port = start(&manager, session, Uuid::new_v4()).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let read =
            tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_open_without_auth_is_configuration_error() {
        let manager = SshTunnelManager::new();
        let spec = SshTunnelSpec::new("bastion.example.com", "deploy");

        let err = manager.open(&spec, "db", 5432, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_open_unreachable_host_is_connect_error() {
        let manager = SshTunnelManager::with_connect_timeout(Duration::from_secs(5));
        let spec = SshTunnelSpec::new("127.0.0.1", "deploy").with_port(1).with_password("pw");

        let err = manager.open(&spec, "db", 5432, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.tunnel_stage(), Some(TunnelStage::Connect));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_pipe_stops_on_cancel() {
        let (a, _a_peer) = tokio::io::duplex(64);
        let (b, _b_peer) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(pipe(a, b, cancel).await.is_ok());
    }
}
