//! Connection registry.
//!
//! Owns every live connection: the driver handle, the spec it was opened
//! from, and whether a tunnel backs it. Connect, disconnect and reconnect for
//! one id are serialized by a per-id async lock; different ids never wait on
//! each other.

use crate::drivers::{DriverConnection, DriverSet};
use crate::error::{EngineError, EngineResult};
use crate::models::{ConnectionSpec, ConnectionState, EngineType, Endpoint};
use crate::services::tunnel::TunnelProvider;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// An established connection.
pub struct LiveConnection {
    spec: ConnectionSpec,
    handle: Box<dyn DriverConnection>,
    tunnel_port: Option<u16>,
    generation: u64,
    connected_at: DateTime<Utc>,
}

impl LiveConnection {
    /// The spec this connection was opened from (tunnel port filled in).
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// Engine resolved at connect time.
    pub fn engine(&self) -> EngineType {
        self.spec.engine
    }

    /// The driver handle.
    pub fn handle(&self) -> &dyn DriverConnection {
        self.handle.as_ref()
    }

    /// Local tunnel port, if the connection is tunneled.
    pub fn tunnel_port(&self) -> Option<u16> {
        self.tunnel_port
    }

    /// Monotonic id of this particular open; changes on every reconnect.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When this connection was opened.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("id", &self.spec.id)
            .field("engine", &self.spec.engine)
            .field("tunnel_port", &self.tunnel_port)
            .field("generation", &self.generation)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

type IdLocks = Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

/// Held lock on one connection id.
///
/// On release the map entry is dropped unless another caller holds or
/// waits on it.
struct IdGuard<'a> {
    locks: &'a IdLocks,
    id: Uuid,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock();
        if locks.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.id);
        }
    }
}

/// Map from connection id to live connection.
pub struct ConnectionRegistry {
    drivers: DriverSet,
    tunnels: Arc<dyn TunnelProvider>,
    live: RwLock<HashMap<Uuid, Arc<LiveConnection>>>,
    states: RwLock<HashMap<Uuid, ConnectionState>>,
    locks: IdLocks,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(drivers: DriverSet, tunnels: Arc<dyn TunnelProvider>) -> Self {
        Self {
            drivers,
            tunnels,
            live: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// The tunnel provider backing SSH connections.
    pub fn tunnels(&self) -> &Arc<dyn TunnelProvider> {
        &self.tunnels
    }

    /// Serialize connect, disconnect and reconnect for one id.
    async fn lock_id(&self, id: Uuid) -> IdGuard<'_> {
        let lock = Arc::clone(self.locks.lock().entry(id).or_default());
        IdGuard { locks: &self.locks, id, guard: Some(lock.lock_owned().await) }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    fn set_state(&self, id: Uuid, state: ConnectionState) {
        let mut states = self.states.write();
        if state == ConnectionState::Disconnected {
            states.remove(&id);
        } else {
            states.insert(id, state);
        }
    }

    /// Open a connection and register it under `spec.id`.
    ///
    /// An existing connection with the same id is torn down first.
    pub async fn connect(&self, spec: ConnectionSpec) -> EngineResult<()> {
        let id = spec.id;
        let _guard = self.lock_id(id).await;

        if let Err(e) = self.teardown(id).await {
            tracing::warn!(connection_id = %id, error = %e, "Error closing previous connection");
        }

        self.set_state(id, ConnectionState::Connecting);
        match self.open_live(spec).await {
            Ok(live) => {
                tracing::info!(
                    connection_id = %id,
                    engine = %live.engine(),
                    tunnel_port = ?live.tunnel_port,
                    "Connected"
                );
                self.live.write().insert(id, Arc::new(live));
                self.set_state(id, ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Connect failed");
                self.set_state(id, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Tunnel (if requested), then driver. Rolls the tunnel back on driver failure.
    async fn open_live(&self, mut spec: ConnectionSpec) -> EngineResult<LiveConnection> {
        spec.validate()?;
        let id = spec.id;

        let adapter = self.drivers.get(spec.engine).ok_or_else(|| {
            EngineError::configuration(format!("Unsupported database type: {}", spec.engine))
        })?;

        let tunnel_port = match spec.active_tunnel() {
            Some(ssh) => Some(self.tunnels.open(ssh, &spec.host, spec.port, id).await?),
            None => None,
        };

        let endpoint = match tunnel_port {
            Some(port) => Endpoint::loopback(port),
            None => Endpoint::new(spec.host.clone(), spec.port),
        };

        let handle = match adapter.open(&endpoint, &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                if tunnel_port.is_some() {
                    if let Err(close_err) = self.tunnels.close(id).await {
                        tracing::warn!(
                            connection_id = %id,
                            error = %close_err,
                            "Failed to close tunnel after driver error"
                        );
                    }
                }
                return Err(e);
            }
        };

        if let Some(ssh) = spec.ssh.as_mut() {
            ssh.local_port = tunnel_port;
        }

        Ok(LiveConnection {
            spec,
            handle,
            tunnel_port,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            connected_at: Utc::now(),
        })
    }

    /// Close driver, then tunnel, then forget the id. Caller holds the id lock.
    ///
    /// The id is removed even when a close fails; the first error is returned.
    async fn teardown(&self, id: Uuid) -> EngineResult<()> {
        let Some(live) = self.live.read().get(&id).cloned() else {
            return Ok(());
        };

        let driver_result = live.handle.close().await;
        if let Err(e) = &driver_result {
            tracing::warn!(connection_id = %id, error = %e, "Driver close failed");
        }

        let tunnel_result = match live.tunnel_port {
            Some(_) => self.tunnels.close(id).await,
            None => Ok(()),
        };
        if let Err(e) = &tunnel_result {
            tracing::warn!(connection_id = %id, error = %e, "Tunnel close failed");
        }

        self.live.write().remove(&id);
        self.set_state(id, ConnectionState::Disconnected);
        driver_result.and(tunnel_result)
    }

    /// Disconnect one id. Unknown ids are a no-op.
    pub async fn disconnect(&self, id: Uuid) -> EngineResult<()> {
        let _guard = self.lock_id(id).await;

        if !self.live.read().contains_key(&id) {
            return Ok(());
        }
        let result = self.teardown(id).await;
        tracing::info!(connection_id = %id, clean = result.is_ok(), "Disconnected");
        result
    }

    /// Disconnect everything. Failures are logged, never raised.
    ///
    /// Returns the number of disconnects that reported an error.
    pub async fn disconnect_all(&self) -> usize {
        let ids = self.connection_ids();
        if ids.is_empty() {
            return 0;
        }

        let results =
            futures_util::future::join_all(ids.iter().map(|id| self.disconnect(*id))).await;
        let failures: Vec<String> = ids
            .iter()
            .zip(results)
            .filter_map(|(id, result)| result.err().map(|e| format!("{id}: {e}")))
            .collect();

        if failures.is_empty() {
            tracing::info!(count = ids.len(), "All connections closed");
        } else {
            tracing::error!(
                count = ids.len(),
                failed = failures.len(),
                errors = ?failures,
                "Some connections did not close cleanly"
            );
        }
        failures.len()
    }

    /// Re-open a connection from its stored spec.
    pub async fn reconnect(&self, id: Uuid) -> EngineResult<Arc<LiveConnection>> {
        self.reconnect_from(id, None).await
    }

    /// Re-open only if the live connection is still the one the caller saw.
    ///
    /// When another caller already replaced it, the replacement is returned
    /// without reconnecting again. A connection removed in the meantime stays
    /// removed.
    async fn reconnect_from(
        &self,
        id: Uuid,
        observed_generation: Option<u64>,
    ) -> EngineResult<Arc<LiveConnection>> {
        let _guard = self.lock_id(id).await;

        let current = self.get(id).ok_or_else(|| EngineError::not_connected(id))?;
        if observed_generation.is_some_and(|g| g != current.generation) {
            tracing::debug!(connection_id = %id, "Already reconnected by another caller");
            return Ok(current);
        }

        tracing::warn!(connection_id = %id, engine = %current.engine(), "Reconnecting");
        self.set_state(id, ConnectionState::Reconnecting);

        let mut spec = current.spec.clone();
        if let Some(ssh) = spec.ssh.as_mut() {
            ssh.local_port = None;
        }
        drop(current);

        if let Err(e) = self.teardown(id).await {
            tracing::debug!(connection_id = %id, error = %e, "Error closing stale connection");
        }
        self.set_state(id, ConnectionState::Reconnecting);

        match self.open_live(spec).await {
            Ok(live) => {
                let live = Arc::new(live);
                self.live.write().insert(id, Arc::clone(&live));
                self.set_state(id, ConnectionState::Connected);
                tracing::info!(connection_id = %id, tunnel_port = ?live.tunnel_port, "Reconnected");
                Ok(live)
            }
            Err(e) => {
                self.set_state(id, ConnectionState::Disconnected);
                tracing::warn!(connection_id = %id, error = %e, "Reconnect failed");
                Err(e)
            }
        }
    }

    /// Run `op` against a connection, reconnecting and retrying once on connection loss.
    ///
    /// Unknown ids fail with `NotConnected` without calling `op`.
    pub async fn with_reconnect<T, F, Fut>(&self, id: Uuid, op: F) -> EngineResult<T>
    where
        F: Fn(Arc<LiveConnection>) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let live = self.get(id).ok_or_else(|| EngineError::not_connected(id))?;
        let generation = live.generation;

        match op(live).await {
            Err(e) if e.is_connection_lost() => {
                tracing::warn!(
                    connection_id = %id,
                    error = %e,
                    "Connection lost, reconnecting once"
                );
                let live = self.reconnect_from(id, Some(generation)).await?;
                op(live).await
            }
            other => other,
        }
    }

    /// Look up a live connection.
    pub fn get(&self, id: Uuid) -> Option<Arc<LiveConnection>> {
        self.live.read().get(&id).cloned()
    }

    /// Check if an id has a live connection.
    pub fn is_connected(&self, id: Uuid) -> bool {
        self.live.read().contains_key(&id)
    }

    /// True iff at least one connection is registered.
    pub fn has_active_connections(&self) -> bool {
        !self.live.read().is_empty()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    /// Check if no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }

    /// Ids of all registered connections.
    pub fn connection_ids(&self) -> Vec<Uuid> {
        self.live.read().keys().copied().collect()
    }

    /// Lifecycle state of an id.
    pub fn state(&self, id: Uuid) -> ConnectionState {
        self.states.read().get(&id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SshTunnelSpec;
    use crate::testing::{lost_connection_error, MockDriver, MockTunnel};

    fn registry_with(driver: &MockDriver, tunnel: &Arc<MockTunnel>) -> ConnectionRegistry {
        ConnectionRegistry::new(
            DriverSet::empty().with(Arc::new(driver.clone())),
            Arc::clone(tunnel) as Arc<dyn TunnelProvider>,
        )
    }

    fn mysql_spec() -> ConnectionSpec {
        ConnectionSpec::new(EngineType::Mysql, "db.internal", "root").with_password("pw")
    }

    fn tunneled_spec() -> ConnectionSpec {
        mysql_spec().with_ssh(SshTunnelSpec::new("bastion", "deploy").with_password("ssh-pw"))
    }

    #[tokio::test]
    async fn test_connect_direct_uses_spec_endpoint() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = mysql_spec();

        registry.connect(spec.clone()).await.unwrap();

        assert!(registry.is_connected(spec.id));
        assert_eq!(registry.state(spec.id), ConnectionState::Connected);
        assert_eq!(driver.state.last_endpoint(), Some(Endpoint::new("db.internal", 3306)));
        assert_eq!(tunnel.opens(), 0);
    }

    #[tokio::test]
    async fn test_connect_tunneled_uses_loopback_port() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = tunneled_spec();

        registry.connect(spec.clone()).await.unwrap();

        let port = tunnel.local_port(spec.id).unwrap();
        assert_eq!(driver.state.last_endpoint(), Some(Endpoint::loopback(port)));
        let live = registry.get(spec.id).unwrap();
        assert_eq!(live.tunnel_port(), Some(port));
        assert_eq!(live.spec().ssh.as_ref().and_then(|s| s.local_port), Some(port));
        assert_eq!(tunnel.last_target(), Some(("db.internal".to_string(), 3306)));
    }

    #[tokio::test]
    async fn test_id_locks_released_after_use() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);

        for _ in 0..50 {
            let spec = mysql_spec();
            registry.connect(spec.clone()).await.unwrap();
            registry.disconnect(spec.id).await.unwrap();
            registry.disconnect(Uuid::new_v4()).await.unwrap();
        }

        driver.state.script().fail_open = Some("Access denied for user 'root'".into());
        assert!(registry.connect(mysql_spec()).await.is_err());

        assert!(registry.is_empty());
        assert_eq!(registry.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_id_lock_kept_while_contended() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let id = Uuid::new_v4();

        let first = registry.lock_id(id).await;
        let waiter = registry.disconnect(id);
        tokio::pin!(waiter);
        assert!(futures_util::poll!(waiter.as_mut()).is_pending());

        drop(first);
        assert_eq!(registry.lock_count(), 1);
        waiter.await.unwrap();
        assert_eq!(registry.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_tunnel_failure_skips_driver() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        tunnel.fail_open(true);
        let registry = registry_with(&driver, &tunnel);

        let err = registry.connect(tunneled_spec()).await.unwrap_err();
        assert!(err.tunnel_stage().is_some());
        assert_eq!(driver.state.opens(), 0);
        assert!(!registry.has_active_connections());
    }

    #[tokio::test]
    async fn test_driver_failure_closes_tunnel() {
        let driver = MockDriver::new(EngineType::Mysql);
        driver.state.script().fail_open = Some("Access denied for user 'root'".into());
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = tunneled_spec();

        assert!(registry.connect(spec.clone()).await.is_err());
        assert_eq!(tunnel.opens(), 1);
        assert_eq!(tunnel.active_count(), 0);
        assert_eq!(registry.state(spec.id), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_configuration_error() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);

        let spec = mysql_spec().with_ssh(SshTunnelSpec::new("bastion", "deploy"));
        assert!(registry.connect(spec).await.unwrap_err().is_configuration());
        assert_eq!(tunnel.opens(), 0);
        assert_eq!(driver.state.opens(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_engine_is_configuration_error() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);

        let spec = ConnectionSpec::new(EngineType::Postgresql, "h", "u");
        assert!(registry.connect(spec).await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_reconnecting_same_id_replaces_old_handle() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = tunneled_spec();

        registry.connect(spec.clone()).await.unwrap();
        registry.connect(spec.clone()).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(driver.state.closes(), 1);
        assert_eq!(tunnel.closes(), 1);
        assert_eq!(tunnel.active_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = tunneled_spec();

        registry.disconnect(spec.id).await.unwrap();
        registry.connect(spec.clone()).await.unwrap();
        registry.disconnect(spec.id).await.unwrap();
        registry.disconnect(spec.id).await.unwrap();

        assert!(!registry.has_active_connections());
        assert_eq!(driver.state.closes(), 1);
        assert_eq!(tunnel.active_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry_even_when_close_fails() {
        let driver = MockDriver::new(EngineType::Mysql);
        driver.state.script().fail_close = true;
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = tunneled_spec();

        registry.connect(spec.clone()).await.unwrap();
        assert!(registry.disconnect(spec.id).await.is_err());
        assert!(!registry.is_connected(spec.id));
        assert_eq!(tunnel.active_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_tears_down_before_reopening() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = tunneled_spec();

        registry.connect(spec.clone()).await.unwrap();
        let before = registry.get(spec.id).unwrap().generation();

        let live = registry.reconnect(spec.id).await.unwrap();
        assert_ne!(live.generation(), before);
        assert_eq!(driver.state.opens(), 2);
        assert_eq!(driver.state.closes(), 1);
        assert_eq!(tunnel.opens(), 2);
        assert_eq!(tunnel.active_count(), 1);
        assert_eq!(registry.state(spec.id), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_unknown_id_is_not_connected() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);

        assert!(registry.reconnect(Uuid::new_v4()).await.unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn test_failed_reconnect_leaves_id_disconnected() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = mysql_spec();

        registry.connect(spec.clone()).await.unwrap();
        driver.state.script().fail_open = Some("connect ECONNREFUSED 10.0.0.5:3306".into());

        assert!(registry.reconnect(spec.id).await.is_err());
        assert!(!registry.is_connected(spec.id));
        assert_eq!(registry.state(spec.id), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_with_reconnect_retries_once() {
        let driver = MockDriver::new(EngineType::Mysql);
        driver.state.script().lose_next = 1;
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = mysql_spec();
        registry.connect(spec.clone()).await.unwrap();

        let output = registry
            .with_reconnect(spec.id, |live| async move { live.handle().execute("SELECT 1").await })
            .await
            .unwrap();

        assert_eq!(output.row_count, 1);
        assert_eq!(driver.state.executes(), 2);
        assert_eq!(driver.state.opens(), 2);
    }

    #[tokio::test]
    async fn test_with_reconnect_does_not_retry_other_errors() {
        let driver = MockDriver::new(EngineType::Mysql);
        driver.state.script().execute_error = Some("You have an error in your SQL syntax".into());
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = mysql_spec();
        registry.connect(spec.clone()).await.unwrap();

        let err = registry
            .with_reconnect(spec.id, |live| async move { live.handle().execute("SELEC 1").await })
            .await
            .unwrap_err();

        assert!(!err.is_connection_lost());
        assert_eq!(driver.state.executes(), 1);
        assert_eq!(driver.state.opens(), 1);
    }

    #[tokio::test]
    async fn test_with_reconnect_unknown_id_skips_op() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);

        let err = registry
            .with_reconnect(Uuid::new_v4(), |live| async move {
                live.handle().execute("SELECT 1").await
            })
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(driver.state.executes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_losses_reconnect_once() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = mysql_spec();
        registry.connect(spec.clone()).await.unwrap();
        let generation = registry.get(spec.id).unwrap().generation();

        let (a, b) = tokio::join!(
            registry.reconnect_from(spec.id, Some(generation)),
            registry.reconnect_from(spec.id, Some(generation)),
        );

        assert_eq!(a.unwrap().generation(), b.unwrap().generation());
        assert_eq!(driver.state.opens(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect_does_not_resurrect() {
        let driver = MockDriver::new(EngineType::Mysql);
        let tunnel = Arc::new(MockTunnel::new());
        let registry = registry_with(&driver, &tunnel);
        let spec = mysql_spec();
        registry.connect(spec.clone()).await.unwrap();
        let generation = registry.get(spec.id).unwrap().generation();

        registry.disconnect(spec.id).await.unwrap();
        let err = registry.reconnect_from(spec.id, Some(generation)).await.unwrap_err();

        assert!(err.is_not_connected());
        assert!(!registry.has_active_connections());
    }

    #[tokio::test]
    async fn test_lost_connection_error_matches_signature() {
        assert!(lost_connection_error().is_connection_lost());
    }
}
