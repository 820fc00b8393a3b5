//! Scripted driver and tunnel doubles for service tests.

use crate::drivers::{DriverAdapter, DriverConnection};
use crate::error::{EngineError, EngineResult, TunnelStage};
use crate::models::{
    ColumnDescriptor, ConnectionSpec, EngineType, Endpoint, FieldInfo, IndexDefinition,
    QueryOutput, Row, SshTunnelSpec, TableEntry,
};
use crate::services::tunnel::TunnelProvider;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

/// The message MySQL's client library reports once its socket is gone.
pub(crate) fn lost_connection_error() -> EngineError {
    EngineError::driver("Can't add new command when connection is in closed state")
}

/// What the mock driver does on each call.
#[derive(Default)]
pub(crate) struct MockScript {
    pub fail_open: Option<String>,
    pub fail_close: bool,
    /// Number of upcoming handle calls that fail with a lost connection.
    pub lose_next: usize,
    pub always_lose: bool,
    pub execute_error: Option<String>,
    pub databases: Vec<String>,
    pub failing_counts: Vec<String>,
    pub tables: Vec<TableEntry>,
    pub catalog_columns: Vec<ColumnDescriptor>,
    pub fallback_columns: Vec<ColumnDescriptor>,
    /// `None` makes the row count lookup fail.
    pub row_count: Option<u64>,
    /// `None` makes the index lookup fail.
    pub indexes: Option<Vec<IndexDefinition>>,
}

/// State shared by a mock driver and every handle it opened.
#[derive(Default)]
pub(crate) struct MockState {
    script: Mutex<MockScript>,
    endpoints: Mutex<Vec<Endpoint>>,
    statements: Mutex<Vec<String>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    executes: AtomicUsize,
    catalog_calls: AtomicUsize,
}

impl MockState {
    pub fn script(&self) -> MutexGuard<'_, MockScript> {
        self.script.lock()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    /// Catalog round-trips of any kind (names, counts, tables, columns, ...).
    pub fn catalog_calls(&self) -> usize {
        self.catalog_calls.load(Ordering::SeqCst)
    }

    /// Every call the handles received, executes included.
    pub fn driver_calls(&self) -> usize {
        self.executes() + self.catalog_calls()
    }

    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.endpoints.lock().last().cloned()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    fn check_transport(&self) -> EngineResult<()> {
        let mut script = self.script.lock();
        if script.always_lose {
            return Err(lost_connection_error());
        }
        if script.lose_next > 0 {
            script.lose_next -= 1;
            return Err(lost_connection_error());
        }
        Ok(())
    }

    fn catalog_call(&self) -> EngineResult<()> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        self.check_transport()
    }
}

/// Driver adapter whose behaviour is driven by a [`MockScript`].
#[derive(Clone)]
pub(crate) struct MockDriver {
    engine: EngineType,
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new(engine: EngineType) -> Self {
        let state = MockState::default();
        state.script().row_count = Some(0);
        state.script().indexes = Some(Vec::new());
        Self { engine, state: Arc::new(state) }
    }
}

#[async_trait]
impl DriverAdapter for MockDriver {
    fn engine(&self) -> EngineType {
        self.engine
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        _spec: &ConnectionSpec,
    ) -> EngineResult<Box<dyn DriverConnection>> {
        self.state.endpoints.lock().push(endpoint.clone());
        if let Some(message) = self.state.script().fail_open.clone() {
            return Err(EngineError::driver(message));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection { engine: self.engine, state: Arc::clone(&self.state) }))
    }
}

struct MockConnection {
    engine: EngineType,
    state: Arc<MockState>,
}

#[async_trait]
impl DriverConnection for MockConnection {
    fn engine(&self) -> EngineType {
        self.engine
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.script().fail_close {
            return Err(EngineError::driver("pool close failed"));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryOutput> {
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        self.state.statements.lock().push(sql.to_string());
        self.state.check_transport()?;
        if let Some(message) = self.state.script().execute_error.clone() {
            return Err(EngineError::driver(message));
        }

        let mut row = Row::new();
        row.insert("value".into(), serde_json::json!(1));
        Ok(QueryOutput::with_rows(vec![FieldInfo::new("value", "INT")], vec![row]))
    }

    async fn database_names(&self) -> EngineResult<Vec<String>> {
        self.state.catalog_call()?;
        Ok(self.state.script().databases.clone())
    }

    async fn count_tables(&self, database: &str) -> EngineResult<u64> {
        self.state.catalog_call()?;
        let script = self.state.script();
        if script.failing_counts.iter().any(|d| d == database) {
            return Err(EngineError::driver(format!("Access denied to database '{database}'")));
        }
        Ok(script.tables.len() as u64)
    }

    async fn list_tables(&self, _database: Option<&str>) -> EngineResult<Vec<TableEntry>> {
        self.state.catalog_call()?;
        Ok(self.state.script().tables.clone())
    }

    async fn catalog_columns(&self, _table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        self.state.catalog_call()?;
        Ok(self.state.script().catalog_columns.clone())
    }

    async fn fallback_columns(&self, _table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        self.state.catalog_call()?;
        Ok(self.state.script().fallback_columns.clone())
    }

    async fn row_count(&self, table: &str) -> EngineResult<u64> {
        self.state.catalog_call()?;
        self.state
            .script()
            .row_count
            .ok_or_else(|| {
                EngineError::driver(format!("SELECT command denied for table '{table}'"))
            })
    }

    async fn indexes(&self, table: &str) -> EngineResult<Vec<IndexDefinition>> {
        self.state.catalog_call()?;
        self.state
            .script()
            .indexes
            .clone()
            .ok_or_else(|| EngineError::driver(format!("SHOW INDEX denied for table '{table}'")))
    }
}

/// Tunnel provider that binds a real loopback listener per connection
/// without talking SSH.
#[derive(Default)]
pub(crate) struct MockTunnel {
    listeners: Mutex<HashMap<Uuid, TcpListener>>,
    targets: Mutex<Vec<(String, u16)>>,
    fail_open: Mutex<bool>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl MockTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, fail: bool) {
        *self.fail_open.lock() = fail;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn last_target(&self) -> Option<(String, u16)> {
        self.targets.lock().last().cloned()
    }
}

#[async_trait]
impl TunnelProvider for MockTunnel {
    async fn open(
        &self,
        spec: &SshTunnelSpec,
        target_host: &str,
        target_port: u16,
        connection_id: Uuid,
    ) -> EngineResult<u16> {
        spec.auth()?;
        if *self.fail_open.lock() {
            return Err(EngineError::tunnel(
                TunnelStage::Authenticate,
                format!("SSH authentication failed for {}@{}", spec.username, spec.host),
            ));
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| EngineError::tunnel(TunnelStage::Bind, e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| EngineError::tunnel(TunnelStage::Bind, e.to_string()))?
            .port();

        self.opens.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push((target_host.to_string(), target_port));
        self.listeners.lock().insert(connection_id, listener);
        Ok(port)
    }

    async fn close(&self, connection_id: Uuid) -> EngineResult<()> {
        if self.listeners.lock().remove(&connection_id).is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn active_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn local_port(&self, connection_id: Uuid) -> Option<u16> {
        self.listeners
            .lock()
            .get(&connection_id)
            .and_then(|l| l.local_addr().ok())
            .map(|addr| addr.port())
    }
}
