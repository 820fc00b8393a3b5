//! SQLite driver built on rusqlite.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool with the
//! connection behind a mutex. "Databases" are the schemas attached to the
//! connection (`main`, `temp`, and any `ATTACH`ed files).

use crate::drivers::{quote_ident, DriverAdapter, DriverConnection};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ColumnDescriptor, ConnectionSpec, EngineType, Endpoint, FieldInfo, IndexDefinition,
    QueryOutput, QueryType, Row, TableEntry, TableKind,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, OpenFlags, Statement};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opens SQLite database files.
#[derive(Debug, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the database path, expanding a leading `~/`.
    fn database_path(spec: &ConnectionSpec) -> EngineResult<PathBuf> {
        let raw = spec
            .database_name()
            .ok_or_else(|| EngineError::configuration("SQLite database path is required"))?;

        match raw.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .ok_or_else(|| EngineError::configuration("Could not resolve home directory")),
            None => Ok(PathBuf::from(raw)),
        }
    }
}

#[async_trait]
impl DriverAdapter for SqliteDriver {
    fn engine(&self) -> EngineType {
        EngineType::Sqlite
    }

    async fn open(
        &self,
        _endpoint: &Endpoint,
        spec: &ConnectionSpec,
    ) -> EngineResult<Box<dyn DriverConnection>> {
        let path = Self::database_path(spec)?;
        let busy_timeout = Duration::from_secs(spec.options.connect_timeout_secs as u64);
        tracing::debug!(
            connection_id = %spec.id,
            path = %path.display(),
            "Opening SQLite database"
        );

        let conn = tokio::task::spawn_blocking(move || -> EngineResult<Connection> {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| {
                EngineError::driver(format!(
                    "Failed to open SQLite database {}: {e}",
                    path.display()
                ))
            })?;
            conn.busy_timeout(busy_timeout)?;
            Ok(conn)
        })
        .await??;

        Ok(Box::new(SqliteConnection { conn: Arc::new(Mutex::new(Some(conn))) }))
    }
}

/// A live SQLite connection. `None` once closed.
pub struct SqliteConnection {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteConnection {
    async fn with_conn<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Connection) -> EngineResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            match guard.as_ref() {
                Some(conn) => f(conn),
                None => Err(EngineError::connection_lost("SQLite connection is in closed state")),
            }
        })
        .await?
    }
}

#[async_trait]
impl DriverConnection for SqliteConnection {
    fn engine(&self) -> EngineType {
        EngineType::Sqlite
    }

    async fn close(&self) -> EngineResult<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Some(conn) = conn.lock().take() {
                conn.close().map_err(|(_, e)| EngineError::from(e))?;
            }
            Ok(())
        })
        .await?
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryOutput> {
        let sql = sql.to_string();
        self.with_conn(move |conn| execute_blocking(conn, &sql)).await
    }

    async fn database_names(&self) -> EngineResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("PRAGMA database_list")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn count_tables(&self, database: &str) -> EngineResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            quote_ident(database, '"')
        );
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn list_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableEntry>> {
        let schema = database.map(str::trim).filter(|d| !d.is_empty()).unwrap_or("main");
        let sql = format!(
            "SELECT name, type FROM {}.sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote_ident(schema, '"')
        );
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let tables = stmt
                .query_map([], |row| {
                    let name: String = row.get(0)?;
                    let kind: String = row.get(1)?;
                    Ok(TableEntry::new(name, TableKind::from_catalog(&kind)))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tables)
        })
        .await
    }

    async fn catalog_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table, '"'));
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns = stmt
                .query_map([], |row| {
                    let cid: i64 = row.get("cid")?;
                    let not_null: i64 = row.get("notnull")?;
                    let pk: i64 = row.get("pk")?;
                    let mut column = ColumnDescriptor::new(
                        row.get::<_, String>("name")?,
                        row.get::<_, Option<String>>("type")?.unwrap_or_default(),
                        not_null == 0,
                        (cid + 1).max(0) as u32,
                    );
                    column.default_value = row.get("dflt_value")?;
                    column.extra = (pk > 0).then(|| "primary key".to_string());
                    Ok(column)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(columns)
        })
        .await
    }

    async fn fallback_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        let sql = format!("SELECT * FROM {} LIMIT 0", quote_ident(table, '"'));
        self.with_conn(move |conn| {
            let stmt = conn.prepare(&sql)?;
            Ok(stmt
                .column_names()
                .into_iter()
                .enumerate()
                .map(|(i, name)| ColumnDescriptor::new(name, "", true, i as u32 + 1))
                .collect())
        })
        .await
    }

    async fn row_count(&self, table: &str) -> EngineResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table, '"'));
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn indexes(&self, table: &str) -> EngineResult<Vec<IndexDefinition>> {
        let sql = format!("PRAGMA index_list({})", quote_ident(table, '"'));
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let listed = stmt
                .query_map([], |row| {
                    let name: String = row.get("name")?;
                    let unique: i64 = row.get("unique")?;
                    Ok((name, unique != 0))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut definitions = Vec::with_capacity(listed.len());
            for (name, unique) in listed {
                let sql = format!("PRAGMA index_info({})", quote_ident(&name, '"'));
                let mut info = conn.prepare(&sql)?;
                let columns = info
                    .query_map([], |row| row.get::<_, Option<String>>("name"))?
                    .filter_map(|c| c.transpose())
                    .collect::<Result<Vec<_>, _>>()?;
                definitions.push(IndexDefinition {
                    name,
                    algorithm: "BTREE".to_string(),
                    unique,
                    columns,
                });
            }
            Ok(definitions)
        })
        .await
    }
}

fn execute_blocking(conn: &Connection, sql: &str) -> EngineResult<QueryOutput> {
    let start = Instant::now();
    let query_type = QueryType::detect(sql);

    // Each statement is prepared only after the previous one has run
    let mut batch = Batch::new(conn, sql);
    let mut last_set: Option<QueryOutput> = None;
    let changes_before = conn.total_changes();

    while let Some(mut stmt) = batch.next()? {
        if stmt.column_count() > 0 {
            last_set = Some(read_rows(&mut stmt)?);
        } else {
            stmt.execute([])?;
        }
    }

    let mut output = last_set.unwrap_or_else(|| {
        QueryOutput::with_affected(conn.total_changes().saturating_sub(changes_before))
    });
    output.execution_time_ms = start.elapsed().as_millis() as u64;
    output.query_type = Some(query_type);
    Ok(output)
}

fn read_rows(stmt: &mut Statement<'_>) -> EngineResult<QueryOutput> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut tags: Vec<Option<&'static str>> = vec![None; names.len()];
    let mut rows: Vec<Row> = Vec::new();

    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut out = Row::new();
        for (idx, name) in names.iter().enumerate() {
            let value = row.get_ref(idx)?;
            if tags[idx].is_none() {
                tags[idx] = type_tag(value);
            }
            out.insert(name.clone(), to_json(value));
        }
        rows.push(out);
    }

    let fields = names
        .iter()
        .zip(tags)
        .map(|(name, tag)| FieldInfo::new(name.as_str(), tag.unwrap_or("NULL")))
        .collect();
    Ok(QueryOutput::with_rows(fields, rows))
}

fn type_tag(value: ValueRef<'_>) -> Option<&'static str> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some("INTEGER"),
        ValueRef::Real(_) => Some("REAL"),
        ValueRef::Text(_) => Some("TEXT"),
        ValueRef::Blob(_) => Some("BLOB"),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            Value::String(format!("x'{hex}'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, Box<dyn DriverConnection>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let spec = ConnectionSpec::sqlite(path.to_string_lossy());
        let conn = SqliteDriver::new().open(&Endpoint::new("", 0), &spec).await.unwrap();
        (dir, conn)
    }

    async fn seed(conn: &dyn DriverConnection) {
        conn.execute(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name VARCHAR(100) NOT NULL,
                email TEXT,
                balance DECIMAL(10,2) DEFAULT 0
            );
            CREATE INDEX idx_users_name_email ON users (name, email);
            CREATE VIEW active_users AS SELECT id, name FROM users;
            INSERT INTO users (name, email) VALUES ('alice', 'a@example.com'), ('bob', NULL);",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_execute_select_returns_rows_and_fields() {
        let (_dir, conn) = open_temp().await;
        seed(conn.as_ref()).await;

        let output = conn.execute("SELECT id, name, email FROM users ORDER BY id").await.unwrap();
        assert_eq!(output.row_count, 2);
        assert_eq!(output.query_type, Some(QueryType::Select));
        assert_eq!(output.column_names(), vec!["id", "name", "email"]);
        assert_eq!(output.fields[0].type_name, "INTEGER");
        assert_eq!(output.fields[2].type_name, "TEXT");
        assert_eq!(output.rows[0]["name"], json!("alice"));
        assert_eq!(output.rows[1]["email"], Value::Null);
    }

    #[tokio::test]
    async fn test_batch_returns_last_result_set() {
        let (_dir, conn) = open_temp().await;

        let output = conn
            .execute(
                "CREATE TABLE tags (name TEXT);
                 INSERT INTO tags VALUES ('a'), ('b');
                 SELECT name FROM tags ORDER BY name;",
            )
            .await
            .unwrap();
        assert_eq!(output.row_count, 2);
        assert_eq!(output.rows[1]["name"], json!("b"));

        let output = conn
            .execute("INSERT INTO tags VALUES ('c'); CREATE TABLE notes (body TEXT);")
            .await
            .unwrap();
        assert_eq!(output.affected_rows, Some(1));
    }

    #[tokio::test]
    async fn test_empty_select_keeps_columns() {
        let (_dir, conn) = open_temp().await;
        seed(conn.as_ref()).await;

        let output = conn.execute("SELECT id, name FROM users WHERE id < 0").await.unwrap();
        assert_eq!(output.row_count, 0);
        assert_eq!(output.column_names(), vec!["id", "name"]);
    }

    #[tokio::test]
    async fn test_execute_dml_reports_affected_rows() {
        let (_dir, conn) = open_temp().await;
        seed(conn.as_ref()).await;

        let output = conn.execute("UPDATE users SET email = 'x@example.com'").await.unwrap();
        assert_eq!(output.affected_rows, Some(2));
        assert!(output.rows.is_empty());
        assert_eq!(output.query_type, Some(QueryType::Update));
    }

    #[tokio::test]
    async fn test_syntax_error_is_driver_error() {
        let (_dir, conn) = open_temp().await;
        let err = conn.execute("SELEC 1").await.unwrap_err();
        assert!(matches!(err, EngineError::Driver { .. }));
        assert!(!err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_list_databases_and_tables() {
        let (_dir, conn) = open_temp().await;
        seed(conn.as_ref()).await;

        let databases = conn.list_databases().await.unwrap();
        let main = databases.iter().find(|d| d.name == "main").unwrap();
        assert_eq!(main.table_count, 1);

        let tables = conn.list_tables(None).await.unwrap();
        assert_eq!(
            tables,
            vec![
                TableEntry::new("active_users", TableKind::View),
                TableEntry::new("users", TableKind::Table),
            ]
        );
    }

    #[tokio::test]
    async fn test_describe_table_flattens_composite_index() {
        let (_dir, conn) = open_temp().await;
        seed(conn.as_ref()).await;

        let structure = conn.describe_table("users").await.unwrap();
        assert_eq!(structure.columns.len(), 4);
        assert_eq!(structure.columns[1].name, "name");
        assert_eq!(structure.columns[1].column_type, "VARCHAR(100)");
        assert!(!structure.columns[1].nullable);
        assert_eq!(structure.columns[0].extra.as_deref(), Some("primary key"));
        assert_eq!(structure.columns[3].ordinal_position, 4);
        assert_eq!(structure.row_count, Some(2));

        let indexes = structure.indexes.unwrap();
        let composite: Vec<_> =
            indexes.iter().filter(|i| i.name == "idx_users_name_email").collect();
        assert_eq!(composite.len(), 2);
        assert_eq!(composite[0].column_name, "name");
        assert_eq!(composite[1].column_name, "email");
        assert!(composite.iter().all(|i| i.algorithm == "BTREE" && !i.is_unique));
    }

    #[tokio::test]
    async fn test_describe_view_uses_catalog() {
        let (_dir, conn) = open_temp().await;
        seed(conn.as_ref()).await;

        let structure = conn.describe_table("active_users").await.unwrap();
        assert_eq!(structure.columns.len(), 2);
        assert_eq!(structure.indexes, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_describe_missing_table_fails() {
        let (_dir, conn) = open_temp().await;
        assert!(conn.describe_table("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_reports_connection_lost() {
        let (_dir, conn) = open_temp().await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        let err = conn.execute("SELECT 1").await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[test]
    fn test_database_path_requires_value() {
        let spec = ConnectionSpec::sqlite("");
        assert!(SqliteDriver::database_path(&spec).unwrap_err().is_configuration());
    }
}
