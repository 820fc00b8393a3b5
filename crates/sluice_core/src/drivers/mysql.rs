//! MySQL driver built on sqlx.
//!
//! Statements run over the text protocol (`raw_sql`), multi-statement
//! batches included. Values are decoded by column type name with a string
//! fallback.
//!
//! User statements and table introspection share one pinned session
//! connection, so `USE`, `SET` and open transactions carry over between
//! calls. The pool only serves session-independent catalog lookups.

use crate::drivers::{quote_ident, DriverAdapter, DriverConnection};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    format_column_type, ColumnDescriptor, ConnectionSpec, EngineType, Endpoint, FieldInfo,
    IndexDefinition, QueryOutput, QueryType, Row, TableEntry, TableKind,
};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, ColumnIndex, Either, Executor, Row as _, Statement as _, TypeInfo};
use tokio::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Opens sqlx MySQL pools.
#[derive(Debug, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    pub fn new() -> Self {
        Self
    }

    fn connect_options(endpoint: &Endpoint, spec: &ConnectionSpec) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&spec.username)
            .password(&spec.password);

        if let Some(db) = spec.database_name() {
            opts = opts.database(db);
        }
        opts
    }
}

#[async_trait]
impl DriverAdapter for MySqlDriver {
    fn engine(&self) -> EngineType {
        EngineType::Mysql
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        spec: &ConnectionSpec,
    ) -> EngineResult<Box<dyn DriverConnection>> {
        let options = &spec.options;
        tracing::debug!(
            connection_id = %spec.id,
            endpoint = %endpoint,
            pool_max_size = options.pool_max_size,
            "Opening MySQL pool"
        );

        let connect = MySqlPoolOptions::new()
            // One connection stays pinned as the session
            .max_connections(options.pool_max_size.max(2))
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(options.pool_wait_timeout_secs as u64))
            .connect_with(Self::connect_options(endpoint, spec));

        // min_connections(1) makes connect_with dial eagerly, so credential
        // and reachability errors surface here rather than on first query.
        let pool = tokio::time::timeout(
            Duration::from_secs(options.connect_timeout_secs as u64),
            connect,
        )
        .await
        .map_err(|_| {
            EngineError::connection_lost(format!(
                "Connection refused: timed out after {}s connecting to {endpoint}",
                options.connect_timeout_secs
            ))
        })??;
        let session = pool.acquire().await?;

        Ok(Box::new(MySqlConnection { pool, session: Mutex::new(Some(session)) }))
    }
}

/// A live MySQL pool with its pinned session connection.
pub struct MySqlConnection {
    pool: MySqlPool,
    /// `None` once closed
    session: Mutex<Option<PoolConnection<MySql>>>,
}

impl MySqlConnection {
    async fn fetch_raw(&self, sql: &str) -> EngineResult<Vec<MySqlRow>> {
        let mut session = self.session.lock().await;
        let conn = session_conn(&mut session)?;
        Ok(conn.fetch_all(sqlx::raw_sql(sql)).await?)
    }
}

fn session_conn<'a>(
    session: &'a mut MutexGuard<'_, Option<PoolConnection<MySql>>>,
) -> EngineResult<&'a mut sqlx::MySqlConnection> {
    match session.as_mut() {
        Some(conn) => Ok(&mut **conn),
        None => Err(EngineError::connection_lost(
            "Can't add new command when connection is in closed state",
        )),
    }
}

#[async_trait]
impl DriverConnection for MySqlConnection {
    fn engine(&self) -> EngineType {
        EngineType::Mysql
    }

    async fn close(&self) -> EngineResult<()> {
        // The pool waits for checked-out connections, so release the session first
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                tracing::debug!(error = %e, "MySQL session closed with error");
            }
        }
        if !self.pool.is_closed() {
            self.pool.close().await;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryOutput> {
        let start = Instant::now();
        let query_type = QueryType::detect(sql);

        let mut session = self.session.lock().await;
        let conn = session_conn(&mut session)?;

        let mut stream = (&mut *conn).fetch_many(sqlx::raw_sql(sql));
        let mut affected: u64 = 0;
        let mut current: Vec<MySqlRow> = Vec::new();
        let mut last_set: Option<Vec<MySqlRow>> = None;

        // Each result set ends with a Left; keep the last set that had rows.
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    affected += done.rows_affected();
                    if !current.is_empty() {
                        last_set = Some(std::mem::take(&mut current));
                    }
                }
                Either::Right(row) => current.push(row),
            }
        }
        if !current.is_empty() {
            last_set = Some(current);
        }
        drop(stream);

        let mut output = match last_set {
            Some(rows) => {
                let fields = field_info(&rows[0]);
                let rows = rows.iter().map(|r| convert_row(r, &fields)).collect();
                QueryOutput::with_rows(fields, rows)
            }
            // No rows, but the statement still describes its columns
            None if query_type == QueryType::Select => {
                let fields = match (&mut *conn).prepare(sql).await {
                    Ok(statement) => statement
                        .columns()
                        .iter()
                        .map(|col| FieldInfo::new(col.name(), col.type_info().name()))
                        .collect(),
                    Err(_) => Vec::new(),
                };
                QueryOutput::with_rows(fields, Vec::new())
            }
            None => QueryOutput::with_affected(affected),
        };
        output.execution_time_ms = start.elapsed().as_millis() as u64;
        output.query_type = Some(query_type);
        Ok(output)
    }

    async fn database_names(&self) -> EngineResult<Vec<String>> {
        let rows = self.fetch_raw("SHOW DATABASES").await?;
        Ok(rows.iter().filter_map(|r| text(r, 0)).collect())
    }

    async fn count_tables(&self, database: &str) -> EngineResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.TABLES WHERE TABLE_SCHEMA = ?",
        )
        .bind(database)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableEntry>> {
        let sql = match database.map(str::trim).filter(|d| !d.is_empty()) {
            Some(db) => format!("SHOW FULL TABLES FROM {}", quote_ident(db, '`')),
            None => "SHOW FULL TABLES".to_string(),
        };
        let rows = self.fetch_raw(&sql).await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = text(row, 0)?;
                let kind = text(row, 1).map_or(TableKind::Table, |t| TableKind::from_catalog(&t));
                Some(TableEntry::new(name, kind))
            })
            .collect())
    }

    async fn catalog_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        let mut session = self.session.lock().await;
        let rows = sqlx::query(
            r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS name,
                CAST(DATA_TYPE AS CHAR) AS data_type,
                CAST(COLUMN_TYPE AS CHAR) AS column_type,
                CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS char_length,
                CAST(NUMERIC_PRECISION AS SIGNED) AS num_precision,
                CAST(NUMERIC_SCALE AS SIGNED) AS num_scale,
                CAST(IS_NULLABLE AS CHAR) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
                CAST(EXTRA AS CHAR) AS extra,
                CAST(COLUMN_COMMENT AS CHAR) AS column_comment,
                CAST(ORDINAL_POSITION AS SIGNED) AS ordinal_position,
                CAST(CHARACTER_SET_NAME AS CHAR) AS character_set,
                CAST(COLLATION_NAME AS CHAR) AS collation_name
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(table)
        .fetch_all(session_conn(&mut session)?)
        .await?;

        rows.iter()
            .map(|row| {
                let data_type: String = row.try_get("data_type")?;
                let column_type = match data_type.to_lowercase().as_str() {
                    // COLUMN_TYPE already carries the member list
                    "enum" | "set" => {
                        row.try_get::<Option<String>, _>("column_type")?.unwrap_or(data_type)
                    }
                    _ => format_column_type(
                        &data_type,
                        row.try_get("char_length")?,
                        row.try_get("num_precision")?,
                        row.try_get("num_scale")?,
                    ),
                };
                let is_nullable: String = row.try_get("is_nullable")?;
                let ordinal: i64 = row.try_get("ordinal_position")?;

                Ok(ColumnDescriptor {
                    name: row.try_get("name")?,
                    column_type,
                    nullable: is_nullable.eq_ignore_ascii_case("YES"),
                    default_value: row.try_get("column_default")?,
                    extra: non_empty(row.try_get("extra")?),
                    comment: non_empty(row.try_get("column_comment")?),
                    ordinal_position: ordinal.max(0) as u32,
                    character_set: row.try_get("character_set")?,
                    collation: row.try_get("collation_name")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(EngineError::from)
    }

    async fn fallback_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        let rows = self.fetch_raw(&format!("DESCRIBE {}", quote_ident(table, '`'))).await?;

        Ok(rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let mut column = ColumnDescriptor::new(
                    text(row, "Field")?,
                    text(row, "Type").unwrap_or_default(),
                    text(row, "Null").is_some_and(|n| n.eq_ignore_ascii_case("YES")),
                    i as u32 + 1,
                );
                column.default_value = text(row, "Default");
                column.extra = non_empty(text(row, "Extra"));
                Some(column)
            })
            .collect())
    }

    async fn row_count(&self, table: &str) -> EngineResult<u64> {
        let rows = self
            .fetch_raw(&format!("SELECT COUNT(*) AS count FROM {}", quote_ident(table, '`')))
            .await?;
        rows.first()
            .and_then(|r| integer(r, 0))
            .map(|c| c.max(0) as u64)
            .ok_or_else(|| EngineError::driver("COUNT(*) returned no rows"))
    }

    async fn indexes(&self, table: &str) -> EngineResult<Vec<IndexDefinition>> {
        let rows = self.fetch_raw(&format!("SHOW INDEX FROM {}", quote_ident(table, '`'))).await?;

        // Rows come ordered by Key_name, Seq_in_index
        let mut definitions: Vec<IndexDefinition> = Vec::new();
        for row in &rows {
            let (Some(name), Some(column)) = (text(row, "Key_name"), text(row, "Column_name"))
            else {
                continue;
            };
            match definitions.iter_mut().find(|d| d.name == name) {
                Some(def) => def.columns.push(column),
                None => definitions.push(IndexDefinition {
                    unique: integer(row, "Non_unique") == Some(0),
                    algorithm: text(row, "Index_type").unwrap_or_else(|| "BTREE".to_string()),
                    name,
                    columns: vec![column],
                }),
            }
        }
        Ok(definitions)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Read a column as text regardless of its declared type.
///
/// `SHOW` statements return binary strings on some server versions.
fn text<I>(row: &MySqlRow, index: I) -> Option<String>
where
    I: ColumnIndex<MySqlRow> + Copy,
{
    if let Ok(value) = row.try_get_unchecked::<Option<String>, _>(index) {
        return value;
    }
    row.try_get_unchecked::<Option<Vec<u8>>, _>(index)
        .ok()
        .flatten()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn integer<I>(row: &MySqlRow, index: I) -> Option<i64>
where
    I: ColumnIndex<MySqlRow> + Copy,
{
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(index) {
        return Some(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(index) {
        return i64::try_from(v).ok();
    }
    text(row, index).and_then(|t| t.trim().parse().ok())
}

fn field_info(row: &MySqlRow) -> Vec<FieldInfo> {
    row.columns()
        .iter()
        .map(|col| FieldInfo::new(col.name(), col.type_info().name()))
        .collect()
}

fn convert_row(row: &MySqlRow, fields: &[FieldInfo]) -> Row {
    fields
        .iter()
        .enumerate()
        .map(|(idx, field)| (field.name.clone(), decode_value(row, idx, &field.type_name)))
        .collect()
}

/// Decode one typed value; `None` means the type did not match.
fn typed<'r, T>(row: &'r MySqlRow, idx: usize) -> Option<Option<T>>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get::<Option<T>, _>(idx).ok()
}

fn decode_value(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    let upper = type_name.to_ascii_uppercase();
    let base = upper.trim_end_matches(" UNSIGNED");

    let decoded: Option<Value> = match base {
        "BOOLEAN" => typed::<bool>(row, idx).map(|v| v.map_or(Value::Null, Value::from)),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR" => {
            if upper.ends_with("UNSIGNED") {
                typed::<u64>(row, idx).map(|v| v.map_or(Value::Null, Value::from))
            } else {
                typed::<i64>(row, idx).map(|v| v.map_or(Value::Null, Value::from))
            }
        }
        "FLOAT" | "DOUBLE" | "REAL" => {
            typed::<f64>(row, idx).map(|v| v.map_or(Value::Null, Value::from))
        }
        // Exact numerics keep their digits
        "DECIMAL" | "NUMERIC" => {
            typed::<Decimal>(row, idx)
                .map(|v| v.map_or(Value::Null, |d| Value::String(d.to_string())))
        }
        "DATETIME" | "TIMESTAMP" => typed::<chrono::NaiveDateTime>(row, idx)
            .map(|v| {
                v.map_or(Value::Null, |dt| {
                    Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string())
                })
            }),
        "DATE" => typed::<chrono::NaiveDate>(row, idx)
            .map(|v| v.map_or(Value::Null, |d| Value::String(d.format("%Y-%m-%d").to_string()))),
        "TIME" => typed::<chrono::NaiveTime>(row, idx)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.format("%H:%M:%S").to_string()))),
        "JSON" => typed::<serde_json::Value>(row, idx).map(|v| v.unwrap_or(Value::Null)),
        "NULL" => Some(Value::Null),
        _ => None,
    };

    decoded.unwrap_or_else(|| text(row, idx).map_or(Value::Null, Value::String))
}
