//! PostgreSQL driver built on deadpool-postgres.
//!
//! Statements are prepared first so result columns carry real types. When
//! every column type has a native decoder the typed extended protocol is
//! used; otherwise, and for multi-command input, the statement is re-run
//! through the simple query protocol and values are returned as text.

use crate::drivers::{quote_ident, DriverAdapter, DriverConnection};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    format_column_type, ColumnDescriptor, ConnectionSpec, EngineType, Endpoint, FieldInfo,
    IndexDefinition, QueryOutput, QueryType, Row, TableEntry, TableKind,
};

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{NoTls, SimpleColumn, SimpleQueryMessage, SimpleQueryRow};

/// Opens deadpool-postgres pools.
#[derive(Debug, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }

    fn pg_config(endpoint: &Endpoint, spec: &ConnectionSpec) -> tokio_postgres::Config {
        let connect_timeout = Duration::from_secs(spec.options.connect_timeout_secs as u64);

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&endpoint.host);
        pg_config.port(endpoint.port);
        pg_config.user(&spec.username);
        pg_config.password(&spec.password);
        pg_config.application_name(&spec.options.application_name);
        pg_config.connect_timeout(connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));
        if let Some(db) = spec.database_name() {
            pg_config.dbname(db);
        }
        pg_config
    }
}

#[async_trait]
impl DriverAdapter for PostgresDriver {
    fn engine(&self) -> EngineType {
        EngineType::Postgresql
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        spec: &ConnectionSpec,
    ) -> EngineResult<Box<dyn DriverConnection>> {
        let pg_config = Self::pg_config(endpoint, spec);
        let connect_timeout = Duration::from_secs(spec.options.connect_timeout_secs as u64);

        let manager = Manager::from_config(
            pg_config.clone(),
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(manager)
            .max_size(spec.options.pool_max_size.max(1) as usize)
            .wait_timeout(Some(Duration::from_secs(spec.options.pool_wait_timeout_secs as u64)))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| EngineError::internal(format!("Failed to create pool: {e}")))?;

        // Validate connectivity and learn the effective database name
        let client = pool.get().await?;
        let row = client.query_one("SELECT current_database()", &[]).await?;
        let database: String = row.try_get(0)?;
        drop(client);

        tracing::debug!(
            connection_id = %spec.id,
            endpoint = %endpoint,
            database = %database,
            "PostgreSQL pool created"
        );

        Ok(Box::new(PostgresConnection { pool, config: pg_config, database }))
    }
}

/// A live PostgreSQL pool.
pub struct PostgresConnection {
    pool: Pool,
    /// Config the pool was built from; reused for other-database lookups
    config: tokio_postgres::Config,
    /// Database the pool is connected to
    database: String,
}

impl PostgresConnection {
    /// Open a short-lived connection to another database on the same server.
    async fn connect_other(&self, database: &str) -> EngineResult<tokio_postgres::Client> {
        let mut config = self.config.clone();
        config.dbname(database);

        let (client, connection) = config.connect(NoTls).await?;
        let database = database.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(
                    database = %database,
                    error = %e,
                    "Secondary connection ended with error"
                );
            }
        });
        Ok(client)
    }

    fn is_current(&self, database: &str) -> bool {
        database == self.database
    }

    async fn simple_execute(
        &self,
        client: &tokio_postgres::Client,
        sql: &str,
    ) -> EngineResult<QueryOutput> {
        let messages = client.simple_query(sql).await?;

        let mut affected: u64 = 0;
        let mut columns: Option<Arc<[SimpleColumn]>> = None;
        let mut current: Vec<SimpleQueryRow> = Vec::new();
        let mut last_set: Option<(Arc<[SimpleColumn]>, Vec<SimpleQueryRow>)> = None;

        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(description) => columns = Some(description),
                SimpleQueryMessage::Row(row) => current.push(row),
                SimpleQueryMessage::CommandComplete(n) => match columns.take() {
                    Some(description) => {
                        last_set = Some((description, std::mem::take(&mut current)))
                    }
                    None => affected += n,
                },
                _ => {}
            }
        }

        Ok(match last_set {
            Some((description, rows)) => {
                let fields: Vec<FieldInfo> =
                    description.iter().map(|c| FieldInfo::new(c.name(), "text")).collect();
                let rows = rows
                    .iter()
                    .map(|row| {
                        fields
                            .iter()
                            .enumerate()
                            .map(|(idx, f)| {
                                let value = row
                                    .get(idx)
                                    .map_or(Value::Null, |s| Value::String(s.to_string()));
                                (f.name.clone(), value)
                            })
                            .collect::<Row>()
                    })
                    .collect();
                QueryOutput::with_rows(fields, rows)
            }
            None => QueryOutput::with_affected(affected),
        })
    }
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    fn engine(&self) -> EngineType {
        EngineType::Postgresql
    }

    async fn close(&self) -> EngineResult<()> {
        self.pool.close();
        Ok(())
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryOutput> {
        let client = self.pool.get().await?;
        let start = Instant::now();
        let query_type = QueryType::detect(sql);

        let mut output = match client.prepare(sql).await {
            Ok(statement) if statement.columns().is_empty() => {
                let affected = client.execute(&statement, &[]).await?;
                QueryOutput::with_affected(affected)
            }
            Ok(statement) if statement.columns().iter().all(|c| has_native_decoder(c.type_())) => {
                let rows = client.query(&statement, &[]).await?;
                let fields: Vec<FieldInfo> = statement
                    .columns()
                    .iter()
                    .map(|c| FieldInfo::new(c.name(), c.type_().name()))
                    .collect();
                let rows = rows
                    .iter()
                    .map(|row| {
                        statement
                            .columns()
                            .iter()
                            .enumerate()
                            .map(|(idx, c)| {
                                (c.name().to_string(), decode_cell(row, idx, c.type_()))
                            })
                            .collect::<Row>()
                    })
                    .collect();
                QueryOutput::with_rows(fields, rows)
            }
            Ok(_) => self.simple_execute(&client, sql).await?,
            Err(e) if is_multi_command(&e) => self.simple_execute(&client, sql).await?,
            Err(e) => return Err(e.into()),
        };

        output.execution_time_ms = start.elapsed().as_millis() as u64;
        output.query_type = Some(query_type);
        Ok(output)
    }

    async fn database_names(&self) -> EngineResult<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT datname
                FROM pg_catalog.pg_database
                WHERE NOT datistemplate AND datallowconn
                ORDER BY datname
                "#,
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get("datname")).collect())
    }

    async fn count_tables(&self, database: &str) -> EngineResult<u64> {
        const SQL: &str = r#"
            SELECT COUNT(*)
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p')
              AND n.nspname NOT LIKE 'pg_%'
              AND n.nspname != 'information_schema'
        "#;

        let count: i64 = if self.is_current(database) {
            self.pool.get().await?.query_one(SQL, &[]).await?.try_get(0)?
        } else {
            self.connect_other(database).await?.query_one(SQL, &[]).await?.try_get(0)?
        };
        Ok(count.max(0) as u64)
    }

    async fn list_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableEntry>> {
        const SQL: &str = r#"
            SELECT
                n.nspname AS schema,
                c.relname AS name,
                c.relkind::text AS kind
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p', 'f', 'v', 'm')
              AND n.nspname NOT LIKE 'pg_%'
              AND n.nspname != 'information_schema'
            ORDER BY (n.nspname = 'public') DESC, n.nspname, c.relname
        "#;

        let rows = match database.map(str::trim).filter(|d| !d.is_empty() && !self.is_current(d)) {
            Some(other) => self.connect_other(other).await?.query(SQL, &[]).await?,
            None => self.pool.get().await?.query(SQL, &[]).await?,
        };

        Ok(rows
            .iter()
            .map(|row| {
                let schema: String = row.get("schema");
                let name: String = row.get("name");
                let kind: String = row.get("kind");
                let name = if schema == "public" { name } else { format!("{schema}.{name}") };
                TableEntry::new(name, TableKind::from_catalog(&kind))
            })
            .collect())
    }

    async fn catalog_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        let (schema, table) = split_table_name(table);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    c.column_name::text AS name,
                    c.data_type::text AS data_type,
                    c.udt_name::text AS udt_name,
                    c.character_maximum_length::int8 AS char_length,
                    c.numeric_precision::int8 AS num_precision,
                    c.numeric_scale::int8 AS num_scale,
                    c.is_nullable::text AS is_nullable,
                    c.column_default::text AS column_default,
                    CASE
                        WHEN c.is_identity = 'YES' THEN 'identity'
                        WHEN c.is_generated = 'ALWAYS' THEN 'generated'
                    END AS extra,
                    c.ordinal_position::int8 AS ordinal_position,
                    c.character_set_name::text AS character_set,
                    c.collation_name::text AS collation_name,
                    col_description(
                        format('%I.%I', c.table_schema, c.table_name)::regclass,
                        c.ordinal_position::int
                    ) AS comment
                FROM information_schema.columns c
                WHERE c.table_schema = $1 AND c.table_name = $2
                ORDER BY c.ordinal_position
                "#,
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let data_type: String = row.get("data_type");
                let base = match data_type.as_str() {
                    "USER-DEFINED" | "ARRAY" => row.get("udt_name"),
                    _ => data_type,
                };
                let is_nullable: String = row.get("is_nullable");
                let ordinal: i64 = row.get("ordinal_position");

                ColumnDescriptor {
                    name: row.get("name"),
                    column_type: format_column_type(
                        &base,
                        row.get("char_length"),
                        row.get("num_precision"),
                        row.get("num_scale"),
                    ),
                    nullable: is_nullable == "YES",
                    default_value: row.get("column_default"),
                    extra: row.get("extra"),
                    comment: row.get("comment"),
                    ordinal_position: ordinal.max(0) as u32,
                    character_set: row.get("character_set"),
                    collation: row.get("collation_name"),
                }
            })
            .collect())
    }

    async fn fallback_columns(&self, table: &str) -> EngineResult<Vec<ColumnDescriptor>> {
        let (schema, table) = split_table_name(table);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    a.attname AS name,
                    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
                    NOT a.attnotnull AS is_nullable,
                    pg_get_expr(d.adbin, d.adrelid) AS default_value,
                    a.attnum::integer AS ordinal_position
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND a.attnum > 0
                  AND NOT a.attisdropped
                ORDER BY a.attnum
                "#,
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let ordinal: i32 = row.get("ordinal_position");
                ColumnDescriptor {
                    default_value: row.get("default_value"),
                    ..ColumnDescriptor::new(
                        row.get::<_, String>("name"),
                        row.get::<_, String>("data_type"),
                        row.get("is_nullable"),
                        ordinal.max(0) as u32,
                    )
                }
            })
            .collect())
    }

    async fn row_count(&self, table: &str) -> EngineResult<u64> {
        let (schema, table) = split_table_name(table);
        let sql = format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_ident(schema, '"'),
            quote_ident(table, '"')
        );
        let count: i64 = self.pool.get().await?.query_one(sql.as_str(), &[]).await?.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn indexes(&self, table: &str) -> EngineResult<Vec<IndexDefinition>> {
        let (schema, table) = split_table_name(table);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    i.relname AS index_name,
                    am.amname AS algorithm,
                    ix.indisunique AS is_unique,
                    a.attname AS column_name
                FROM pg_catalog.pg_index ix
                JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
                JOIN pg_catalog.pg_am am ON am.oid = i.relam
                CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                WHERE n.nspname = $1 AND t.relname = $2
                ORDER BY i.relname, k.ord
                "#,
                &[&schema, &table],
            )
            .await?;

        let mut definitions: Vec<IndexDefinition> = Vec::new();
        for row in &rows {
            let name: String = row.get("index_name");
            let column: String = row.get("column_name");
            match definitions.last_mut().filter(|d| d.name == name) {
                Some(def) => def.columns.push(column),
                None => definitions.push(IndexDefinition {
                    name,
                    algorithm: row.get("algorithm"),
                    unique: row.get("is_unique"),
                    columns: vec![column],
                }),
            }
        }
        Ok(definitions)
    }
}

/// Split `schema.table` into its parts; bare names live in `public`.
fn split_table_name(table: &str) -> (&str, &str) {
    match table.split_once('.') {
        Some((schema, name)) if !schema.is_empty() && !name.is_empty() => (schema, name),
        _ => ("public", table),
    }
}

fn is_multi_command(err: &tokio_postgres::Error) -> bool {
    err.as_db_error()
        .is_some_and(|db| db.message().contains("multiple commands"))
}

const NATIVE_TYPES: &[&str] = &[
    "bool", "int2", "int4", "int8", "oid", "float4", "float8", "numeric", "text", "varchar",
    "bpchar", "name", "json", "jsonb", "uuid", "timestamp", "timestamptz", "date", "time", "bytea",
];

fn has_native_decoder(ty: &Type) -> bool {
    ty.schema() == "pg_catalog" && NATIVE_TYPES.contains(&ty.name())
}

fn get<'a, T: FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
) -> Result<Option<T>, tokio_postgres::Error> {
    row.try_get::<_, Option<T>>(idx)
}

/// Decode a cell, falling back to the raw wire value when the typed
/// decoder rejects it (`NaN`, out-of-range numerics, infinite timestamps).
fn decode_cell(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    match decode_typed(row, idx, ty) {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(e) => {
            let raw = get::<RawCell<'_>>(row, idx).ok().flatten();
            match raw.and_then(|RawCell(bytes)| raw_text(ty, bytes)) {
                Some(text) => Value::String(text),
                None => {
                    tracing::warn!(
                        column = idx,
                        pg_type = ty.name(),
                        error = %e,
                        "Undecodable value"
                    );
                    Value::Null
                }
            }
        }
    }
}

fn decode_typed(
    row: &tokio_postgres::Row,
    idx: usize,
    ty: &Type,
) -> Result<Option<Value>, tokio_postgres::Error> {
    let value = match ty.name() {
        "bool" => get::<bool>(row, idx)?.map(Value::from),
        "int2" => get::<i16>(row, idx)?.map(Value::from),
        "int4" => get::<i32>(row, idx)?.map(Value::from),
        "int8" => get::<i64>(row, idx)?.map(Value::from),
        "oid" => get::<u32>(row, idx)?.map(Value::from),
        "float4" => get::<f32>(row, idx)?.map(|f| Value::from(f as f64)),
        "float8" => get::<f64>(row, idx)?.map(Value::from),
        "numeric" => get::<Decimal>(row, idx)?.map(|d| Value::String(d.to_string())),
        "text" | "varchar" | "bpchar" | "name" => get::<String>(row, idx)?.map(Value::String),
        "json" | "jsonb" => get::<Value>(row, idx)?,
        "uuid" => get::<uuid::Uuid>(row, idx)?.map(|u| Value::String(u.to_string())),
        "timestamp" => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        "timestamptz" => get::<chrono::DateTime<chrono::Utc>>(row, idx)?
            .map(|dt| Value::String(dt.to_rfc3339())),
        "date" => get::<chrono::NaiveDate>(row, idx)?.map(|d| Value::String(d.to_string())),
        "time" => get::<chrono::NaiveTime>(row, idx)?.map(|t| Value::String(t.to_string())),
        "bytea" => get::<Vec<u8>>(row, idx)?.map(|bytes| {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            Value::String(format!("\\x{hex}"))
        }),
        _ => None,
    };
    Ok(value)
}

/// Undecoded binary cell of any type.
struct RawCell<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawCell<'a> {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Text form of binary values the typed decoders reject.
fn raw_text(ty: &Type, raw: &[u8]) -> Option<String> {
    match ty.name() {
        "numeric" => numeric_text(raw),
        "timestamp" | "timestamptz" => match i64::from_be_bytes(raw.try_into().ok()?) {
            i64::MAX => Some("infinity".to_string()),
            i64::MIN => Some("-infinity".to_string()),
            _ => None,
        },
        "date" => match i32::from_be_bytes(raw.try_into().ok()?) {
            i32::MAX => Some("infinity".to_string()),
            i32::MIN => Some("-infinity".to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Render a binary `numeric`: a header of ndigits, weight, sign and dscale,
/// then base-10000 digit groups, most significant first.
fn numeric_text(raw: &[u8]) -> Option<String> {
    let word = |i: usize| raw.get(i * 2..i * 2 + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i64;
    let sign = word(2)?;
    let dscale = word(3)? as usize;

    let negative = match sign {
        0x0000 => false,
        0x4000 => true,
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => return None,
    };

    let digits: Vec<u16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;
    let group = |pos: i64| {
        usize::try_from(pos).ok().and_then(|p| digits.get(p).copied()).unwrap_or(0)
    };

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&group(0).to_string());
        for pos in 1..=weight {
            text.push_str(&format!("{:04}", group(pos)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Some(text)
}
