//! Query execution models.

use serde::{Deserialize, Serialize, Serializer};

/// One result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Type of SQL statement, classified from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// SELECT query returning rows
    Select,
    /// INSERT operation
    Insert,
    /// UPDATE operation
    Update,
    /// DELETE operation
    Delete,
    /// CREATE, ALTER, DROP, TRUNCATE
    Ddl,
    /// SHOW, PRAGMA, SET and anything else
    Other,
}

impl QueryType {
    /// Detect the statement type from its first keyword.
    ///
    /// Leading whitespace and `--` / `/* */` comments are skipped.
    pub fn detect(sql: &str) -> Self {
        let keyword: String = skip_leading_comments(sql)
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" | "TABLE" => Self::Select,
            "INSERT" | "REPLACE" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" => Self::Ddl,
            _ => Self::Other,
        }
    }

    /// Whether the statement modifies rows.
    pub fn is_dml(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

fn skip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            return rest;
        }
    }
}

/// Column metadata from query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    /// Column name
    pub name: String,
    /// Driver type tag (e.g. `int4`, `VARCHAR`, `TEXT`)
    #[serde(rename = "type")]
    pub type_name: String,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self { name: name.into(), type_name: type_name.into() }
    }
}

/// Payload of a successful query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    /// Result rows
    #[serde(rename = "data")]
    pub rows: Vec<Row>,
    /// Column metadata
    pub fields: Vec<FieldInfo>,
    /// Rows returned, or rows affected for statements without a result set
    pub row_count: u64,
    /// Rows affected (for INSERT/UPDATE/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    /// Time to execute in milliseconds
    pub execution_time_ms: u64,
    /// Type of statement
    pub query_type: Option<QueryType>,
}

impl QueryOutput {
    /// Output for a statement that returned a result set.
    pub fn with_rows(fields: Vec<FieldInfo>, rows: Vec<Row>) -> Self {
        Self { row_count: rows.len() as u64, rows, fields, ..Self::default() }
    }

    /// Output for a statement that only reports affected rows.
    pub fn with_affected(affected: u64) -> Self {
        Self { row_count: affected, affected_rows: Some(affected), ..Self::default() }
    }

    /// Get column names.
    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Check if the result set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of a query: all rows or an error, never partial.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Success(QueryOutput),
    Failure { error: String },
}

impl QueryResult {
    /// Create a failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure { error: error.into() }
    }

    /// Check if the query succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Get the output of a successful query.
    pub fn output(&self) -> Option<&QueryOutput> {
        match self {
            Self::Success(output) => Some(output),
            Self::Failure { .. } => None,
        }
    }

    /// Get the error message of a failed query.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Failure { error } => Some(error),
        }
    }

    /// Number of rows returned (0 on failure).
    pub fn row_count(&self) -> u64 {
        self.output().map_or(0, |o| o.row_count)
    }
}

impl From<QueryOutput> for QueryResult {
    fn from(output: QueryOutput) -> Self {
        Self::Success(output)
    }
}

/// Wire shape: `{ "success": true, "data": [...], "fields": [...], "rowCount": n, ... }`
/// or `{ "success": false, "error": "..." }`.
#[derive(Serialize)]
struct WireResult<'a> {
    success: bool,
    #[serde(flatten)]
    output: Option<&'a QueryOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl Serialize for QueryResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireResult { success: self.is_success(), output: self.output(), error: self.error() }
            .serialize(serializer)
    }
}
