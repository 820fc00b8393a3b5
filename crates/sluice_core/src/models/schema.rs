//! Schema introspection models.
//!
//! Engine-neutral shapes for database listings, table listings and table
//! structure, shared by every driver.

use serde::{Deserialize, Serialize};

/// A database visible through a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSummary {
    /// Database name (schema name for SQLite attachments).
    pub name: String,
    /// Number of tables; 0 when counting failed.
    pub table_count: u64,
}

/// Whether a relation is a base table or a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
}

impl TableKind {
    /// Normalize an engine's catalog label.
    ///
    /// Covers `BASE TABLE` / `VIEW` / `SYSTEM VIEW` (information_schema and
    /// `SHOW FULL TABLES`), sqlite_master `type` values, and pg_class
    /// relkind codes. Anything unrecognized is treated as a table.
    pub fn from_catalog(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label == "v" || label == "m" || label.contains("view") {
            Self::View
        } else {
            Self::Table
        }
    }
}

/// A table or view name with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Relation name.
    pub name: String,
    /// Table or view.
    #[serde(rename = "type")]
    pub kind: TableKind,
}

impl TableEntry {
    pub fn new(name: impl Into<String>, kind: TableKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// Column metadata for a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Normalized type string, e.g. `varchar(255)` or `decimal(10,2)`.
    #[serde(rename = "type")]
    pub column_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default expression, if any.
    pub default_value: Option<String>,
    /// Engine extras (`auto_increment`, `primary key`, ...).
    pub extra: Option<String>,
    /// Column comment.
    pub comment: Option<String>,
    /// 1-based position in the table.
    pub ordinal_position: u32,
    /// Character set for text columns.
    pub character_set: Option<String>,
    /// Collation for text columns.
    pub collation: Option<String>,
}

impl ColumnDescriptor {
    /// Create a column with just the required fields set.
    pub fn new(
        name: impl Into<String>,
        column_type: impl Into<String>,
        nullable: bool,
        ordinal_position: u32,
    ) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable,
            ordinal_position,
            ..Self::default()
        }
    }
}

/// An index as reported by the engine: one entry per index, columns in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub algorithm: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

/// One (index, column) row. Composite indexes appear once per column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name, shared by all rows of a composite index.
    pub name: String,
    /// Index method (`BTREE`, `HASH`, `gin`, ...).
    pub algorithm: String,
    /// Whether the index enforces uniqueness.
    pub is_unique: bool,
    /// Indexed column.
    pub column_name: String,
}

/// Flatten engine index definitions into per-column descriptor rows.
pub fn flatten_indexes(definitions: Vec<IndexDefinition>) -> Vec<IndexDescriptor> {
    definitions
        .into_iter()
        .flat_map(|def| {
            let IndexDefinition { name, algorithm, unique, columns } = def;
            columns.into_iter().map(move |column_name| IndexDescriptor {
                name: name.clone(),
                algorithm: algorithm.clone(),
                is_unique: unique,
                column_name,
            })
        })
        .collect()
}

/// Columns, row count and indexes of one table.
///
/// `row_count` and `indexes` are `None` when their lookups failed; the
/// column list is still returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStructure {
    pub columns: Vec<ColumnDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Vec<IndexDescriptor>>,
}

impl TableStructure {
    /// Check if nothing at all is known about the table.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.row_count.is_none() && self.indexes.is_none()
    }
}

const CHARACTER_TYPES: &[&str] = &[
    "char",
    "varchar",
    "character",
    "character varying",
    "nchar",
    "nvarchar",
    "binary",
    "varbinary",
    "bit",
    "bit varying",
];

const EXACT_NUMERIC_TYPES: &[&str] = &["decimal", "numeric", "dec", "fixed"];

/// Render a column type with its length or precision/scale.
///
/// `varchar` + 255 gives `varchar(255)`; `decimal` + (10, 2) gives
/// `decimal(10,2)`; types without modifiers are returned as-is.
pub fn format_column_type(
    base: &str,
    length: Option<i64>,
    precision: Option<i64>,
    scale: Option<i64>,
) -> String {
    let base = base.trim();
    let lower = base.to_lowercase();

    if CHARACTER_TYPES.contains(&lower.as_str()) {
        if let Some(len) = length.filter(|l| *l > 0) {
            return format!("{base}({len})");
        }
    } else if EXACT_NUMERIC_TYPES.contains(&lower.as_str()) {
        match (precision.filter(|p| *p > 0), scale) {
            (Some(p), Some(s)) => return format!("{base}({p},{s})"),
            (Some(p), None) => return format!("{base}({p})"),
            _ => {}
        }
    }

    base.to_string()
}
