// ABOUTME: Local store abstraction: catalog lookups, structured DDL and batched writes
// ABOUTME: The PostgreSQL implementation lives in local::postgres

pub mod postgres;

use crate::replication::writer::InsertPlan;
use crate::source::SourceRow;
use crate::utils::{qualified_name, quote_ident};
use crate::value::SqlValue;
use anyhow::Result;
use async_trait::async_trait;

pub use postgres::PgLocalStore;

/// Column as reported by the local catalog. `data_type` is the full
/// `format_type` rendering, e.g. `numeric(12,2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalColumn {
    pub name: String,
    pub data_type: String,
}

impl LocalColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    pub fn is_text(&self) -> bool {
        let base = self.data_type.to_ascii_lowercase();
        base == "text"
            || base.starts_with("character varying")
            || base.starts_with("varchar")
            || base.starts_with("character")
            || base.starts_with("char")
    }
}

/// Structured DDL. Identifiers are validated before a `Ddl` is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ddl {
    CreateTable {
        table: String,
        columns: Vec<LocalColumn>,
    },
    AddColumn {
        table: String,
        column: LocalColumn,
    },
}

impl Ddl {
    pub fn to_sql(&self, schema: &str) -> String {
        match self {
            Ddl::CreateTable { table, columns } => {
                let defs: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{} {}", quote_ident(&c.name), c.data_type))
                    .collect();
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    qualified_name(schema, table),
                    defs.join(", ")
                )
            }
            Ddl::AddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                qualified_name(schema, table),
                quote_ident(&column.name),
                column.data_type
            ),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Ddl::CreateTable { table, .. } | Ddl::AddColumn { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyStats {
    /// Rows with a non-null key.
    pub rows: i64,
    pub distinct_keys: i64,
}

impl KeyStats {
    pub fn duplicates(&self) -> i64 {
        (self.rows - self.distinct_keys).max(0)
    }
}

/// Write access to the local relational store.
#[async_trait]
pub trait LocalStore: Send {
    /// Resolve a table name case-insensitively. Returns the stored spelling, or
    /// `None` when the table does not exist.
    async fn table_exists(&mut self, table: &str) -> Result<Option<String>>;

    async fn list_columns(&mut self, table: &str) -> Result<Vec<LocalColumn>>;

    /// Apply and commit one DDL statement.
    async fn apply_ddl(&mut self, ddl: &Ddl) -> Result<()>;

    /// Write `rows` in a single transaction. Returns the rows affected per input
    /// row (0 when a conflict policy suppressed it). Nothing is kept on error.
    async fn write_batch(&mut self, plan: &InsertPlan, rows: &[SourceRow]) -> Result<Vec<u64>>;

    /// Whether `column` alone carries a unique index.
    async fn has_unique_constraint(&mut self, table: &str, column: &str) -> Result<bool>;

    async fn create_unique_constraint_if_absent(&mut self, table: &str, column: &str)
        -> Result<()>;

    /// Highest committed surrogate key, if any row exists.
    async fn max_key(&mut self, table: &str, column: &str) -> Result<Option<i64>>;

    async fn count_equal(&mut self, table: &str, column: &str, value: &SqlValue) -> Result<i64>;

    async fn delete_equal(&mut self, table: &str, column: &str, value: &SqlValue) -> Result<u64>;

    async fn key_stats(&mut self, table: &str, column: &str) -> Result<KeyStats>;
}
