// ABOUTME: Remote tabular source abstraction: catalog queries and forward-only row cursors
// ABOUTME: RowQuery renders the filtered SELECT shared by counting and extraction

pub mod postgres;

use crate::replication::exclusion::ExclusionRule;
use crate::utils::quote_ident;
use crate::value::SqlValue;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use postgres::PgRemoteSource;

/// Column as described by the remote catalog. Fetched fresh every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteColumn {
    pub name: String,
    pub type_name: String,
}

impl RemoteColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }

    /// Whether the remote type is an integer family type (no cast needed for key comparisons).
    pub fn is_integer(&self) -> bool {
        let base = self.type_name.to_ascii_lowercase();
        let base = base.split('(').next().unwrap_or("").trim();
        matches!(
            base,
            "tinyint" | "smallint" | "short" | "int" | "integer" | "int2" | "int4" | "bigint"
                | "long" | "int8" | "biginteger"
        )
    }
}

/// One remote row, addressable by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl SourceRow {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Case-insensitive lookup by column name.
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|i| &self.values[i])
    }
}

/// Which rows a query selects before the exclusion rule is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    All,
    /// `key > after`, cast to BIGINT when the remote key is not integer-typed.
    KeyAfter {
        column: String,
        after: i64,
        cast_to_bigint: bool,
    },
    PartitionEquals { column: String, value: String },
}

/// Ascending order on a cursor column. Uses the same BIGINT cast as
/// [`RowFilter::KeyAfter`] so rows arrive in the order the watermark compares them.
#[derive(Debug, Clone, PartialEq)]
pub struct RowOrder {
    pub column: String,
    pub cast_to_bigint: bool,
}

fn key_expression(column: &str, cast_to_bigint: bool) -> String {
    if cast_to_bigint {
        format!("CAST({} AS BIGINT)", quote_ident(column))
    } else {
        quote_ident(column)
    }
}

#[derive(Debug, Clone)]
pub struct RowQuery {
    pub table: String,
    pub columns: Vec<RemoteColumn>,
    pub filter: RowFilter,
    pub exclusion: Option<ExclusionRule>,
    pub order_by: Option<RowOrder>,
    pub fetch_size: usize,
}

impl RowQuery {
    pub fn column_names(&self) -> Arc<[String]> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// ` WHERE ...` (or empty) plus the parameters it binds, numbered from `$1`.
    pub fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut predicates = Vec::new();
        let mut params = Vec::new();
        let mut next_param = 1;

        match &self.filter {
            RowFilter::All => {}
            RowFilter::KeyAfter {
                column,
                after,
                cast_to_bigint,
            } => {
                predicates.push(format!(
                    "{} > ${}",
                    key_expression(column, *cast_to_bigint),
                    next_param
                ));
                params.push(SqlValue::Int(*after));
                next_param += 1;
            }
            RowFilter::PartitionEquals { column, value } => {
                predicates.push(format!("{} = ${}", quote_ident(column), next_param));
                params.push(SqlValue::Text(value.clone()));
                next_param += 1;
            }
        }

        if let Some(rule) = &self.exclusion {
            let (sql, rule_params) = rule.to_sql(&mut next_param);
            predicates.push(sql);
            params.extend(rule_params);
        }

        if predicates.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", predicates.join(" AND ")), params)
        }
    }

    pub fn order_clause(&self) -> String {
        match &self.order_by {
            Some(order) => format!(
                " ORDER BY {}",
                key_expression(&order.column, order.cast_to_bigint)
            ),
            None => String::new(),
        }
    }
}

/// Forward-only cursor over a [`RowQuery`].
#[async_trait]
pub trait RowCursor: Send {
    /// Up to `fetch_size` rows, or `None` once exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRow>>>;
}

/// Read-only access to the remote tabular source.
#[async_trait]
pub trait RemoteSource: Send {
    async fn list_tables(&mut self) -> Result<Vec<String>>;

    async fn list_columns(&mut self, table: &str) -> Result<Vec<RemoteColumn>>;

    /// Distinct non-null values of `column`, rendered as text.
    async fn distinct_values(&mut self, table: &str, column: &str) -> Result<Vec<String>>;

    /// Number of rows the query would return. Used for progress logging only.
    async fn count_matching(&mut self, query: &RowQuery) -> Result<i64>;

    async fn open_cursor<'a>(&'a mut self, query: &RowQuery) -> Result<Box<dyn RowCursor + 'a>>;
}
