// ABOUTME: RemoteSource over a PostgreSQL-wire endpoint using server-side portals
// ABOUTME: Every round-trip is bounded by the configured session timeout

use super::{RemoteColumn, RemoteSource, RowCursor, RowQuery, SourceRow};
use crate::utils::{qualified_name, quote_ident};
use crate::value::{self, SqlValue};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Portal, Transaction};

/// Types decoded natively by [`value::from_row`]; everything else is cast to text remotely.
const NATIVE_TYPES: [&str; 18] = [
    "boolean",
    "smallint",
    "integer",
    "bigint",
    "real",
    "double precision",
    "numeric",
    "text",
    "character varying",
    "character",
    "name",
    "date",
    "timestamp without time zone",
    "timestamp with time zone",
    "uuid",
    "json",
    "jsonb",
    "bytea",
];

fn is_native(type_name: &str) -> bool {
    let lowered = type_name.to_ascii_lowercase();
    NATIVE_TYPES.contains(&lowered.as_str())
}

async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, tokio_postgres::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.with_context(|| what.to_string()),
        Err(elapsed) => Err(anyhow::Error::new(elapsed)
            .context(format!("{} timed out after {:?}", what, timeout))),
    }
}

fn param_refs(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

pub struct PgRemoteSource {
    client: Client,
    schema: String,
    session_timeout: Duration,
}

impl PgRemoteSource {
    pub fn new(client: Client, schema: String, session_timeout: Duration) -> Self {
        Self {
            client,
            schema,
            session_timeout,
        }
    }

    fn select_sql(&self, query: &RowQuery) -> (String, Vec<SqlValue>) {
        let projection: Vec<String> = query
            .columns
            .iter()
            .map(|c| {
                let ident = quote_ident(&c.name);
                if is_native(&c.type_name) {
                    ident
                } else {
                    format!("CAST({} AS VARCHAR) AS {}", ident, ident)
                }
            })
            .collect();
        let (where_sql, params) = query.where_clause();
        let sql = format!(
            "SELECT {} FROM {}{}{}",
            projection.join(", "),
            qualified_name(&self.schema, &query.table),
            where_sql,
            query.order_clause()
        );
        (sql, params)
    }
}

#[async_trait]
impl RemoteSource for PgRemoteSource {
    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = bounded(
            self.session_timeout,
            "Failed to list remote tables",
            self.client.query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema::text = $1::text ORDER BY table_name",
                &[&self.schema],
            ),
        )
        .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn list_columns(&mut self, table: &str) -> Result<Vec<RemoteColumn>> {
        let rows = bounded(
            self.session_timeout,
            &format!("Failed to describe remote table {}", table),
            self.client.query(
                "SELECT column_name::text, data_type::text FROM information_schema.columns \
                 WHERE table_schema::text = $1::text AND table_name::text = $2::text \
                 ORDER BY ordinal_position",
                &[&self.schema, &table],
            ),
        )
        .await?;
        Ok(rows
            .iter()
            .map(|row| RemoteColumn {
                name: row.get(0),
                type_name: row.get(1),
            })
            .collect())
    }

    async fn distinct_values(&mut self, table: &str, column: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT CAST({col} AS VARCHAR) FROM {table} WHERE {col} IS NOT NULL",
            col = quote_ident(column),
            table = qualified_name(&self.schema, table),
        );
        let rows = bounded(
            self.session_timeout,
            &format!("Failed to list distinct {} values of {}", column, table),
            self.client.query(&sql, &[]),
        )
        .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn count_matching(&mut self, query: &RowQuery) -> Result<i64> {
        let (where_sql, params) = query.where_clause();
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            qualified_name(&self.schema, &query.table),
            where_sql
        );
        let refs = param_refs(&params);
        let row = bounded(
            self.session_timeout,
            &format!("Failed to count rows of {}", query.table),
            self.client.query_one(&sql, &refs),
        )
        .await?;
        Ok(row.get(0))
    }

    async fn open_cursor<'a>(&'a mut self, query: &RowQuery) -> Result<Box<dyn RowCursor + 'a>> {
        let (sql, params) = self.select_sql(query);
        let timeout = self.session_timeout;
        tracing::debug!("Opening remote cursor: {}", sql);

        let tx = bounded(
            timeout,
            "Failed to open remote transaction",
            self.client.transaction(),
        )
        .await?;
        let statement = bounded(
            timeout,
            &format!("Failed to prepare remote query on {}", query.table),
            tx.prepare(&sql),
        )
        .await?;
        let refs = param_refs(&params);
        let portal = bounded(
            timeout,
            &format!("Failed to open remote cursor on {}", query.table),
            tx.bind(&statement, &refs),
        )
        .await?;

        Ok(Box::new(PgRowCursor {
            tx,
            portal,
            columns: query.column_names(),
            fetch_size: query.fetch_size,
            timeout,
            table: query.table.clone(),
            exhausted: false,
        }))
    }
}

struct PgRowCursor<'a> {
    tx: Transaction<'a>,
    portal: Portal,
    columns: Arc<[String]>,
    fetch_size: usize,
    timeout: Duration,
    table: String,
    exhausted: bool,
}

#[async_trait]
impl RowCursor for PgRowCursor<'_> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRow>>> {
        if self.exhausted {
            return Ok(None);
        }

        let max_rows = i32::try_from(self.fetch_size).unwrap_or(i32::MAX);
        let rows = bounded(
            self.timeout,
            &format!("Failed to fetch rows from {}", self.table),
            self.tx.query_portal(&self.portal, max_rows),
        )
        .await?;

        if rows.len() < self.fetch_size {
            self.exhausted = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        rows.iter()
            .map(|row| {
                let values = (0..row.len())
                    .map(|i| value::from_row(row, i))
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Failed to decode row from {}", self.table))?;
                Ok(SourceRow::new(self.columns.clone(), values))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}
