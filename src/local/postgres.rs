// ABOUTME: LocalStore over PostgreSQL: catalog queries, DDL and transactional batch inserts
// ABOUTME: A batch is one transaction of pipelined executions of a single prepared statement

use super::{Ddl, KeyStats, LocalColumn, LocalStore};
use crate::replication::writer::{build_insert_query, InsertPlan};
use crate::source::SourceRow;
use crate::utils::{qualified_name, quote_ident, truncate_identifier};
use crate::value::SqlValue;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

pub struct PgLocalStore {
    client: Client,
    schema: String,
}

impl PgLocalStore {
    pub fn new(client: Client, schema: String) -> Self {
        Self { client, schema }
    }
}

#[async_trait]
impl LocalStore for PgLocalStore {
    async fn table_exists(&mut self, table: &str) -> Result<Option<String>> {
        // Exact spelling wins over a case-insensitive match.
        let row = self
            .client
            .query_opt(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema::text = $1::text AND lower(table_name::text) = lower($2::text) \
                 ORDER BY (table_name::text = $2::text) DESC, table_name LIMIT 1",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to look up local table {}", table))?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn list_columns(&mut self, table: &str) -> Result<Vec<LocalColumn>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
                 FROM pg_attribute a \
                 JOIN pg_class c ON c.oid = a.attrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                   AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to list columns of {}", table))?;
        Ok(rows
            .iter()
            .map(|row| LocalColumn {
                name: row.get(0),
                data_type: row.get(1),
            })
            .collect())
    }

    async fn apply_ddl(&mut self, ddl: &Ddl) -> Result<()> {
        let sql = ddl.to_sql(&self.schema);
        tracing::debug!("Applying DDL: {}", sql);
        self.client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to apply DDL on {}", ddl.table()))
    }

    async fn write_batch(&mut self, plan: &InsertPlan, rows: &[SourceRow]) -> Result<Vec<u64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let sql = build_insert_query(&self.schema, plan);
        let values: Vec<Vec<SqlValue>> = rows.iter().map(|row| plan.row_values(row)).collect();

        let tx = self
            .client
            .transaction()
            .await
            .context("Failed to begin local transaction")?;
        let statement = tx
            .prepare(&sql)
            .await
            .with_context(|| format!("Failed to prepare insert into {}", plan.table))?;

        // Executions on one transaction are pipelined by the driver.
        let outcomes = try_join_all(values.iter().map(|row| {
            let params: Vec<&(dyn ToSql + Sync)> =
                row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            let tx = &tx;
            let statement = &statement;
            async move { tx.execute(statement, &params).await }
        }))
        .await
        .with_context(|| format!("Failed to insert batch into {}", plan.table))?;

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit batch into {}", plan.table))?;

        Ok(outcomes)
    }

    async fn has_unique_constraint(&mut self, table: &str, column: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS ( \
                   SELECT 1 FROM pg_index i \
                   JOIN pg_class c ON c.oid = i.indrelid \
                   JOIN pg_namespace n ON n.oid = c.relnamespace \
                   JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = i.indkey[0] \
                   WHERE n.nspname = $1 AND c.relname = $2 AND a.attname = $3 \
                     AND i.indisunique AND i.indnatts = 1 AND i.indpred IS NULL)",
                &[&self.schema, &table, &column],
            )
            .await
            .with_context(|| format!("Failed to inspect indexes of {}", table))?;
        Ok(row.get(0))
    }

    async fn create_unique_constraint_if_absent(
        &mut self,
        table: &str,
        column: &str,
    ) -> Result<()> {
        let index = truncate_identifier(&format!("{}_{}_key", table, column));
        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&index),
            qualified_name(&self.schema, table),
            quote_ident(column)
        );
        self.client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to create unique index {}", index))
    }

    async fn max_key(&mut self, table: &str, column: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MAX(CAST({} AS BIGINT)) FROM {}",
            quote_ident(column),
            qualified_name(&self.schema, table)
        );
        let row = self
            .client
            .query_one(&sql, &[])
            .await
            .with_context(|| format!("Failed to read max {} of {}", column, table))?;
        Ok(row.get(0))
    }

    async fn count_equal(&mut self, table: &str, column: &str, value: &SqlValue) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1",
            qualified_name(&self.schema, table),
            quote_ident(column)
        );
        let row = self
            .client
            .query_one(&sql, &[value])
            .await
            .with_context(|| format!("Failed to count rows of {}", table))?;
        Ok(row.get(0))
    }

    async fn delete_equal(&mut self, table: &str, column: &str, value: &SqlValue) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            qualified_name(&self.schema, table),
            quote_ident(column)
        );
        self.client
            .execute(&sql, &[value])
            .await
            .with_context(|| format!("Failed to delete rows of {}", table))
    }

    async fn key_stats(&mut self, table: &str, column: &str) -> Result<KeyStats> {
        let sql = format!(
            "SELECT COUNT({0}), COUNT(DISTINCT {0}) FROM {1}",
            quote_ident(column),
            qualified_name(&self.schema, table)
        );
        let row = self
            .client
            .query_one(&sql, &[])
            .await
            .with_context(|| format!("Failed to read key statistics of {}", table))?;
        Ok(KeyStats {
            rows: row.get(0),
            distinct_keys: row.get(1),
        })
    }
}
