// ABOUTME: Insert planning for batched local writes: conflict policy, value mode and SQL
// ABOUTME: Re-running a batch never duplicates rows when the table has a surrogate key

use super::schema::ColumnMapping;
use crate::local::LocalStore;
use crate::source::SourceRow;
use crate::utils::{qualified_name, quote_ident};
use crate::value::SqlValue;
use anyhow::{bail, Result};

/// How inserts avoid duplicating rows that are already present locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// `ON CONFLICT (key) DO NOTHING`, backed by a single-column unique index.
    OnConflictDoNothing { key: String },
    /// Per-row `WHERE NOT EXISTS` guard for tables that cannot carry a unique index.
    GuardedInsert { key: String },
    Plain,
}

/// How values are handed to the insert statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMode {
    /// Values travel typed and are encoded for each destination column.
    Typed,
    /// Every value is rendered to text first.
    Text,
}

impl ValueMode {
    pub fn for_columns(columns: &[ColumnMapping]) -> Self {
        if !columns.is_empty() && columns.iter().all(ColumnMapping::is_text) {
            ValueMode::Text
        } else {
            ValueMode::Typed
        }
    }
}

/// Everything needed to write one table's batches.
#[derive(Debug, Clone)]
pub struct InsertPlan {
    pub table: String,
    pub columns: Vec<ColumnMapping>,
    pub policy: ConflictPolicy,
    pub mode: ValueMode,
}

impl InsertPlan {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<ColumnMapping>,
        policy: ConflictPolicy,
    ) -> Result<Self> {
        let table = table.into();
        if columns.is_empty() {
            bail!("Insert plan for {} has no columns", table);
        }
        if let ConflictPolicy::OnConflictDoNothing { key } | ConflictPolicy::GuardedInsert { key } =
            &policy
        {
            if !columns.iter().any(|c| c.local == *key) {
                bail!("Key column {} is not part of the insert plan for {}", key, table);
            }
        }
        let mode = ValueMode::for_columns(&columns);
        Ok(Self {
            table,
            columns,
            policy,
            mode,
        })
    }

    /// Parameter values for one row, in plan column order.
    pub fn row_values(&self, row: &SourceRow) -> Vec<SqlValue> {
        self.columns
            .iter()
            .map(|c| {
                let value = row.get(&c.remote).cloned().unwrap_or(SqlValue::Null);
                match self.mode {
                    ValueMode::Text => value.into_text(),
                    ValueMode::Typed => value,
                }
            })
            .collect()
    }
}

/// Build the single-row insert statement for a plan.
///
/// ```sql
/// INSERT INTO "s"."t" ("id", "name") VALUES ($1, $2) ON CONFLICT ("id") DO NOTHING
///
/// INSERT INTO "s"."t" ("id", "name") SELECT $1::bigint, $2::text
/// WHERE NOT EXISTS (SELECT 1 FROM "s"."t" WHERE "id" = $1::bigint)
/// ```
pub fn build_insert_query(schema: &str, plan: &InsertPlan) -> String {
    let table = qualified_name(schema, &plan.table);
    let columns: Vec<String> = plan.columns.iter().map(|c| quote_ident(&c.local)).collect();

    match &plan.policy {
        ConflictPolicy::Plain => {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders(plan.columns.len()).join(", ")
            )
        }
        ConflictPolicy::OnConflictDoNothing { key } => {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
                table,
                columns.join(", "),
                placeholders(plan.columns.len()).join(", "),
                quote_ident(key)
            )
        }
        ConflictPolicy::GuardedInsert { key } => {
            // Explicit casts: a bare $n in a SELECT list would be inferred as text.
            let typed: Vec<String> = plan
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("${}::{}", i + 1, c.local_type))
                .collect();
            let key_param = plan
                .columns
                .iter()
                .position(|c| c.local == *key)
                .map(|i| typed[i].clone())
                .unwrap_or_else(|| "NULL".to_string());
            format!(
                "INSERT INTO {table} ({}) SELECT {} WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {} = {})",
                columns.join(", "),
                typed.join(", "),
                quote_ident(key),
                key_param,
            )
        }
    }
}

fn placeholders(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("${}", i)).collect()
}

/// Pick the conflict policy for a table with surrogate key `key`.
///
/// Prefers a unique index (existing or freshly created) and falls back to the
/// guarded insert when the index cannot be created, e.g. because the table
/// already holds duplicate keys.
pub async fn choose_conflict_policy<L>(local: &mut L, table: &str, key: &str) -> Result<ConflictPolicy>
where
    L: LocalStore + ?Sized,
{
    if local.has_unique_constraint(table, key).await? {
        return Ok(ConflictPolicy::OnConflictDoNothing {
            key: key.to_string(),
        });
    }

    match local.create_unique_constraint_if_absent(table, key).await {
        Ok(()) => {
            tracing::info!("Created unique index on {}.{}", table, key);
            Ok(ConflictPolicy::OnConflictDoNothing {
                key: key.to_string(),
            })
        }
        Err(e) => {
            tracing::warn!(
                "Could not create unique index on {}.{} ({:#}); using guarded inserts",
                table,
                key,
                e
            );
            Ok(ConflictPolicy::GuardedInsert {
                key: key.to_string(),
            })
        }
    }
}
