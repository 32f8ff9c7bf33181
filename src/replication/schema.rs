// ABOUTME: Schema reconciler - diffs remote columns against the local table and heals it
// ABOUTME: Creates missing tables/columns and computes the usable remote-to-local projection

use crate::error::{classify, ErrorClass};
use crate::local::{Ddl, LocalColumn, LocalStore};
use crate::source::RemoteColumn;
use crate::utils::{sanitize_identifier, validate_identifier};
use anyhow::{Context, Result};
use std::collections::HashSet;

/// Map a remote type name to the local type used for newly added columns.
///
/// Matching is case-insensitive and ignores size suffixes such as `(10,2)`.
pub fn map_remote_type(type_name: &str) -> &'static str {
    let lowered = type_name.to_ascii_lowercase();
    let base = lowered.split('(').next().unwrap_or("").trim();
    match base {
        "string" | "varchar" | "char" | "text" | "clob" | "character varying" | "character"
        | "nvarchar" => "TEXT",
        "tinyint" | "smallint" | "short" | "int" | "integer" | "int2" | "int4" => "INTEGER",
        "bigint" | "long" | "int8" | "biginteger" => "BIGINT",
        "float" | "double" | "real" | "float4" | "float8" | "double precision" => {
            "DOUBLE PRECISION"
        }
        "decimal" | "numeric" | "bigdecimal" => "NUMERIC",
        "boolean" | "bool" => "BOOLEAN",
        "date" => "DATE",
        "timestamp" | "datetime" | "timestamp without time zone" => "TIMESTAMP",
        _ => "TEXT",
    }
}

/// One usable column: where it comes from and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub remote: String,
    pub local: String,
    pub local_type: String,
}

impl ColumnMapping {
    pub fn is_text(&self) -> bool {
        LocalColumn::new(self.local.clone(), self.local_type.clone()).is_text()
    }
}

/// Outcome of reconciling one table.
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// Local spelling of the table name.
    pub table: String,
    /// Usable projection, in remote column order.
    pub columns: Vec<ColumnMapping>,
    pub ddl_applied: usize,
}

impl Reconciled {
    pub fn mapping_for(&self, remote: &str) -> Option<&ColumnMapping> {
        self.columns
            .iter()
            .find(|c| c.remote.eq_ignore_ascii_case(remote))
    }
}

/// Drop remote columns whose names are unsafe or collide case-insensitively
/// with an earlier column.
pub fn usable_remote_columns<'a>(table: &str, projected: &'a [RemoteColumn]) -> Vec<&'a RemoteColumn> {
    let mut seen = HashSet::new();
    projected
        .iter()
        .filter(|column| {
            if let Err(e) = validate_identifier(&column.name) {
                tracing::warn!("Skipping column of {}: {}", table, e);
                return false;
            }
            if !seen.insert(column.name.to_lowercase()) {
                tracing::warn!(
                    "Skipping column '{}' of {}: its name collides with an earlier column when case is ignored",
                    sanitize_identifier(&column.name),
                    table
                );
                return false;
            }
            true
        })
        .collect()
}

/// Bring the local table in line with the projected remote columns.
///
/// An absent table is created with every column typed `TEXT`. Missing columns
/// of an existing table are added one statement at a time; a column whose DDL
/// fails is dropped from the projection.
pub async fn reconcile<L>(local: &mut L, table: &str, projected: &[RemoteColumn]) -> Result<Reconciled>
where
    L: LocalStore + ?Sized,
{
    validate_identifier(table)?;
    let usable = usable_remote_columns(table, projected);

    let Some(local_table) = local.table_exists(table).await? else {
        let local_table = table.to_lowercase();
        if usable.is_empty() {
            return Ok(Reconciled {
                table: local_table,
                columns: Vec::new(),
                ddl_applied: 0,
            });
        }

        let columns: Vec<ColumnMapping> = usable
            .iter()
            .map(|rc| ColumnMapping {
                remote: rc.name.clone(),
                local: rc.name.to_lowercase(),
                local_type: "text".to_string(),
            })
            .collect();
        let ddl = Ddl::CreateTable {
            table: local_table.clone(),
            columns: columns
                .iter()
                .map(|c| LocalColumn::new(c.local.clone(), c.local_type.clone()))
                .collect(),
        };
        local
            .apply_ddl(&ddl)
            .await
            .with_context(|| format!("Failed to create local table {}", local_table))?;
        tracing::info!(
            "Created local table {} with {} text columns",
            local_table,
            columns.len()
        );

        return Ok(Reconciled {
            table: local_table,
            columns,
            ddl_applied: 1,
        });
    };

    let existing = local
        .list_columns(&local_table)
        .await
        .with_context(|| format!("Failed to list columns of local table {}", local_table))?;

    let mut columns = Vec::with_capacity(usable.len());
    let mut ddl_applied = 0;

    for rc in usable {
        if let Some(lc) = existing
            .iter()
            .find(|lc| lc.name.eq_ignore_ascii_case(&rc.name))
        {
            columns.push(ColumnMapping {
                remote: rc.name.clone(),
                local: lc.name.clone(),
                local_type: lc.data_type.clone(),
            });
            continue;
        }

        let column = LocalColumn::new(rc.name.to_lowercase(), map_remote_type(&rc.type_name));
        let ddl = Ddl::AddColumn {
            table: local_table.clone(),
            column: column.clone(),
        };
        match local.apply_ddl(&ddl).await {
            Ok(()) => {
                tracing::info!(
                    "Added column {} {} to local table {}",
                    column.name,
                    column.data_type,
                    local_table
                );
                ddl_applied += 1;
                columns.push(ColumnMapping {
                    remote: rc.name.clone(),
                    local: column.name,
                    local_type: column.data_type,
                });
            }
            Err(e) if classify(&e) == ErrorClass::Transient => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "Could not add column {} to {}, leaving it out: {:#}",
                    column.name,
                    local_table,
                    e
                );
            }
        }
    }

    Ok(Reconciled {
        table: local_table,
        columns,
        ddl_applied,
    })
}
