// ABOUTME: Extraction planning - cursor strategy, pending partitions and column projection
// ABOUTME: Pure functions; the driver feeds them catalog data and the persisted watermark

use super::state::{TableState, Watermark};
use crate::source::RemoteColumn;
use crate::utils::sanitize_identifier;
use crate::value::parse_date;
use anyhow::{bail, Result};
use chrono::NaiveDate;

/// How a table is read incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStrategy {
    /// Ascending surrogate key; `column` is the remote spelling.
    Key { column: String, integer: bool },
    /// One load-date partition at a time.
    Partition { column: String },
}

impl CursorStrategy {
    pub fn column(&self) -> &str {
        match self {
            CursorStrategy::Key { column, .. } | CursorStrategy::Partition { column } => column,
        }
    }
}

fn find_column<'a>(remote: &'a [RemoteColumn], name: &str) -> Option<&'a RemoteColumn> {
    remote.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Choose the cursor for a table.
///
/// A persisted watermark fixes the strategy. Otherwise the key column wins over
/// the partition column. `None` means the table has neither.
pub fn choose_strategy(
    state: &TableState,
    remote: &[RemoteColumn],
    key_column: &str,
    partition_column: &str,
) -> Result<Option<CursorStrategy>> {
    let key = find_column(remote, key_column).map(|c| CursorStrategy::Key {
        column: c.name.clone(),
        integer: c.is_integer(),
    });
    let partition = find_column(remote, partition_column).map(|c| CursorStrategy::Partition {
        column: c.name.clone(),
    });

    match state.watermark {
        Some(Watermark::Key(_)) => match key {
            Some(strategy) => Ok(Some(strategy)),
            None => bail!(
                "{} has a {} watermark but no remote column named {}",
                state.name,
                "last_id",
                key_column
            ),
        },
        Some(Watermark::Partition(_)) => match partition {
            Some(strategy) => Ok(Some(strategy)),
            None => bail!(
                "{} has a {} watermark but no remote column named {}",
                state.name,
                "last_partition",
                partition_column
            ),
        },
        None => Ok(key.or(partition)),
    }
}

/// A remote partition value still to be copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPartition {
    pub date: NaiveDate,
    /// Value exactly as the remote rendered it, used for filtering.
    pub raw: String,
}

/// Partitions strictly after `after` and no later than `cutoff`, ascending.
///
/// Values that are not dates are ignored with a warning. When two raw values
/// name the same date only the first is kept.
pub fn pending_partitions(
    values: Vec<String>,
    after: Option<NaiveDate>,
    cutoff: NaiveDate,
) -> Vec<PendingPartition> {
    let mut pending: Vec<PendingPartition> = values
        .into_iter()
        .filter_map(|raw| match parse_date(&raw) {
            Some(date) => Some(PendingPartition { date, raw }),
            None => {
                tracing::warn!("Ignoring partition value '{}': not a date", sanitize_identifier(&raw));
                None
            }
        })
        .filter(|p| after.map_or(true, |after| p.date > after) && p.date <= cutoff)
        .collect();
    pending.sort_by_key(|p| p.date);
    pending.dedup_by_key(|p| p.date);
    pending
}

/// Apply the optional allow-list and make sure the cursor column is included.
///
/// Keeps remote column order. Allow-list names are matched case-insensitively;
/// names the remote table lacks are reported and ignored.
pub fn project_columns(
    table: &str,
    remote: &[RemoteColumn],
    allow: Option<&[String]>,
    cursor_column: &str,
) -> Vec<RemoteColumn> {
    let Some(allow) = allow else {
        return remote.to_vec();
    };

    for wanted in allow {
        if find_column(remote, wanted).is_none() {
            tracing::warn!(
                "Column '{}' listed for {} does not exist remotely",
                sanitize_identifier(wanted),
                table
            );
        }
    }

    let listed = |name: &str| allow.iter().any(|a| a.eq_ignore_ascii_case(name));
    if !listed(cursor_column) {
        tracing::info!(
            "Adding cursor column {} to the column list of {}",
            cursor_column,
            table
        );
    }

    remote
        .iter()
        .filter(|c| listed(&c.name) || c.name.eq_ignore_ascii_case(cursor_column))
        .cloned()
        .collect()
}
