// ABOUTME: In-memory RemoteSource/LocalStore fakes and a fixed clock for driver tests
// ABOUTME: Fakes share state behind Arc<Mutex<..>> so tests can inspect it after a run

#![allow(dead_code)]

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use table_replicator::local::{Ddl, KeyStats, LocalColumn, LocalStore};
use table_replicator::replication::exclusion::{CompareOp, Literal};
use table_replicator::replication::{ConflictPolicy, Connector, ExclusionRule, InsertPlan};
use table_replicator::retry::{Backoff, Clock, RetryPolicy};
use table_replicator::source::{RemoteColumn, RemoteSource, RowCursor, RowFilter, RowQuery, SourceRow};
use table_replicator::{ReplicationOptions, Replicator, SqlValue, WatermarkStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub fn int(v: i64) -> SqlValue {
    SqlValue::Int(v)
}

pub fn text(v: &str) -> SqlValue {
    SqlValue::Text(v.to_string())
}

fn same(a: &SqlValue, b: &SqlValue) -> bool {
    match (a.to_text(), b.to_text()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Ascending order as the server sorts a column of the value's own type:
/// numbers numerically, text byte-wise, NULLs last.
fn sql_order(a: &SqlValue, b: &SqlValue) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
        (SqlValue::Null, _) => Ordering::Greater,
        (_, SqlValue::Null) => Ordering::Less,
        (SqlValue::Int(a), SqlValue::Int(b)) => a.cmp(b),
        _ => a.to_text().cmp(&b.to_text()),
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RemoteTable {
    pub name: String,
    pub columns: Vec<RemoteColumn>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RemoteTable {
    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
    }

    fn value<'a>(&self, row: &'a [SqlValue], column: &str) -> &'a SqlValue {
        match self.index_of(column) {
            Some(idx) => &row[idx],
            None => &SqlValue::Null,
        }
    }

    fn matches(&self, row: &[SqlValue], query: &RowQuery) -> bool {
        let selected = match &query.filter {
            RowFilter::All => true,
            RowFilter::KeyAfter { column, after, .. } => self
                .value(row, column)
                .as_i64()
                .map_or(false, |key| key > *after),
            RowFilter::PartitionEquals { column, value } => {
                self.value(row, column).to_text().as_deref() == Some(value.as_str())
            }
        };
        selected
            && query
                .exclusion
                .as_ref()
                .map_or(true, |rule| self.kept_by(rule, row))
    }

    /// `NOT (...)` under SQL three-valued logic: only a definite false keeps the row.
    fn kept_by(&self, rule: &ExclusionRule, row: &[SqlValue]) -> bool {
        let mut any: Option<bool> = Some(false);
        for group in &rule.any_of {
            let mut all: Option<bool> = Some(true);
            for cmp in group {
                let value = self.value(row, &cmp.column);
                let result = match (&cmp.literal, cmp.op) {
                    (Literal::Null, CompareOp::Eq) => Some(value.is_null()),
                    (Literal::Null, CompareOp::NotEq) => Some(!value.is_null()),
                    (literal, op) if !value.is_null() => {
                        let equal = same(value, &literal.to_value());
                        Some(if op == CompareOp::Eq { equal } else { !equal })
                    }
                    _ => None,
                };
                all = match (all, result) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                };
            }
            any = match (any, all) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            };
        }
        any == Some(false)
    }
}

#[derive(Debug, Default)]
pub struct RemoteData {
    pub tables: Vec<RemoteTable>,
    /// `operation:table` for every catalog or data call.
    pub calls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    pub data: Arc<Mutex<RemoteData>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str, columns: &[(&str, &str)]) {
        self.data.lock().unwrap().tables.push(RemoteTable {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(n, t)| RemoteColumn::new(*n, *t))
                .collect(),
            rows: Vec::new(),
        });
    }

    pub fn insert(&self, table: &str, row: Vec<SqlValue>) {
        let mut data = self.data.lock().unwrap();
        let table = data
            .tables
            .iter_mut()
            .find(|t| t.name == table)
            .expect("remote table");
        table.rows.push(row);
    }

    pub fn calls(&self) -> Vec<String> {
        self.data.lock().unwrap().calls.clone()
    }

    fn with_table<T>(&self, call: &str, name: &str, f: impl FnOnce(&RemoteTable) -> T) -> Result<T> {
        let mut data = self.data.lock().unwrap();
        data.calls.push(format!("{}:{}", call, name));
        let table = data
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", name))?;
        Ok(f(table))
    }
}

struct MemoryCursor {
    chunks: VecDeque<Vec<SourceRow>>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRow>>> {
        Ok(self.chunks.pop_front())
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let mut data = self.data.lock().unwrap();
        data.calls.push("list_tables".to_string());
        Ok(data.tables.iter().map(|t| t.name.clone()).collect())
    }

    async fn list_columns(&mut self, table: &str) -> Result<Vec<RemoteColumn>> {
        self.with_table("list_columns", table, |t| t.columns.clone())
    }

    async fn distinct_values(&mut self, table: &str, column: &str) -> Result<Vec<String>> {
        self.with_table("distinct_values", table, |t| {
            let mut seen = HashSet::new();
            t.rows
                .iter()
                .filter_map(|row| t.value(row, column).to_text())
                .filter(|v| seen.insert(v.clone()))
                .collect()
        })
    }

    async fn count_matching(&mut self, query: &RowQuery) -> Result<i64> {
        self.with_table("count", &query.table, |t| {
            t.rows.iter().filter(|row| t.matches(row, query)).count() as i64
        })
    }

    async fn open_cursor<'a>(&'a mut self, query: &RowQuery) -> Result<Box<dyn RowCursor + 'a>> {
        let names = query.column_names();
        let rows = self.with_table("select", &query.table, |t| {
            let mut rows: Vec<&Vec<SqlValue>> =
                t.rows.iter().filter(|row| t.matches(row, query)).collect();
            if let Some(order) = &query.order_by {
                rows.sort_by(|a, b| {
                    let (a, b) = (t.value(a, &order.column), t.value(b, &order.column));
                    if order.cast_to_bigint {
                        a.as_i64().cmp(&b.as_i64())
                    } else {
                        sql_order(a, b)
                    }
                });
            }
            rows.into_iter()
                .map(|row| {
                    let values = query
                        .columns
                        .iter()
                        .map(|c| t.value(row, &c.name).clone())
                        .collect();
                    SourceRow::new(names.clone(), values)
                })
                .collect::<Vec<_>>()
        })?;

        let chunks = rows
            .chunks(query.fetch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(Box::new(MemoryCursor { chunks }))
    }
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalTable {
    pub name: String,
    pub columns: Vec<LocalColumn>,
    pub rows: Vec<Vec<SqlValue>>,
    pub unique: Vec<String>,
}

impl LocalTable {
    fn index_of(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| anyhow!("column \"{}\" of relation \"{}\" does not exist", column, self.name))
    }

    fn has_key(&self, idx: usize, value: &SqlValue) -> bool {
        self.rows.iter().any(|row| same(&row[idx], value))
    }
}

#[derive(Debug, Default)]
pub struct LocalData {
    pub tables: Vec<LocalTable>,
    pub ddl_log: Vec<Ddl>,
    pub batches: usize,
    /// Lowercase table names whose writes fail with a data error.
    pub fail_writes: HashSet<String>,
    /// Writes that fail with a connection reset before any succeeds.
    pub transient_write_failures: usize,
    /// Unique index creation always fails.
    pub reject_unique: bool,
    /// Lowercase column names that cannot be added.
    pub fail_add_column: HashSet<String>,
    /// Cancel the token once this many batches have committed.
    pub cancel_after: Option<(usize, CancellationToken)>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLocal {
    pub data: Arc<Mutex<LocalData>>,
}

impl MemoryLocal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, name: &str, columns: &[(&str, &str)]) {
        self.data.lock().unwrap().tables.push(LocalTable {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(n, t)| LocalColumn::new(*n, *t))
                .collect(),
            rows: Vec::new(),
            unique: Vec::new(),
        });
    }

    pub fn insert(&self, table: &str, row: Vec<SqlValue>) {
        let mut data = self.data.lock().unwrap();
        let table = data
            .tables
            .iter_mut()
            .find(|t| t.name == table)
            .expect("local table");
        table.rows.push(row);
    }

    pub fn table(&self, name: &str) -> Option<LocalTable> {
        self.data
            .lock()
            .unwrap()
            .tables
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.table(table).map_or(0, |t| t.rows.len())
    }

    /// Values of one column rendered as text, in insertion order.
    pub fn column_text(&self, table: &str, column: &str) -> Vec<Option<String>> {
        let Some(t) = self.table(table) else {
            return Vec::new();
        };
        let idx = t.index_of(column).expect("local column");
        t.rows.iter().map(|row| row[idx].to_text()).collect()
    }

    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.table(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ddl_log(&self) -> Vec<Ddl> {
        self.data.lock().unwrap().ddl_log.clone()
    }

    pub fn configure(&self, f: impl FnOnce(&mut LocalData)) {
        f(&mut self.data.lock().unwrap());
    }
}

fn find_table<'a>(data: &'a mut LocalData, name: &str) -> Result<&'a mut LocalTable> {
    data.tables
        .iter_mut()
        .find(|t| t.name == name)
        .ok_or_else(|| anyhow!("relation \"{}\" does not exist", name))
}

#[async_trait]
impl LocalStore for MemoryLocal {
    async fn table_exists(&mut self, table: &str) -> Result<Option<String>> {
        let data = self.data.lock().unwrap();
        let exact = data.tables.iter().find(|t| t.name == table);
        let found = exact.or_else(|| {
            data.tables
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(table))
        });
        Ok(found.map(|t| t.name.clone()))
    }

    async fn list_columns(&mut self, table: &str) -> Result<Vec<LocalColumn>> {
        let mut data = self.data.lock().unwrap();
        Ok(find_table(&mut data, table)?.columns.clone())
    }

    async fn apply_ddl(&mut self, ddl: &Ddl) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        match ddl {
            Ddl::CreateTable { table, columns } => {
                if !data.tables.iter().any(|t| t.name == *table) {
                    data.tables.push(LocalTable {
                        name: table.clone(),
                        columns: columns.clone(),
                        rows: Vec::new(),
                        unique: Vec::new(),
                    });
                }
            }
            Ddl::AddColumn { table, column } => {
                if data.fail_add_column.contains(&column.name.to_lowercase()) {
                    bail!("permission denied for table {}", table);
                }
                let t = find_table(&mut data, table)?;
                t.columns.push(column.clone());
                for row in &mut t.rows {
                    row.push(SqlValue::Null);
                }
            }
        }
        data.ddl_log.push(ddl.clone());
        Ok(())
    }

    async fn write_batch(&mut self, plan: &InsertPlan, rows: &[SourceRow]) -> Result<Vec<u64>> {
        let mut data = self.data.lock().unwrap();
        if data.fail_writes.contains(&plan.table.to_lowercase()) {
            bail!("value too long for type character varying(10)");
        }
        if data.transient_write_failures > 0 {
            data.transient_write_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
                .context("Failed to insert batch");
        }

        // Work on a copy so a failed batch leaves nothing behind.
        let mut staged = find_table(&mut data, &plan.table)?.clone();
        let indexes = plan
            .columns
            .iter()
            .map(|c| staged.index_of(&c.local))
            .collect::<Result<Vec<_>>>()?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let mut full = vec![SqlValue::Null; staged.columns.len()];
            for (idx, value) in indexes.iter().zip(plan.row_values(row)) {
                full[*idx] = value;
            }

            let suppressed = match &plan.policy {
                ConflictPolicy::OnConflictDoNothing { key } => {
                    if !staged.unique.contains(key) {
                        bail!("there is no unique or exclusion constraint matching the ON CONFLICT specification");
                    }
                    let idx = staged.index_of(key)?;
                    staged.has_key(idx, &full[idx])
                }
                ConflictPolicy::GuardedInsert { key } => {
                    let idx = staged.index_of(key)?;
                    staged.has_key(idx, &full[idx])
                }
                ConflictPolicy::Plain => false,
            };
            if suppressed {
                outcomes.push(0);
                continue;
            }
            for key in &staged.unique {
                let idx = staged.index_of(key)?;
                if staged.has_key(idx, &full[idx]) {
                    bail!("duplicate key value violates unique constraint on {}", key);
                }
            }
            staged.rows.push(full);
            outcomes.push(1);
        }

        *find_table(&mut data, &plan.table)? = staged;
        data.batches += 1;
        if let Some((after, token)) = &data.cancel_after {
            if data.batches >= *after {
                token.cancel();
            }
        }
        Ok(outcomes)
    }

    async fn has_unique_constraint(&mut self, table: &str, column: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        Ok(find_table(&mut data, table)?.unique.iter().any(|c| c == column))
    }

    async fn create_unique_constraint_if_absent(&mut self, table: &str, column: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.reject_unique {
            bail!("permission denied to create index on {}", table);
        }
        let t = find_table(&mut data, table)?;
        if t.unique.iter().any(|c| c == column) {
            return Ok(());
        }
        let idx = t.index_of(column)?;
        let mut seen = HashSet::new();
        for row in &t.rows {
            if let Some(key) = row[idx].to_text() {
                if !seen.insert(key.clone()) {
                    bail!("could not create unique index: Key ({})=({}) is duplicated", column, key);
                }
            }
        }
        t.unique.push(column.to_string());
        Ok(())
    }

    async fn max_key(&mut self, table: &str, column: &str) -> Result<Option<i64>> {
        let mut data = self.data.lock().unwrap();
        let t = find_table(&mut data, table)?;
        let idx = t.index_of(column)?;
        Ok(t.rows.iter().filter_map(|row| row[idx].as_i64()).max())
    }

    async fn count_equal(&mut self, table: &str, column: &str, value: &SqlValue) -> Result<i64> {
        let mut data = self.data.lock().unwrap();
        let t = find_table(&mut data, table)?;
        let idx = t.index_of(column)?;
        Ok(t.rows.iter().filter(|row| same(&row[idx], value)).count() as i64)
    }

    async fn delete_equal(&mut self, table: &str, column: &str, value: &SqlValue) -> Result<u64> {
        let mut data = self.data.lock().unwrap();
        let t = find_table(&mut data, table)?;
        let idx = t.index_of(column)?;
        let before = t.rows.len();
        t.rows.retain(|row| !same(&row[idx], value));
        Ok((before - t.rows.len()) as u64)
    }

    async fn key_stats(&mut self, table: &str, column: &str) -> Result<KeyStats> {
        let mut data = self.data.lock().unwrap();
        let t = find_table(&mut data, table)?;
        let idx = t.index_of(column)?;
        let keys: Vec<String> = t.rows.iter().filter_map(|row| row[idx].to_text()).collect();
        let distinct: HashSet<&String> = keys.iter().collect();
        Ok(KeyStats {
            rows: keys.len() as i64,
            distinct_keys: distinct.len() as i64,
        })
    }
}

// ---------------------------------------------------------------------------
// Connector, clock and harness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    pub remote: MemoryRemote,
    pub local: MemoryLocal,
    /// Remote connects that fail with a timeout before one succeeds.
    pub connect_failures: Arc<AtomicUsize>,
    pub connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn fail_connects(&self, times: usize) {
        self.connect_failures.store(times, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Remote = MemoryRemote;
    type Local = MemoryLocal;

    async fn connect_remote(&self) -> Result<MemoryRemote> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))
                .context("Failed to open remote session");
        }
        Ok(self.remote.clone())
    }

    async fn connect_local(&self) -> Result<MemoryLocal> {
        Ok(self.local.clone())
    }
}

/// Always reports the same instant; sleeps return at once and are recorded.
#[derive(Debug)]
pub struct FixedClock {
    now: NaiveDateTime,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl FixedClock {
    pub fn at(date: NaiveDate) -> Self {
        Self {
            now: date.and_hms_opt(10, 0, 0).unwrap(),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.now
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Driver options sized for tests: small batches and a bounded retry.
pub fn test_options() -> ReplicationOptions {
    ReplicationOptions {
        batch_size: 100,
        fetch_size: 40,
        invocation: "run".to_string(),
        retry: RetryPolicy {
            max_attempts: Some(4),
            max_elapsed: None,
            backoff: Backoff::Fixed(Duration::from_secs(30)),
        },
        ..ReplicationOptions::default()
    }
}

/// A connector, a state document in a temp dir and a clock fixed at 2024-01-05 10:00.
pub struct Harness {
    pub dir: TempDir,
    pub connector: MemoryConnector,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(state: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.ini"), state).unwrap();
        Self {
            dir,
            connector: MemoryConnector::default(),
            clock: Arc::new(FixedClock::at(date(2024, 1, 5))),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("state.ini")
    }

    pub fn store(&self) -> WatermarkStore {
        WatermarkStore::new(self.state_path())
    }

    pub fn state_text(&self) -> String {
        std::fs::read_to_string(self.state_path()).unwrap()
    }

    pub fn remote(&self) -> &MemoryRemote {
        &self.connector.remote
    }

    pub fn local(&self) -> &MemoryLocal {
        &self.connector.local
    }

    pub fn replicator(&self, options: ReplicationOptions) -> Replicator<MemoryConnector> {
        Replicator::new(
            self.connector.clone(),
            self.store(),
            options,
            self.clock.clone(),
        )
    }
}

/// Remote `T(id, name, amount)` with ids `from..=to`.
pub fn add_key_rows(remote: &MemoryRemote, table: &str, from: i64, to: i64) {
    for id in from..=to {
        remote.insert(
            table,
            vec![int(id), text(&format!("name-{}", id)), int(id * 10)],
        );
    }
}
