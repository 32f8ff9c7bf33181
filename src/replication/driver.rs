// ABOUTME: Replication driver - runs the per-table pipeline with retry, cancellation and finalization
// ABOUTME: Generic over a Connector so the same engine runs against any pair of adapters

use super::exclusion::ExclusionRule;
use super::extract::{self, CursorStrategy, PendingPartition};
use super::run::{RunGuard, RunStatus};
use super::schema;
use super::state::{TableState, Watermark, WatermarkStore};
use super::writer::{self, ConflictPolicy, InsertPlan};
use crate::config::Config;
use crate::error::{classify, is_cancelled, is_state_failure, ErrorClass, RunError};
use crate::filters::TableSelection;
use crate::local::LocalStore;
use crate::retry::{Clock, RetryPolicy};
use crate::source::{RemoteColumn, RemoteSource, RowFilter, RowOrder, RowQuery, SourceRow};
use crate::value::{parse_date, SqlValue};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Opens one remote and one local session per attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    type Remote: RemoteSource;
    type Local: LocalStore;

    async fn connect_remote(&self) -> Result<Self::Remote>;
    async fn connect_local(&self) -> Result<Self::Local>;
}

#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Rows per local transaction.
    pub batch_size: usize,
    /// Rows per remote cursor round-trip.
    pub fetch_size: usize,
    pub key_column: String,
    pub partition_column: String,
    /// Skip the delete that precedes re-inserting a partition.
    pub keep_existing: bool,
    pub only: Option<Vec<String>>,
    pub skip: Option<Vec<String>>,
    /// Recorded as `args` in the run record.
    pub invocation: String,
    pub retry: RetryPolicy,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            fetch_size: 2000,
            key_column: "id".to_string(),
            partition_column: "DT_CARGA_C".to_string(),
            keep_existing: false,
            only: None,
            skip: None,
            invocation: String::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ReplicationOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.replication.batch_size,
            fetch_size: config.remote.fetch_size,
            key_column: config.replication.key_column.clone(),
            partition_column: config.replication.partition_column.clone(),
            retry: config.retry_policy(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOutcome {
    Synced,
    UpToDate,
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct TableReport {
    pub table: String,
    pub local_table: Option<String>,
    pub outcome: TableOutcome,
    pub rows_copied: u64,
    /// Rows actually inserted; lower than `rows_copied` when conflicts were suppressed.
    pub rows_inserted: u64,
    pub units_committed: u64,
    pub ddl_applied: usize,
    pub watermark: Option<Watermark>,
    /// Local key column, when the table has one.
    pub key_column: Option<String>,
}

impl TableReport {
    fn new(table: &str, outcome: TableOutcome) -> Self {
        Self {
            table: table.to_string(),
            local_table: None,
            outcome,
            rows_copied: 0,
            rows_inserted: 0,
            units_committed: 0,
            ddl_applied: 0,
            watermark: None,
            key_column: None,
        }
    }

    fn skipped(table: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::warn!("Skipping {}: {}", table, reason);
        Self::new(table, TableOutcome::Skipped(reason))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub table: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateReport {
    pub table: String,
    pub rows: i64,
    pub distinct_keys: i64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub attempts: u32,
    pub tables: Vec<TableReport>,
    pub failures: Vec<TableFailure>,
    pub duplicates: Vec<DuplicateReport>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            status: RunStatus::Running,
            attempts: 0,
            tables: Vec::new(),
            failures: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn rows_copied(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_copied).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table.eq_ignore_ascii_case(name))
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

enum Work {
    Sync(Vec<TableState>),
    Reload {
        table: TableState,
        partition: NaiveDate,
    },
}

/// Everything fixed for a table once its schema has been reconciled.
struct TableJob<'s> {
    state: &'s TableState,
    remote_table: String,
    columns: Vec<RemoteColumn>,
    exclusion: Option<ExclusionRule>,
    plan: InsertPlan,
    /// Local name of the cursor column.
    cursor_local: String,
}

pub struct Replicator<C: Connector> {
    connector: C,
    store: WatermarkStore,
    options: ReplicationOptions,
    clock: Arc<dyn Clock>,
}

impl<C: Connector> Replicator<C> {
    pub fn new(
        connector: C,
        store: WatermarkStore,
        options: ReplicationOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connector,
            store,
            options,
            clock,
        }
    }

    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }

    /// Replicate every selected table once.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let guard = RunGuard::begin(self.store.clone(), self.clock.clone(), &self.options.invocation)?;
        match self.plan_sync() {
            Ok(work) => self.execute(guard, work, cancel).await,
            Err(e) => Self::abort(guard, e),
        }
    }

    /// Delete and re-copy one partition of one table. The watermark is left as is.
    pub async fn reload_partition(
        &self,
        table: &str,
        partition: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let guard = RunGuard::begin(self.store.clone(), self.clock.clone(), &self.options.invocation)?;
        match self.plan_reload(table, partition) {
            Ok(work) => self.execute(guard, work, cancel).await,
            Err(e) => Self::abort(guard, e),
        }
    }

    fn abort(guard: RunGuard, err: anyhow::Error) -> Result<RunReport> {
        tracing::error!("{:#}", err);
        if let Err(finish_err) = guard.finish(RunStatus::Error) {
            tracing::error!("{:#}", finish_err);
        }
        Err(err)
    }

    fn plan_sync(&self) -> Result<Work> {
        let selection = TableSelection::new(self.options.only.clone(), self.options.skip.clone())?;
        let tables = self.store.tables()?;
        let tables = selection.apply(tables, |t: &TableState| t.name.as_str());
        if tables.is_empty() {
            tracing::warn!(
                "No tables selected; add [table.NAME] sections to {}",
                self.store.path().display()
            );
        }
        Ok(Work::Sync(tables))
    }

    fn plan_reload(&self, table: &str, partition: &str) -> Result<Work> {
        let state = self.store.table(table)?.ok_or_else(|| {
            RunError::Configuration(format!(
                "No [table.{}] section in {}",
                table,
                self.store.path().display()
            ))
        })?;
        let date = parse_date(partition).ok_or_else(|| {
            RunError::Configuration(format!(
                "Invalid partition '{}', expected yyyyMMdd",
                partition
            ))
        })?;
        Ok(Work::Reload {
            table: state,
            partition: date,
        })
    }

    fn cutoff(&self) -> NaiveDate {
        let today = self.clock.now().date();
        today.pred_opt().unwrap_or(today)
    }

    async fn execute(&self, guard: RunGuard, work: Work, cancel: &CancellationToken) -> Result<RunReport> {
        let first_attempt = self.clock.now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.attempt(&work, cancel).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    if report.status != RunStatus::Cancelled {
                        report.status = if report.failures.is_empty() {
                            RunStatus::Success
                        } else {
                            RunStatus::Error
                        };
                    }
                    guard.finish(report.status)?;
                    log_summary(&report);
                    return Ok(report);
                }
                Err(e) => e,
            };

            let elapsed = (self.clock.now() - first_attempt)
                .to_std()
                .unwrap_or_default();
            if classify(&err) == ErrorClass::Transient
                && self.options.retry.should_retry(attempt, elapsed)
            {
                let delay = self.options.retry.delay_for(attempt);
                tracing::warn!(
                    "Attempt {} failed: {:#}. Reconnecting in {:?}",
                    attempt,
                    err,
                    delay
                );
                tokio::select! {
                    _ = self.clock.sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        tracing::info!("Cancelled while waiting to reconnect");
                        guard.finish(RunStatus::Cancelled)?;
                        let mut report = RunReport::new();
                        report.status = RunStatus::Cancelled;
                        report.attempts = attempt;
                        return Ok(report);
                    }
                }
                continue;
            }

            tracing::error!("Replication failed after {} attempt(s): {:#}", attempt, err);
            if let Err(finish_err) = guard.finish(RunStatus::Error) {
                tracing::error!("{:#}", finish_err);
            }
            return Err(err);
        }
    }

    async fn attempt(&self, work: &Work, cancel: &CancellationToken) -> Result<RunReport> {
        let mut remote = self
            .connector
            .connect_remote()
            .await
            .context("Failed to connect to remote source")?;
        let mut local = self
            .connector
            .connect_local()
            .await
            .context("Failed to connect to local store")?;

        let mut report = RunReport::new();

        match work {
            Work::Sync(tables) => {
                let remote_tables = remote
                    .list_tables()
                    .await
                    .context("Failed to list remote tables")?;

                for state in tables {
                    if cancel.is_cancelled() {
                        tracing::info!("Cancellation requested; stopping before {}", state.name);
                        report.status = RunStatus::Cancelled;
                        break;
                    }
                    let Some(remote_table) = remote_tables
                        .iter()
                        .find(|t| t.eq_ignore_ascii_case(&state.name))
                    else {
                        report
                            .tables
                            .push(TableReport::skipped(&state.name, "table not present remotely"));
                        continue;
                    };

                    tracing::info!("Replicating {}", state.name);
                    let result = self
                        .sync_table(&mut remote, &mut local, state, remote_table, cancel)
                        .await;
                    if record_table_result(&mut report, &state.name, result)? {
                        break;
                    }
                }

                if report.status != RunStatus::Cancelled {
                    validate_keys(&mut local, &mut report).await;
                }
            }
            Work::Reload { table, partition } => {
                let result = self
                    .reload_table(&mut remote, &mut local, table, *partition, cancel)
                    .await;
                record_table_result(&mut report, &table.name, result)?;
            }
        }

        Ok(report)
    }

    async fn sync_table(
        &self,
        remote: &mut C::Remote,
        local: &mut C::Local,
        state: &TableState,
        remote_table: &str,
        cancel: &CancellationToken,
    ) -> Result<TableReport> {
        let cutoff = self.cutoff();
        if let Some(Watermark::Partition(last)) = state.watermark {
            if last >= cutoff {
                tracing::info!(
                    "{} is up to date through partition {}",
                    state.name,
                    last.format("%Y%m%d")
                );
                let mut report = TableReport::new(&state.name, TableOutcome::UpToDate);
                report.watermark = state.watermark;
                return Ok(report);
            }
        }

        let remote_columns = remote
            .list_columns(remote_table)
            .await
            .with_context(|| format!("Failed to describe remote table {}", remote_table))?;
        if remote_columns.is_empty() {
            return Ok(TableReport::skipped(&state.name, "remote table has no columns"));
        }

        let Some(strategy) = extract::choose_strategy(
            state,
            &remote_columns,
            &self.options.key_column,
            &self.options.partition_column,
        )?
        else {
            return Ok(TableReport::skipped(
                &state.name,
                format!(
                    "neither a {} nor a {} column",
                    self.options.key_column, self.options.partition_column
                ),
            ));
        };

        let Some((job, mut report)) = self
            .prepare_table(local, state, remote_table, &remote_columns, &strategy)
            .await?
        else {
            return Ok(TableReport::skipped(&state.name, "no usable columns"));
        };

        match &strategy {
            CursorStrategy::Key { column, integer } => {
                self.copy_by_key(remote, local, &job, column, *integer, &mut report, cancel)
                    .await?
            }
            CursorStrategy::Partition { column } => {
                self.copy_by_partition(remote, local, &job, column, cutoff, &mut report, cancel)
                    .await?
            }
        }
        Ok(report)
    }

    async fn prepare_table<'s>(
        &self,
        local: &mut C::Local,
        state: &'s TableState,
        remote_table: &str,
        remote_columns: &[RemoteColumn],
        strategy: &CursorStrategy,
    ) -> Result<Option<(TableJob<'s>, TableReport)>> {
        let projected = extract::project_columns(
            &state.name,
            remote_columns,
            state.columns.as_deref(),
            strategy.column(),
        );
        let exclusion = state
            .exclude
            .as_deref()
            .map(|text| ExclusionRule::parse(text).and_then(|rule| rule.resolve(remote_columns)))
            .transpose()?;

        let reconciled = schema::reconcile(local, &state.name, &projected).await?;
        if reconciled.columns.is_empty() {
            return Ok(None);
        }
        let Some(cursor) = reconciled.mapping_for(strategy.column()) else {
            bail!(
                "Cursor column {} of {} has no usable local column",
                strategy.column(),
                state.name
            );
        };
        let cursor_local = cursor.local.clone();

        let columns: Vec<RemoteColumn> = projected
            .into_iter()
            .filter(|c| reconciled.mapping_for(&c.name).is_some())
            .collect();

        let key_local = reconciled
            .mapping_for(&self.options.key_column)
            .map(|m| m.local.clone());
        let policy = match &key_local {
            Some(key) => writer::choose_conflict_policy(local, &reconciled.table, key).await?,
            None => ConflictPolicy::Plain,
        };
        let plan = InsertPlan::new(reconciled.table.clone(), reconciled.columns.clone(), policy)?;
        tracing::info!(
            "{} -> {}: {} columns, {:?}, {:?} values",
            state.name,
            plan.table,
            plan.columns.len(),
            plan.policy,
            plan.mode
        );

        let mut report = TableReport::new(&state.name, TableOutcome::UpToDate);
        report.local_table = Some(reconciled.table.clone());
        report.ddl_applied = reconciled.ddl_applied;
        report.key_column = key_local;
        report.watermark = state.watermark;

        Ok(Some((
            TableJob {
                state,
                remote_table: remote_table.to_string(),
                columns,
                exclusion,
                plan,
                cursor_local,
            },
            report,
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_by_key(
        &self,
        remote: &mut C::Remote,
        local: &mut C::Local,
        job: &TableJob<'_>,
        column: &str,
        integer: bool,
        report: &mut TableReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let since = match job.state.watermark {
            Some(Watermark::Key(last)) => Some(last),
            _ => local
                .max_key(&job.plan.table, &job.cursor_local)
                .await
                .with_context(|| format!("Failed to read local max {} of {}", column, job.plan.table))?,
        };

        let filter = match since {
            Some(after) => RowFilter::KeyAfter {
                column: column.to_string(),
                after,
                cast_to_bigint: !integer,
            },
            None => RowFilter::All,
        };
        let order = RowOrder {
            column: column.to_string(),
            cast_to_bigint: !integer,
        };
        let query = self.query(job, filter, Some(order));
        let position = since.map_or_else(|| "the beginning".to_string(), |id| format!("{} {}", column, id));
        log_remote_count(remote, &query, &format!("{} after {}", job.state.name, position)).await;

        let rows = self
            .stream_rows(remote, local, job, &query, Some(column), report, cancel)
            .await?;
        if rows == 0 {
            tracing::info!("{}: no new rows after {}", job.state.name, position);
        } else {
            report.outcome = TableOutcome::Synced;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_by_partition(
        &self,
        remote: &mut C::Remote,
        local: &mut C::Local,
        job: &TableJob<'_>,
        column: &str,
        cutoff: NaiveDate,
        report: &mut TableReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let after = match job.state.watermark {
            Some(Watermark::Partition(last)) => Some(last),
            _ => None,
        };
        let values = remote
            .distinct_values(&job.remote_table, column)
            .await
            .with_context(|| format!("Failed to list partitions of {}", job.remote_table))?;
        let pending = extract::pending_partitions(values, after, cutoff);

        let (Some(first), Some(last)) = (pending.first(), pending.last()) else {
            tracing::info!(
                "{}: no new partitions through {}",
                job.state.name,
                cutoff.format("%Y%m%d")
            );
            return Ok(());
        };
        tracing::info!(
            "{}: {} partition(s) to copy, {} through {}",
            job.state.name,
            pending.len(),
            first.raw,
            last.raw
        );

        for partition in &pending {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled.into());
            }
            let rows = self
                .copy_partition(remote, local, job, column, partition, report, cancel)
                .await?;
            let watermark = Watermark::Partition(partition.date);
            if self
                .store
                .advance_watermark(&job.state.name, watermark, rows, self.clock.now())?
            {
                report.watermark = Some(watermark);
            }
            report.outcome = TableOutcome::Synced;
            tracing::info!(
                "{}: partition {} committed ({} rows)",
                job.state.name,
                partition.raw,
                rows
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_partition(
        &self,
        remote: &mut C::Remote,
        local: &mut C::Local,
        job: &TableJob<'_>,
        column: &str,
        partition: &PendingPartition,
        report: &mut TableReport,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let value = SqlValue::Text(partition.raw.clone());
        if !self.options.keep_existing {
            let existing = local
                .count_equal(&job.plan.table, &job.cursor_local, &value)
                .await
                .with_context(|| format!("Failed to count partition {} of {}", partition.raw, job.plan.table))?;
            if existing > 0 {
                let deleted = local
                    .delete_equal(&job.plan.table, &job.cursor_local, &value)
                    .await
                    .with_context(|| {
                        format!("Failed to delete partition {} of {}", partition.raw, job.plan.table)
                    })?;
                tracing::info!(
                    "{}: deleted {} existing rows of partition {}",
                    job.plan.table,
                    deleted,
                    partition.raw
                );
            }
        }

        let filter = RowFilter::PartitionEquals {
            column: column.to_string(),
            value: partition.raw.clone(),
        };
        let query = self.query(job, filter, None);
        log_remote_count(
            remote,
            &query,
            &format!("{} partition {}", job.state.name, partition.raw),
        )
        .await;

        self.stream_rows(remote, local, job, &query, None, report, cancel)
            .await
    }

    async fn reload_table(
        &self,
        remote: &mut C::Remote,
        local: &mut C::Local,
        state: &TableState,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<TableReport> {
        let remote_tables = remote
            .list_tables()
            .await
            .context("Failed to list remote tables")?;
        let Some(remote_table) = remote_tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(&state.name))
        else {
            bail!("{} does not exist remotely", state.name);
        };

        let remote_columns = remote
            .list_columns(remote_table)
            .await
            .with_context(|| format!("Failed to describe remote table {}", remote_table))?;
        let Some(column) = remote_columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&self.options.partition_column))
            .map(|c| c.name.clone())
        else {
            bail!(
                "{} has no {} column to reload by",
                state.name,
                self.options.partition_column
            );
        };
        let strategy = CursorStrategy::Partition {
            column: column.clone(),
        };

        let Some((job, mut report)) = self
            .prepare_table(local, state, remote_table, &remote_columns, &strategy)
            .await?
        else {
            bail!("{} has no usable columns", state.name);
        };

        let values = remote
            .distinct_values(remote_table, &column)
            .await
            .with_context(|| format!("Failed to list partitions of {}", remote_table))?;
        let Some(raw) = values
            .into_iter()
            .find(|v| parse_date(v) == Some(date))
        else {
            tracing::warn!(
                "{} has no remote partition {}; nothing reloaded",
                state.name,
                date.format("%Y%m%d")
            );
            return Ok(report);
        };

        let partition = PendingPartition { date, raw };
        let rows = self
            .copy_partition(remote, local, &job, &column, &partition, &mut report, cancel)
            .await?;
        report.outcome = TableOutcome::Synced;
        tracing::info!(
            "{}: reloaded partition {} ({} rows); watermark unchanged",
            state.name,
            partition.raw,
            rows
        );
        Ok(report)
    }

    fn query(&self, job: &TableJob<'_>, filter: RowFilter, order_by: Option<RowOrder>) -> RowQuery {
        RowQuery {
            table: job.remote_table.clone(),
            columns: job.columns.clone(),
            filter,
            exclusion: job.exclusion.clone(),
            order_by,
            fetch_size: self.options.fetch_size,
        }
    }

    /// Stream the query into batches. Returns the number of rows committed.
    #[allow(clippy::too_many_arguments)]
    async fn stream_rows(
        &self,
        remote: &mut C::Remote,
        local: &mut C::Local,
        job: &TableJob<'_>,
        query: &RowQuery,
        key: Option<&str>,
        report: &mut TableReport,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut cursor = remote
            .open_cursor(query)
            .await
            .with_context(|| format!("Failed to read {}", query.table))?;
        let mut buffer: Vec<SourceRow> = Vec::with_capacity(self.options.batch_size);
        let mut committed = 0;

        while let Some(chunk) = cursor.next_chunk().await? {
            for row in chunk {
                buffer.push(row);
                if buffer.len() >= self.options.batch_size {
                    committed += self
                        .commit_batch(local, job, &mut buffer, key, report, cancel)
                        .await?;
                }
            }
        }
        if !buffer.is_empty() {
            committed += self
                .commit_batch(local, job, &mut buffer, key, report, cancel)
                .await?;
        }
        Ok(committed)
    }

    async fn commit_batch(
        &self,
        local: &mut C::Local,
        job: &TableJob<'_>,
        buffer: &mut Vec<SourceRow>,
        key: Option<&str>,
        report: &mut TableReport,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled.into());
        }

        let outcomes = local
            .write_batch(&job.plan, buffer)
            .await
            .with_context(|| format!("Failed to write batch into {}", job.plan.table))?;
        let rows = buffer.len() as u64;
        let inserted: u64 = outcomes.iter().sum();
        report.rows_copied += rows;
        report.rows_inserted += inserted;
        report.units_committed += 1;

        if let Some(key) = key {
            match buffer
                .iter()
                .filter_map(|row| row.get(key).and_then(SqlValue::as_i64))
                .max()
            {
                Some(last) => {
                    let watermark = Watermark::Key(last);
                    if self.store.advance_watermark(
                        &job.state.name,
                        watermark,
                        rows,
                        self.clock.now(),
                    )? {
                        report.watermark = Some(watermark);
                    }
                }
                None => tracing::warn!(
                    "{}: batch has no integer {} values; watermark not advanced",
                    job.state.name,
                    key
                ),
            }
        }

        tracing::info!(
            "{}: {} rows copied ({} inserted in this batch){}",
            job.state.name,
            report.rows_copied,
            inserted,
            report
                .watermark
                .map(|w| format!(", {}", w))
                .unwrap_or_default()
        );
        buffer.clear();
        Ok(rows)
    }
}

/// Record one table's outcome. Returns `Ok(true)` when the run must stop.
///
/// Transient and state-persistence errors abort the attempt; anything else
/// is isolated to the table.
fn record_table_result(report: &mut RunReport, table: &str, result: Result<TableReport>) -> Result<bool> {
    match result {
        Ok(table_report) => {
            report.tables.push(table_report);
            Ok(false)
        }
        Err(e) if is_cancelled(&e) => {
            tracing::info!("Cancelled while replicating {}", table);
            report.status = RunStatus::Cancelled;
            Ok(true)
        }
        Err(e) if is_state_failure(&e) => Err(e),
        Err(e) if classify(&e) == ErrorClass::Transient => {
            Err(e.context(format!("Session lost while replicating {}", table)))
        }
        Err(e) => {
            tracing::error!("Failed to replicate {}: {:#}", table, e);
            report.failures.push(TableFailure {
                table: table.to_string(),
                message: format!("{:#}", e),
            });
            Ok(false)
        }
    }
}

async fn log_remote_count<R: RemoteSource + ?Sized>(remote: &mut R, query: &RowQuery, what: &str) {
    match remote.count_matching(query).await {
        Ok(count) => tracing::info!("{}: {} remote rows to copy", what, count),
        Err(e) => tracing::warn!("{}: could not count remote rows: {:#}", what, e),
    }
}

/// Count rows against distinct keys for every table processed with a key column.
async fn validate_keys<L: LocalStore + ?Sized>(local: &mut L, report: &mut RunReport) {
    for table in &report.tables {
        if matches!(table.outcome, TableOutcome::Skipped(_)) {
            continue;
        }
        let (Some(local_table), Some(key)) = (&table.local_table, &table.key_column) else {
            continue;
        };
        match local.key_stats(local_table, key).await {
            Ok(stats) if stats.duplicates() > 0 => {
                tracing::warn!(
                    "{} has {} duplicate {} values ({} rows, {} distinct)",
                    local_table,
                    stats.duplicates(),
                    key,
                    stats.rows,
                    stats.distinct_keys
                );
                report.duplicates.push(DuplicateReport {
                    table: table.table.clone(),
                    rows: stats.rows,
                    distinct_keys: stats.distinct_keys,
                });
            }
            Ok(_) => tracing::debug!("{}: no duplicate {} values", local_table, key),
            Err(e) => tracing::warn!("Could not validate keys of {}: {:#}", local_table, e),
        }
    }
}

fn log_summary(report: &RunReport) {
    let synced = report
        .tables
        .iter()
        .filter(|t| t.outcome == TableOutcome::Synced)
        .count();
    tracing::info!(
        "Run {}: {} table(s) synced, {} row(s) copied, {} failure(s), {} attempt(s)",
        report.status,
        synced,
        report.rows_copied(),
        report.failures.len(),
        report.attempts
    );
    for failure in &report.failures {
        tracing::error!("  {}: {}", failure.table, failure.message);
    }
}
