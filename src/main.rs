// ABOUTME: CLI entry point for table-replicator
// ABOUTME: Parses commands, sets up logging and signals, and routes to the replication driver

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use table_replicator::postgres::PgConnector;
use table_replicator::replication::{RunGuard, RunRecord, TableOutcome};
use table_replicator::retry::SystemClock;
use table_replicator::utils::sanitize_url;
use table_replicator::{Config, ReplicationOptions, Replicator, RunError, RunReport, WatermarkStore};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "table-replicator")]
#[command(about = "Incremental table replication from a remote source into local PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "replicator.toml")]
    config: PathBuf,
    /// Path to the replication state document (overrides replication.state_path)
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Append logs to this file instead of writing them to stderr
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,
    /// Remote source connection URL
    #[arg(long = "remote-url", env = "REMOTE_URL", global = true, hide_env_values = true)]
    remote_url: Option<String>,
    /// Local PostgreSQL connection URL
    #[arg(long = "local-url", env = "LOCAL_URL", global = true, hide_env_values = true)]
    local_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate every configured table incrementally
    Run {
        /// Replicate only these tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Option<Vec<String>>,
        /// Skip these tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        skip: Option<Vec<String>>,
        /// Do not delete local rows of a partition before copying it again
        #[arg(long)]
        keep_existing: bool,
        /// Rows per local transaction (overrides replication.batch_size)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Delete and copy again one partition of one table
    Reload {
        #[arg(long)]
        table: String,
        /// Partition date as yyyyMMdd
        #[arg(long)]
        partition: String,
        /// Do not delete local rows of the partition first
        #[arg(long)]
        keep_existing: bool,
    },
    /// Show the last run record and per-table watermarks
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, cli.log_file.as_deref())?;

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            if !matches!(cli.command, Commands::Status) {
                let state_path = cli
                    .state
                    .clone()
                    .unwrap_or_else(|| Config::default().replication.state_path);
                reject_run(WatermarkStore::new(state_path));
            }
            return Err(e);
        }
    };

    let store = WatermarkStore::new(config.replication.state_path.clone());

    match cli.command {
        Commands::Run {
            only,
            skip,
            keep_existing,
            batch_size,
        } => {
            if let Some(batch_size) = batch_size {
                config.replication.batch_size = batch_size;
            }
            validate_config(&config, &store)?;

            let mut options = ReplicationOptions::from_config(&config);
            options.only = only;
            options.skip = skip;
            options.keep_existing = keep_existing;
            options.invocation = invocation();

            let grace = Duration::from_secs(config.replication.shutdown_grace_secs);
            let replicator = build_replicator(config, store, options);
            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());

            let report = with_grace_period(&cancel, grace, replicator.run(&cancel)).await?;
            print_report(&report);
            finish(&report)
        }
        Commands::Reload {
            table,
            partition,
            keep_existing,
        } => {
            validate_config(&config, &store)?;

            let mut options = ReplicationOptions::from_config(&config);
            options.keep_existing = keep_existing;
            options.invocation = invocation();

            let grace = Duration::from_secs(config.replication.shutdown_grace_secs);
            let replicator = build_replicator(config, store, options);
            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());

            let report = with_grace_period(
                &cancel,
                grace,
                replicator.reload_partition(&table, &partition, &cancel),
            )
            .await?;
            print_report(&report);
            finish(&report)
        }
        Commands::Status => print_status(&store),
    }
}

/// Config file plus command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let config_required = std::env::args().any(|a| a == "--config" || a.starts_with("--config="));
    let mut config = Config::load(&cli.config, config_required)?;
    if let Some(url) = cli.remote_url.clone() {
        config.remote.url = Some(url);
    }
    if let Some(url) = cli.local_url.clone() {
        config.local.url = Some(url);
    }
    if let Some(state) = cli.state.clone() {
        config.replication.state_path = state;
    }
    Ok(config)
}

fn validate_config(config: &Config, store: &WatermarkStore) -> Result<()> {
    if let Err(e) = config.validate() {
        reject_run(store.clone());
        return Err(RunError::Configuration(format!("{:#}", e)).into());
    }
    Ok(())
}

/// Leaves an `error` run record behind for a run that never started.
fn reject_run(store: WatermarkStore) {
    if let Err(e) = RunGuard::reject(store, Arc::new(SystemClock), &invocation()) {
        tracing::error!("Failed to record rejected run: {:#}", e);
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn build_replicator(
    config: Config,
    store: WatermarkStore,
    options: ReplicationOptions,
) -> Replicator<PgConnector> {
    Replicator::new(
        PgConnector::new(config),
        store,
        options,
        Arc::new(SystemClock),
    )
}

/// Command line as recorded in the run record, with credentials removed.
fn invocation() -> String {
    std::env::args()
        .skip(1)
        .map(|arg| if arg.contains("://") { sanitize_url(&arg) } else { arg })
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Received shutdown signal; stopping after the current batch");
        cancel.cancel();
    });
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to listen for SIGTERM: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    ctrl_c().await;
}

/// Let the run stop on its own after cancellation, up to `grace`. Past that the
/// run is dropped and its guard records `cancelled`.
async fn with_grace_period<F>(cancel: &CancellationToken, grace: Duration, run: F) -> Result<RunReport>
where
    F: std::future::Future<Output = Result<RunReport>>,
{
    tokio::select! {
        result = run => result,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!("Run did not stop within {:?} of the shutdown signal; abandoning it", grace);
            Err(RunError::Cancelled.into())
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!("========================================");
    println!("Run {}", report.status);
    println!("========================================");
    for table in &report.tables {
        let outcome = match &table.outcome {
            TableOutcome::Synced => "synced".to_string(),
            TableOutcome::UpToDate => "up to date".to_string(),
            TableOutcome::Skipped(reason) => format!("skipped ({})", reason),
        };
        let watermark = table
            .watermark
            .map(|w| w.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<32} {:<20} {:>10} rows  {}",
            table.table, outcome, table.rows_copied, watermark
        );
    }
    for failure in &report.failures {
        println!("  {:<32} FAILED: {}", failure.table, failure.message);
    }
    for dup in &report.duplicates {
        println!(
            "  {:<32} {} duplicate keys ({} rows, {} distinct)",
            dup.table,
            dup.rows - dup.distinct_keys,
            dup.rows,
            dup.distinct_keys
        );
    }
    println!("  Rows copied: {}", report.rows_copied());
    println!("  Attempts: {}", report.attempts);
}

fn finish(report: &RunReport) -> Result<()> {
    if report.is_success() {
        Ok(())
    } else {
        bail!("Run finished with status {}", report.status)
    }
}

fn print_status(store: &WatermarkStore) -> Result<()> {
    let doc = store.load()?;
    let record = RunRecord::from_document(&doc);
    let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    println!("State: {}", store.path().display());
    println!(
        "Last run: {}",
        record
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Started: {}", field(&record.started_at));
    println!("  Ended:   {}", field(&record.ended_at));
    println!("  Elapsed: {}", field(&record.elapsed));
    println!("  Args:    {}", field(&record.args));
    println!();

    let tables = store.tables()?;
    if tables.is_empty() {
        println!("No tables configured.");
        return Ok(());
    }
    println!("Tables:");
    for table in tables {
        let watermark = table
            .watermark
            .map(|w| w.to_string())
            .unwrap_or_else(|| "not started".to_string());
        let rows = table
            .rows
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<32} {:<28} synced {}  last rows {}",
            table.name,
            watermark,
            field(&table.synced_at),
            rows
        );
    }
    Ok(())
}
