// ABOUTME: Run record lifecycle in the [run] section of the state document
// ABOUTME: RunGuard finalizes exactly once and marks abandoned runs as cancelled on drop

use super::state::{StateDocument, WatermarkStore, RUN_SECTION, TIMESTAMP_FORMAT};
use crate::retry::Clock;
use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "cancelled" | "canceled" => Ok(RunStatus::Cancelled),
            other => bail!("Unknown run status '{}'", other),
        }
    }
}

/// The `[run]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub status: Option<RunStatus>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub elapsed: Option<String>,
    pub args: Option<String>,
}

impl RunRecord {
    pub fn from_document(doc: &StateDocument) -> Self {
        let field = |key: &str| doc.get_non_empty(RUN_SECTION, key).map(str::to_string);
        Self {
            status: doc
                .get_non_empty(RUN_SECTION, "status")
                .and_then(|s| s.parse().ok()),
            started_at: field("started_at"),
            ended_at: field("ended_at"),
            elapsed: field("elapsed"),
            args: field("args"),
        }
    }
}

/// `HH:MM:SS`; hours keep counting past 24.
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Scoped owner of the run record.
///
/// [`begin`](Self::begin) writes `running`; [`finish`](Self::finish) writes the
/// terminal status. Dropping an unfinished guard writes `cancelled`, but only
/// while the document still says `running`.
pub struct RunGuard {
    store: WatermarkStore,
    clock: Arc<dyn Clock>,
    started: NaiveDateTime,
    finished: bool,
}

impl RunGuard {
    pub fn begin(store: WatermarkStore, clock: Arc<dyn Clock>, args: &str) -> Result<Self> {
        let started = clock.now();
        store.update(|doc| {
            doc.set(RUN_SECTION, "status", RunStatus::Running.as_str());
            doc.set(
                RUN_SECTION,
                "started_at",
                &started.format(TIMESTAMP_FORMAT).to_string(),
            );
            doc.set(RUN_SECTION, "ended_at", "");
            doc.set(RUN_SECTION, "elapsed", "");
            doc.set(RUN_SECTION, "args", args);
            Ok(())
        })?;
        tracing::debug!("Run started at {}", started.format(TIMESTAMP_FORMAT));

        Ok(Self {
            store,
            clock,
            started,
            finished: false,
        })
    }

    /// Records a run refused before it could start, such as one with an
    /// invalid configuration: `running` immediately followed by `error`.
    pub fn reject(store: WatermarkStore, clock: Arc<dyn Clock>, args: &str) -> Result<()> {
        Self::begin(store, clock, args)?.finish(RunStatus::Error)
    }

    pub fn finish(mut self, status: RunStatus) -> Result<()> {
        self.finished = true;
        self.write_terminal(status, false)
    }

    fn write_terminal(&self, status: RunStatus, only_if_running: bool) -> Result<()> {
        let ended = self.clock.now();
        let elapsed = format_elapsed((ended - self.started).num_seconds());
        self.store.update(|doc| {
            if only_if_running {
                let current = RunRecord::from_document(doc).status;
                if current.map_or(true, |s| s.is_terminal()) {
                    return Ok(());
                }
            }
            doc.set(RUN_SECTION, "status", status.as_str());
            doc.set(
                RUN_SECTION,
                "ended_at",
                &ended.format(TIMESTAMP_FORMAT).to_string(),
            );
            doc.set(RUN_SECTION, "elapsed", &elapsed);
            Ok(())
        })?;
        tracing::info!("Run finished with status {} after {}", status, elapsed);
        Ok(())
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.write_terminal(RunStatus::Cancelled, true) {
            tracing::error!("Failed to record cancelled run: {:#}", e);
        }
    }
}
