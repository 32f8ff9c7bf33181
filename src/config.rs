// ABOUTME: TOML configuration for endpoints, replication tuning and retry policy
// ABOUTME: Loaded once in main and passed explicitly into the connector and driver

use crate::retry::{Backoff, RetryPolicy};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Remote tabular source (read-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Connection URL. `--remote-url` / `REMOTE_URL` override it.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_schema")]
    pub schema: String,

    /// Rows per server-side cursor round-trip.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// Upper bound on any single remote round-trip.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Accept self-signed or otherwise unverifiable server certificates.
    #[serde(default)]
    pub allow_self_signed_certs: bool,
}

/// Local PostgreSQL store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub allow_self_signed_certs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Rows per local transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_key_column")]
    pub key_column: String,

    #[serde(default = "default_partition_column")]
    pub partition_column: String,

    /// How long a cancelled run may keep going before it is abandoned.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: u64,

    /// Double the delay after each failure, up to `max_delay_secs`.
    #[serde(default)]
    pub exponential: bool,

    #[serde(default = "default_retry_max_delay_secs")]
    pub max_delay_secs: u64,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub max_elapsed_secs: Option<u64>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_fetch_size() -> usize {
    2000
}

fn default_session_timeout_secs() -> u64 {
    7200
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_state_path() -> PathBuf {
    PathBuf::from("replication-state.ini")
}

fn default_batch_size() -> usize {
    500
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_partition_column() -> String {
    "DT_CARGA_C".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_retry_max_delay_secs() -> u64 {
    600
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            schema: default_schema(),
            fetch_size: default_fetch_size(),
            session_timeout_secs: default_session_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            allow_self_signed_certs: false,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            url: None,
            schema: default_schema(),
            connect_timeout_secs: default_connect_timeout_secs(),
            allow_self_signed_certs: false,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            batch_size: default_batch_size(),
            key_column: default_key_column(),
            partition_column: default_partition_column(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_retry_delay_secs(),
            exponential: false,
            max_delay_secs: default_retry_max_delay_secs(),
            max_attempts: None,
            max_elapsed_secs: None,
        }
    }
}

impl Config {
    /// Load a config file. A missing file is only tolerated when `required` is false.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        if !path.exists() && !required {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.fetch_size == 0 {
            bail!("remote.fetch_size must be greater than 0");
        }
        if self.remote.fetch_size > i32::MAX as usize {
            bail!("remote.fetch_size must fit in a 32-bit integer");
        }
        if self.remote.session_timeout_secs == 0 {
            bail!("remote.session_timeout_secs must be greater than 0");
        }
        if self.replication.batch_size == 0 {
            bail!("replication.batch_size must be greater than 0");
        }
        if self.replication.key_column.trim().is_empty() {
            bail!("replication.key_column cannot be empty");
        }
        if self.replication.partition_column.trim().is_empty() {
            bail!("replication.partition_column cannot be empty");
        }
        if self.retry.max_attempts == Some(0) {
            bail!("retry.max_attempts must be at least 1 when set");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry.delay_secs);
        let backoff = if self.retry.exponential {
            Backoff::Exponential {
                initial: delay,
                max: Duration::from_secs(self.retry.max_delay_secs.max(self.retry.delay_secs)),
            }
        } else {
            Backoff::Fixed(delay)
        };
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            max_elapsed: self.retry.max_elapsed_secs.map(Duration::from_secs),
            backoff,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.session_timeout_secs)
    }
}
