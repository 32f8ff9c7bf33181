// ABOUTME: PostgreSQL-wire session setup shared by the remote and local adapters
// ABOUTME: Provides PgConnector, which opens one session per endpoint per attempt

use crate::config::Config;
use crate::error::RunError;
use crate::local::PgLocalStore;
use crate::replication::Connector;
use crate::source::PgRemoteSource;
use crate::utils::sanitize_url;
use anyhow::{Context, Result};
use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

/// Session options for one endpoint.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub allow_self_signed_certs: bool,
}

/// Open a session and spawn its connection task.
///
/// TLS is negotiated according to the URL's `sslmode`; the connector only
/// decides whether unverifiable certificates are accepted.
pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Client> {
    let mut config: tokio_postgres::Config = url.parse().map_err(|e| {
        RunError::Configuration(format!(
            "Invalid connection string {}: {}",
            sanitize_url(url),
            e
        ))
    })?;
    config
        .application_name("table-replicator")
        .connect_timeout(options.connect_timeout)
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(60));

    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(options.allow_self_signed_certs)
        .build()
        .context("Failed to build TLS connector")?;

    let (client, connection) = config
        .connect(MakeTlsConnector::new(tls))
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!("PostgreSQL connection closed with error: {}", e);
        }
    });

    Ok(client)
}

/// Production connector for PostgreSQL-wire endpoints.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: Config,
}

impl PgConnector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

fn require_url<'a>(url: &'a Option<String>, which: &str) -> Result<&'a str> {
    url.as_deref().ok_or_else(|| {
        RunError::Configuration(format!(
            "No {which} connection URL; pass --{which}-url, set {}_URL, or configure [{which}] url",
            which.to_uppercase()
        ))
        .into()
    })
}

#[async_trait]
impl Connector for PgConnector {
    type Remote = PgRemoteSource;
    type Local = PgLocalStore;

    async fn connect_remote(&self) -> Result<PgRemoteSource> {
        let remote = &self.config.remote;
        let url = require_url(&remote.url, "remote")?;
        tracing::info!("Connecting to remote source {}", sanitize_url(url));
        let options = ConnectOptions {
            connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
            allow_self_signed_certs: remote.allow_self_signed_certs,
        };
        let client = connect(url, &options).await?;
        Ok(PgRemoteSource::new(
            client,
            remote.schema.clone(),
            self.config.session_timeout(),
        ))
    }

    async fn connect_local(&self) -> Result<PgLocalStore> {
        let local = &self.config.local;
        let url = require_url(&local.url, "local")?;
        tracing::info!("Connecting to local store {}", sanitize_url(url));
        let options = ConnectOptions {
            connect_timeout: Duration::from_secs(local.connect_timeout_secs),
            allow_self_signed_certs: local.allow_self_signed_certs,
        };
        let client = connect(url, &options).await?;
        Ok(PgLocalStore::new(client, local.schema.clone()))
    }
}
