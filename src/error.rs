// ABOUTME: Typed run errors and transient/fatal classification of anyhow error chains
// ABOUTME: The driver retries whole attempts only for errors classified as transient

use std::io;
use thiserror::Error;

/// Errors the driver needs to recognise by kind rather than by message.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to persist replication state: {0}")]
    StatePersistence(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Session-level failure; reconnecting and retrying may succeed.
    Transient,
    Fatal,
}

/// Matched against the root cause only; context lines carry table and column names.
const TRANSIENT_PATTERNS: [&str; 5] = [
    "connection timed out",
    "connection reset",
    "connection closed",
    "broken pipe",
    "server closed the connection",
];

/// Classify an error by walking its whole context chain.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if cause.downcast_ref::<RunError>().is_some() {
            return ErrorClass::Fatal;
        }
        if let Some(pg) = cause.downcast_ref::<tokio_postgres::Error>() {
            if pg.is_closed() {
                return ErrorClass::Transient;
            }
        }
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return ErrorClass::Transient;
            }
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return ErrorClass::Transient;
        }
    }

    let message = err.root_cause().to_string().to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| message.contains(p)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<RunError>(), Some(RunError::Cancelled)))
}

pub fn is_state_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<RunError>(),
            Some(RunError::StatePersistence(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_io_timeouts_are_transient() {
        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::TimedOut, "read"))
            .context("Failed to fetch rows from remote");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_message_patterns_are_transient() {
        let err = anyhow::anyhow!("Connection timed out: connect");
        assert_eq!(classify(&err), ErrorClass::Transient);
        let err = anyhow::anyhow!("server closed the connection unexpectedly");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_timeout_in_a_column_name_is_fatal() {
        let err = anyhow::anyhow!("column \"timeout_secs\" of relation \"t\" does not exist")
            .context("Failed to insert batch into t");
        assert_eq!(classify(&err), ErrorClass::Fatal);
        let err = anyhow::anyhow!("relation \"t\" does not exist")
            .context("Reconnected to remote after connection reset");
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let err = anyhow::anyhow!("relation \"t\" does not exist");
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn test_run_errors_are_fatal_even_with_transient_wording() {
        let err = anyhow::Error::new(RunError::Configuration("timeout must be positive".into()));
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_elapsed_is_transient() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        let err: anyhow::Result<()> = Err(elapsed).context("Remote query");
        assert_eq!(classify(&err.unwrap_err()), ErrorClass::Transient);
    }

    #[test]
    fn test_cancellation_is_detected_through_context() {
        let err = anyhow::Error::new(RunError::Cancelled).context("while syncing T");
        assert!(is_cancelled(&err));
        assert!(!is_state_failure(&err));
    }
}
