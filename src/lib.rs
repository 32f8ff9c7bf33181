// ABOUTME: Library root for table-replicator
// ABOUTME: Incremental watermark-based replication of remote tables into PostgreSQL

pub mod config;
pub mod error;
pub mod filters;
pub mod local;
pub mod postgres;
pub mod replication;
pub mod retry;
pub mod source;
pub mod utils;
pub mod value;

pub use config::Config;
pub use error::{classify, ErrorClass, RunError};
pub use replication::{ReplicationOptions, Replicator, RunReport, RunStatus, WatermarkStore};
pub use value::SqlValue;
