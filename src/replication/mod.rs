// ABOUTME: Incremental replication engine - state document, schema reconciliation and the driver
// ABOUTME: Copies selected remote tables into the local database one committed batch at a time

pub mod driver;
pub mod exclusion;
pub mod extract;
pub mod run;
pub mod schema;
pub mod state;
pub mod writer;

pub use driver::{
    Connector, DuplicateReport, ReplicationOptions, Replicator, RunReport, TableFailure,
    TableOutcome, TableReport,
};
pub use exclusion::ExclusionRule;
pub use run::{RunGuard, RunRecord, RunStatus};
pub use state::{StateDocument, TableState, Watermark, WatermarkStore};
pub use writer::{ConflictPolicy, InsertPlan};
