//! # Druid Warden
//!
//! Reconciles a segment-oriented analytical store against the raw event files
//! it was built from, and drives corrective jobs through the overlord.
//!
//! ## Pipeline
//!
//! - **Inventory**: raw files under each source's roots, bucketed into hourly
//!   [`inventory::Slot`]s with event counts decoded from file names
//! - **Segments**: used segment descriptors from the metadata store, with live
//!   event counts and column types fetched lazily from the broker
//! - **Planners**: reconciliation, compaction and unshard passes turning the
//!   two views into [`planner::JobDecision`]s
//! - **Jobs**: typed job documents submitted to the overlord, deduplicated
//!   against active jobs and tracked until they leave the running state

pub mod config;
pub mod inventory;
pub mod jobs;
pub mod planner;
pub mod segment;
pub mod telemetry;
pub mod time;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::{ComponentFactory, RunConfig, SourceCatalog, SourceConfig};
    pub use crate::inventory::{RawInventory, RawStore, Slot};
    pub use crate::jobs::{DuplicateJobRegistry, JobKind, JobRunner, OverlordClient, RunnerConfig};
    pub use crate::planner::{
        plan_compaction, plan_unshard, reconcile, JobDecision, ReconciliationContext, UnshardTask,
    };
    pub use crate::segment::{Segment, SegmentCatalog};
    pub use crate::time::{Granularity, Interval, RunWindow};
    pub use crate::{Error, Result};
}
