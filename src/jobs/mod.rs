//! Job documents and the overlord job lifecycle
//!
//! Planner decisions become [`JobDocument`]s through [`spec::build`]; the
//! [`JobRunner`] submits them through the [`OverlordClient`], skipping
//! intervals the [`DuplicateJobRegistry`] already sees as active, and waits
//! until every submitted job leaves the running state.

mod client;
mod job;
mod registry;
mod runner;
pub mod spec;

pub use client::{OverlordClient, INDEXER_PATH};
pub use job::{Job, JobState, TaskStatus};
pub use registry::{ActiveJob, DuplicateJobRegistry, TaskListKind};
pub use runner::{JobRunner, RunReport, RunnerConfig, WaitOutcome};
pub use spec::{JobDocument, JobKind, PartitionsSpec};
