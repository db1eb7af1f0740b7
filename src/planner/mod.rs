//! Planners turning inventory and segment state into job decisions
//!
//! - [`reconcile`]: raw slots against covering segments (reindex decisions)
//! - [`plan_compaction`]: segment-granularity windows (compact decisions)
//! - [`plan_unshard`]: sibling shards of one interval (merge decisions)
//!
//! All planners read from one [`ReconciliationContext`] built per run.

mod compaction;
mod reconcile;
mod unshard;

pub use compaction::{evaluate_window, overlapping, plan_compaction};
pub use reconcile::{
    landed_until, physical_type, reconcile, validation_window, SchemaDrift, SlotCheck,
};
pub use unshard::{plan_unshard, UnshardTask};

use crate::config::RunConfig;
use crate::inventory::RawInventory;
use crate::jobs::JobKind;
use crate::segment::SegmentCatalog;
use crate::time::Interval;
use crate::{Error, Result};

use metrics::counter;
use std::sync::Arc;

/// Why a planner asked for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    /// Operator asked to rebuild everything
    Forced,
    /// No segment covers the slot
    Missing,
    EventCountMismatch { expected: u64, actual: u64 },
    MetricsDrift(SchemaDrift),
    DimensionsDrift(SchemaDrift),
    /// Declared aggregator type differs from the stored column type
    ColumnType {
        column: String,
        expected: String,
        actual: Option<String>,
    },
    /// Stored schema is a reduced variant of the expected one
    SchemaReduction { segment: String },
    /// Segment strictly inside its granularity window
    Fragment { segment: String, interval: Interval },
    UnderSharded { segments: usize, threshold: u32 },
    /// Interval still split into sibling shards
    Partitioned { shards: usize },
}

impl DecisionReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            DecisionReason::Forced => "forced",
            DecisionReason::Missing => "missing",
            DecisionReason::EventCountMismatch { .. } => "event_count",
            DecisionReason::MetricsDrift(_) => "metrics",
            DecisionReason::DimensionsDrift(_) => "dimensions",
            DecisionReason::ColumnType { .. } => "column_type",
            DecisionReason::SchemaReduction { .. } => "schema_reduction",
            DecisionReason::Fragment { .. } => "fragment",
            DecisionReason::UnderSharded { .. } => "under_sharded",
            DecisionReason::Partitioned { .. } => "partitioned",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionReason::Forced => write!(f, "forced rebuild"),
            DecisionReason::Missing => write!(f, "missing segment"),
            DecisionReason::EventCountMismatch { expected, actual } => write!(
                f,
                "event count mismatch: expected {}, actual {}, delta {}",
                expected,
                actual,
                *expected as i128 - *actual as i128
            ),
            DecisionReason::MetricsDrift(drift) => write!(f, "metrics {}", drift),
            DecisionReason::DimensionsDrift(drift) => write!(f, "dimensions {}", drift),
            DecisionReason::ColumnType {
                column,
                expected,
                actual,
            } => write!(
                f,
                "column {} has type {}, expected {}",
                column,
                actual.as_deref().unwrap_or("<absent>"),
                expected
            ),
            DecisionReason::SchemaReduction { segment } => {
                write!(f, "schema reduction in {}", segment)
            }
            DecisionReason::Fragment { segment, interval } => {
                write!(f, "fragment {} covering {}", segment, interval)
            }
            DecisionReason::UnderSharded {
                segments,
                threshold,
            } => write!(f, "{} segments, expected at least {}", segments, threshold),
            DecisionReason::Partitioned { shards } => write!(f, "{} unmerged shards", shards),
        }
    }
}

/// A job a planner wants submitted
#[derive(Debug, Clone, PartialEq)]
pub struct JobDecision {
    pub kind: JobKind,
    /// Catalog key of the source
    pub topic: String,
    pub data_source: String,
    pub interval: Interval,
    /// Raw file patterns for reindexing, segment ids otherwise
    pub inputs: Vec<String>,
    pub reasons: Vec<DecisionReason>,
}

impl JobDecision {
    fn record(&self, planner: &'static str) {
        for reason in &self.reasons {
            counter!(
                "warden_decisions_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "planner" => planner,
                "reason" => reason.label()
            )
            .increment(1);
        }
    }
}

/// Shared state of one run, passed by reference into every planner
pub struct ReconciliationContext {
    inventory: Option<Arc<RawInventory>>,
    segments: Arc<SegmentCatalog>,
    interval: Interval,
    force: bool,
    io_concurrency: usize,
}

impl ReconciliationContext {
    pub fn new(segments: Arc<SegmentCatalog>, interval: Interval) -> Self {
        Self {
            inventory: None,
            segments,
            interval,
            force: false,
            io_concurrency: 8,
        }
    }

    /// Context for `config`'s scan interval
    pub fn for_run(segments: Arc<SegmentCatalog>, config: &RunConfig) -> Self {
        Self::new(segments, config.scan_interval())
            .with_force(config.force)
            .with_io_concurrency(config.io_concurrency)
    }

    pub fn with_inventory(mut self, inventory: Arc<RawInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_io_concurrency(mut self, io_concurrency: usize) -> Self {
        self.io_concurrency = io_concurrency.max(1);
        self
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn segments(&self) -> &SegmentCatalog {
        &self.segments
    }

    pub fn inventory(&self) -> Result<&RawInventory> {
        self.inventory
            .as_deref()
            .ok_or_else(|| Error::Config("this run has no raw inventory".to_string()))
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn io_concurrency(&self) -> usize {
        self.io_concurrency
    }
}
