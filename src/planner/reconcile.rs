//! Raw slots against materialized segments

use super::{DecisionReason, JobDecision, ReconciliationContext};
use crate::config::{SourceConfig, EVENTS_METRIC};
use crate::inventory::Slot;
use crate::jobs::JobKind;
use crate::segment::{ColumnMetadata, Segment};
use crate::time::{Granularity, Interval};
use crate::Result;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Difference between a stored and an expected column set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDrift {
    /// Expected but not stored
    pub missing: Vec<String>,
    /// Stored but not expected
    pub extra: Vec<String>,
}

impl SchemaDrift {
    /// `None` when both sets are equal
    pub fn between(current: &BTreeSet<String>, expected: &BTreeSet<String>) -> Option<Self> {
        let missing: Vec<String> = expected.difference(current).cloned().collect();
        let extra: Vec<String> = current.difference(expected).cloned().collect();
        if missing.is_empty() && extra.is_empty() {
            None
        } else {
            Some(Self { missing, extra })
        }
    }

    /// `missing` (stored is a strict subset), `extra` (strict superset) or `diverged`
    pub fn kind(&self) -> &'static str {
        match (self.missing.is_empty(), self.extra.is_empty()) {
            (false, true) => "missing",
            (true, false) => "extra",
            _ => "diverged",
        }
    }
}

impl std::fmt::Display for SchemaDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: missing {:?}, extra {:?}",
            self.kind(),
            self.missing,
            self.extra
        )
    }
}

/// Physical column type an aggregator produces, if it is a plain numeric one
pub fn physical_type(aggregator: &str) -> Option<&'static str> {
    let aggregator = aggregator.to_ascii_lowercase();
    if aggregator == "count" || aggregator.starts_with("long") {
        Some("LONG")
    } else if aggregator.starts_with("double") {
        Some("DOUBLE")
    } else if aggregator.starts_with("float") {
        Some("FLOAT")
    } else {
        None
    }
}

/// `interval` clamped to the source's epoch; `None` when nothing is left
pub fn validation_window(source: &SourceConfig, interval: &Interval) -> Option<Interval> {
    let start = match source.input.epoch {
        Some(epoch) => interval.start().max(Granularity::Hour.floor(epoch)),
        None => interval.start(),
    };
    if start >= interval.end() {
        return None;
    }
    Some(interval.with_start(start))
}

/// End of the validation window once upstream lag is accounted for
///
/// Walks the slots newest first and stops at the first one holding files
/// under every required prefix; the window ends right after it. Without any
/// complete slot nothing can be validated and the window start is returned.
pub fn landed_until(slots: &[Slot], required: &[String], window: &Interval) -> DateTime<Utc> {
    if required.is_empty() {
        return window.end();
    }
    slots
        .iter()
        .rev()
        .find(|slot| required.iter().all(|prefix| slot.has_prefix(prefix)))
        .map(|slot| (slot.time + Duration::hours(1)).min(window.end()))
        .unwrap_or_else(|| window.start())
}

/// Expectations of one source, evaluated slot by slot
#[derive(Debug, Clone)]
pub struct SlotCheck {
    force: bool,
    metrics: BTreeSet<String>,
    dimensions: BTreeSet<String>,
    /// Metric column to the physical type its aggregator produces
    metric_types: BTreeMap<String, &'static str>,
}

impl SlotCheck {
    pub fn for_source(source: &SourceConfig, force: bool) -> Self {
        let mut metric_types: BTreeMap<String, &'static str> = source
            .metrics
            .iter()
            .filter_map(|(name, aggregator)| {
                physical_type(aggregator).map(|kind| (name.clone(), kind))
            })
            .collect();
        metric_types.insert(EVENTS_METRIC.to_string(), "LONG");
        Self {
            force,
            metrics: source.expected_metrics(),
            dimensions: source.expected_dimensions(),
            metric_types,
        }
    }

    /// First failing check for `slot`, in precedence order
    ///
    /// `covering` are the segments whose interval contains the slot start.
    /// The newest version is the representative; schema sets are the union
    /// over its shards.
    pub async fn evaluate(
        &self,
        slot: &Slot,
        covering: &[Arc<Segment>],
    ) -> Option<DecisionReason> {
        if self.force {
            return Some(DecisionReason::Forced);
        }

        let mut covering: Vec<&Arc<Segment>> = covering.iter().collect();
        covering.sort_by(|a, b| b.version().cmp(a.version()));
        let Some(newest) = covering.first().copied() else {
            return Some(DecisionReason::Missing);
        };

        let actual = newest.events(&slot.interval()).await;
        if actual != slot.events {
            return Some(DecisionReason::EventCountMismatch {
                expected: slot.events,
                actual,
            });
        }

        let shards: Vec<&Arc<Segment>> = covering
            .iter()
            .copied()
            .filter(|s| s.version() == newest.version())
            .collect();
        let metrics: BTreeSet<String> = shards
            .iter()
            .flat_map(|s| s.metrics().iter().cloned())
            .collect();
        let dimensions: BTreeSet<String> = shards
            .iter()
            .flat_map(|s| s.dimensions().iter().cloned())
            .collect();
        if let Some(reason) = self.schema_drift(&metrics, &dimensions) {
            return Some(reason);
        }

        self.column_mismatch(newest.column_metadata().await)
    }

    /// Metrics drift, then dimensions drift
    pub fn schema_drift(
        &self,
        metrics: &BTreeSet<String>,
        dimensions: &BTreeSet<String>,
    ) -> Option<DecisionReason> {
        if let Some(drift) = SchemaDrift::between(metrics, &self.metrics) {
            return Some(DecisionReason::MetricsDrift(drift));
        }
        SchemaDrift::between(dimensions, &self.dimensions).map(DecisionReason::DimensionsDrift)
    }

    pub fn column_mismatch(&self, columns: &ColumnMetadata) -> Option<DecisionReason> {
        self.metric_types
            .iter()
            .find(|(column, expected)| !columns.matches(column, expected))
            .map(|(column, expected)| DecisionReason::ColumnType {
                column: column.clone(),
                expected: expected.to_string(),
                actual: columns.type_of(column).map(str::to_string),
            })
    }
}

/// Compare every raw slot of the run against the stored segments
///
/// Missing segments are only reported inside the part of the window that
/// has fully landed upstream.
pub async fn reconcile(
    ctx: &ReconciliationContext,
    source: &SourceConfig,
) -> Result<Vec<JobDecision>> {
    let Some(window) = validation_window(source, &ctx.interval()) else {
        info!(
            topic = %source.topic,
            interval = %ctx.interval(),
            "Validation window ends before the source epoch"
        );
        return Ok(Vec::new());
    };

    let slots = ctx.inventory()?.slots(source, &window).await?;
    let end = landed_until(&slots, &source.input.required_prefixes, &window);
    if end < window.end() {
        info!(
            topic = %source.topic,
            requested_end = %window.end(),
            end = %end,
            required = ?source.input.required_prefixes,
            "Upstream is lagging, shortening validation window"
        );
    }
    let slots: Vec<&Slot> = slots.iter().filter(|slot| slot.time < end).collect();
    if slots.is_empty() {
        info!(topic = %source.topic, interval = %window, "No raw slots to validate");
        return Ok(Vec::new());
    }

    let segments = ctx.segments().load_all(&source.data_source).await?;
    let check = SlotCheck::for_source(source, ctx.force());
    let check = &check;

    let outcomes: Vec<(&Slot, Option<DecisionReason>)> = futures::stream::iter(slots)
        .map(|slot| {
            let covering: Vec<Arc<Segment>> = segments
                .iter()
                .filter(|segment| segment.interval().contains(slot.time))
                .cloned()
                .collect();
            async move { (slot, check.evaluate(slot, &covering).await) }
        })
        .buffered(ctx.io_concurrency())
        .collect()
        .await;

    let mut decisions = Vec::new();
    for (slot, reason) in outcomes {
        let Some(reason) = reason else {
            debug!(
                topic = %source.topic,
                slot = %slot.time,
                events = slot.events,
                "Slot is up to date"
            );
            continue;
        };
        info!(
            topic = %source.topic,
            data_source = %source.data_source,
            interval = %slot.interval(),
            raw_events = slot.events,
            reason = %reason,
            "Rebuild required"
        );
        let decision = JobDecision {
            kind: JobKind::Reindex,
            topic: source.topic.clone(),
            data_source: source.data_source.clone(),
            interval: slot.interval(),
            inputs: slot.qualified_patterns(),
            reasons: vec![reason],
        };
        decision.record("reconcile");
        decisions.push(decision);
    }
    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceCatalog;
    use chrono::TimeZone;

    fn source(extra: &str) -> Arc<SourceConfig> {
        let raw = format!(
            r#"{{ "svc/pv": {{
                "input": {{ "roots": ["/raw/pv", "/raw/gobblin/pv"] {extra} }},
                "dimensions": ["country"],
                "metrics": {{ "revenue": "doubleSum", "uniques": "hyperUnique" }}
            }} }}"#
        );
        SourceCatalog::from_json_str(&raw).unwrap().get("svc/pv").unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, h, 0, 0).unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_schema_drift_classification() {
        let expected = set(&["a", "b"]);
        assert!(SchemaDrift::between(&set(&["a", "b"]), &expected).is_none());
        assert_eq!(SchemaDrift::between(&set(&["a"]), &expected).unwrap().kind(), "missing");
        assert_eq!(SchemaDrift::between(&set(&["a", "b", "c"]), &expected).unwrap().kind(), "extra");
        // an add and a remove at once still counts as drift
        assert_eq!(SchemaDrift::between(&set(&["a", "c"]), &expected).unwrap().kind(), "diverged");
    }

    #[test]
    fn test_physical_types() {
        assert_eq!(physical_type("longSum"), Some("LONG"));
        assert_eq!(physical_type("count"), Some("LONG"));
        assert_eq!(physical_type("doubleMax"), Some("DOUBLE"));
        assert_eq!(physical_type("floatSum"), Some("FLOAT"));
        assert_eq!(physical_type("hyperUnique"), None);
    }

    #[test]
    fn test_epoch_clamps_window() {
        let window = Interval::new(at(0), at(6)).unwrap();
        let clamped = validation_window(&source(r#", "epoch": "2021-01-01T02:30:00Z""#), &window)
            .unwrap();
        assert_eq!(clamped.start(), at(2));
        assert!(validation_window(&source(r#", "epoch": "2021-01-02T00:00:00Z""#), &window).is_none());
        assert_eq!(validation_window(&source(""), &window), Some(window));
    }

    #[test]
    fn test_landed_until_stops_at_last_complete_hour() {
        let window = Interval::new(at(0), at(4)).unwrap();
        let slot = |h: u32, files: &[&str]| {
            Slot::from_files(at(h), "memory://", files.iter().map(|f| f.to_string()))
        };
        let slots = vec![
            slot(0, &["raw/pv/a.0.0.1.gz", "raw/gobblin/pv/a.0.0.1.gz"]),
            slot(1, &["raw/pv/a.0.0.1.gz", "raw/gobblin/pv/a.0.0.1.gz"]),
            slot(2, &["raw/pv/a.0.0.1.gz"]),
        ];
        let required = vec!["/raw/gobblin/pv".to_string()];
        assert_eq!(landed_until(&slots, &required, &window), at(2));
        assert_eq!(landed_until(&slots, &[], &window), at(4));
        assert_eq!(landed_until(&slots[2..], &required, &window), at(0));
    }

    #[test]
    fn test_schema_checks_precede_column_types() {
        let check = SlotCheck::for_source(&source(""), false);
        let metrics = set(&["events", "revenue", "uniques"]);
        let dimensions = set(&["country"]);
        assert!(check.schema_drift(&metrics, &dimensions).is_none());
        assert!(matches!(
            check.schema_drift(&set(&["events"]), &dimensions),
            Some(DecisionReason::MetricsDrift(_))
        ));
        assert!(matches!(
            check.schema_drift(&metrics, &set(&["country", "device"])),
            Some(DecisionReason::DimensionsDrift(_))
        ));
    }

    #[test]
    fn test_column_types_ignore_non_numeric_aggregators() {
        let check = SlotCheck::for_source(&source(""), false);
        let columns = ColumnMetadata::Known(
            [("events", "LONG"), ("revenue", "DOUBLE"), ("country", "STRING")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        assert!(check.column_mismatch(&columns).is_none());

        let wrong = ColumnMetadata::Known(
            [("events", "DOUBLE"), ("revenue", "DOUBLE")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        assert_eq!(
            check.column_mismatch(&wrong),
            Some(DecisionReason::ColumnType {
                column: "events".to_string(),
                expected: "LONG".to_string(),
                actual: Some("DOUBLE".to_string()),
            })
        );
        assert!(check.column_mismatch(&ColumnMetadata::Unavailable).is_some());
    }
}
