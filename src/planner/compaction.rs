//! Compaction planning over segment-granularity windows

use super::{DecisionReason, JobDecision, ReconciliationContext};
use crate::config::SourceConfig;
use crate::jobs::JobKind;
use crate::segment::{Segment, SegmentDescriptor};
use crate::time::Interval;
use crate::Result;

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Segments overlapping `window`, expanded transitively
///
/// A segment overlapping any already selected segment is selected too, so
/// no member is judged against a truncated neighbour. Returns the union of
/// the selected intervals along with the members.
pub fn overlapping<'a>(
    segments: &'a [Arc<Segment>],
    window: &Interval,
) -> (Interval, Vec<&'a Arc<Segment>>) {
    let mut span = *window;
    let mut selected = vec![false; segments.len()];
    loop {
        let mut grown = false;
        for (index, segment) in segments.iter().enumerate() {
            if !selected[index] && segment.interval().overlaps(&span) {
                selected[index] = true;
                span = span.span(&segment.interval());
                grown = true;
            }
        }
        if !grown {
            break;
        }
    }
    let members = segments
        .iter()
        .zip(selected)
        .filter_map(|(segment, keep)| keep.then_some(segment))
        .collect();
    (span, members)
}

/// `(S ∩ E) ⊊ E` and `S ∩ E ≠ S`
fn is_reduced(current: &BTreeSet<String>, expected: &BTreeSet<String>) -> bool {
    let common: BTreeSet<&String> = current.intersection(expected).collect();
    common.len() < expected.len() && common.len() != current.len()
}

/// Number of distinct member intervals covering `window` back to back,
/// `None` when they leave a gap or overlap
fn tiles(window: &Interval, members: &[&SegmentDescriptor]) -> Option<usize> {
    let intervals: BTreeSet<Interval> = members.iter().map(|m| m.interval).collect();
    let mut cursor = window.start();
    let mut count = 0;
    for interval in &intervals {
        if cursor >= window.end() {
            break;
        }
        if interval.start() > cursor || (cursor > window.start() && interval.start() != cursor) {
            return None;
        }
        cursor = interval.end();
        count += 1;
    }
    (cursor >= window.end()).then_some(count)
}

/// Whether sub-window members are intended shards rather than fragments
///
/// Only a back-to-back tiling with no more tiles than the configured shard
/// threshold qualifies.
fn sharded_tiling(
    window: &Interval,
    members: &[&SegmentDescriptor],
    threshold: Option<u32>,
) -> bool {
    match (tiles(window, members), threshold) {
        (Some(count), Some(threshold)) => count <= threshold as usize,
        _ => false,
    }
}

/// Every reason `window` needs compacting; empty when it does not
pub fn evaluate_window(
    window: &Interval,
    members: &[&SegmentDescriptor],
    expected_metrics: &BTreeSet<String>,
    expected_dimensions: &BTreeSet<String>,
    threshold: Option<u32>,
) -> Vec<DecisionReason> {
    let mut reasons = Vec::new();
    let tiled = sharded_tiling(window, members, threshold);

    for member in members {
        if is_reduced(&member.metrics, expected_metrics)
            || is_reduced(&member.dimensions, expected_dimensions)
        {
            reasons.push(DecisionReason::SchemaReduction {
                segment: member.id(),
            });
        }
        let inside = member.interval.start() > window.start() && member.interval.end() < window.end();
        if inside && !tiled {
            reasons.push(DecisionReason::Fragment {
                segment: member.id(),
                interval: member.interval,
            });
        }
    }

    if let Some(threshold) = threshold {
        if !members.is_empty() && members.len() < threshold as usize {
            reasons.push(DecisionReason::UnderSharded {
                segments: members.len(),
                threshold,
            });
        }
    }
    reasons
}

/// One compaction decision per flagged granularity window of the run interval
pub async fn plan_compaction(
    ctx: &ReconciliationContext,
    source: &SourceConfig,
) -> Result<Vec<JobDecision>> {
    let granularity = source.output.segment_granularity;
    let scan = ctx.interval();
    info!(
        topic = %source.topic,
        interval = %scan,
        granularity = %granularity,
        "Planning compaction"
    );

    let segments = ctx.segments().load_all(&source.data_source).await?;
    let expected_metrics = source.expected_metrics();
    let expected_dimensions = source.expected_dimensions();
    let threshold = source.shard_threshold();

    let mut decisions = Vec::new();
    for window in granularity.buckets(&scan) {
        let (span, members) = overlapping(&segments, &window);
        if members.is_empty() {
            continue;
        }
        let descriptors: Vec<&SegmentDescriptor> =
            members.iter().map(|segment| segment.descriptor()).collect();
        let reasons = evaluate_window(
            &window,
            &descriptors,
            &expected_metrics,
            &expected_dimensions,
            threshold,
        );
        if reasons.is_empty() {
            debug!(topic = %source.topic, window = %window, segments = members.len(), "Window is compact");
            continue;
        }

        info!(
            topic = %source.topic,
            data_source = %source.data_source,
            window = %window,
            span = %span,
            segments = members.len(),
            reasons = ?reasons.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Compaction required"
        );
        let decision = JobDecision {
            kind: JobKind::Compact,
            topic: source.topic.clone(),
            data_source: source.data_source.clone(),
            interval: window,
            inputs: descriptors.iter().map(|d| d.id()).collect(),
            reasons,
        };
        decision.record("compaction");
        decisions.push(decision);
    }
    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::ShardSpec;

    fn descriptor(interval: &str, metrics: &[&str], dimensions: &[&str]) -> SegmentDescriptor {
        SegmentDescriptor {
            data_source: "pv".to_string(),
            interval: interval.parse().unwrap(),
            version: "v1".to_string(),
            dimensions: dimensions.iter().map(|s| s.to_string()).collect(),
            metrics: metrics.iter().map(|s| s.to_string()).collect(),
            shard_spec: ShardSpec::default(),
            load_spec: serde_json::Value::Null,
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn day() -> Interval {
        "2021-01-01T00:00:00Z/2021-01-02T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_reduction_formula() {
        let expected = set(&["a", "b"]);
        assert!(!is_reduced(&set(&["a", "b"]), &expected));
        assert!(!is_reduced(&set(&["a"]), &expected));
        assert!(!is_reduced(&set(&["a", "b", "c"]), &expected));
        assert!(is_reduced(&set(&["a", "c"]), &expected));
    }

    #[test]
    fn test_three_tiling_segments_need_no_compaction() {
        let members = [
            descriptor("2021-01-01T00:00:00Z/2021-01-01T08:00:00Z", &["events"], &["a"]),
            descriptor("2021-01-01T08:00:00Z/2021-01-01T16:00:00Z", &["events"], &["a"]),
            descriptor("2021-01-01T16:00:00Z/2021-01-02T00:00:00Z", &["events"], &["a"]),
        ];
        let refs: Vec<&SegmentDescriptor> = members.iter().collect();
        let reasons = evaluate_window(&day(), &refs, &set(&["events"]), &set(&["a"]), Some(3));
        assert!(reasons.is_empty(), "{reasons:?}");
    }

    #[test]
    fn test_hourly_segments_in_day_window_are_fragments() {
        let members: Vec<SegmentDescriptor> = (0..24)
            .map(|h| {
                let end = if h == 23 {
                    "2021-01-02T00:00:00Z".to_string()
                } else {
                    format!("2021-01-01T{:02}:00:00Z", h + 1)
                };
                descriptor(&format!("2021-01-01T{h:02}:00:00Z/{end}"), &["events"], &["a"])
            })
            .collect();
        let refs: Vec<&SegmentDescriptor> = members.iter().collect();
        assert_eq!(tiles(&day(), &refs), Some(24));

        for threshold in [None, Some(3)] {
            let reasons = evaluate_window(&day(), &refs, &set(&["events"]), &set(&["a"]), threshold);
            let fragments = reasons
                .iter()
                .filter(|r| matches!(r, DecisionReason::Fragment { .. }))
                .count();
            // first and last hour touch the window bounds
            assert_eq!(fragments, 22, "{threshold:?}");
        }

        let reasons = evaluate_window(&day(), &refs, &set(&["events"]), &set(&["a"]), Some(24));
        assert!(reasons.is_empty(), "{reasons:?}");
    }

    #[test]
    fn test_lone_fragment_is_flagged() {
        let members = [descriptor(
            "2021-01-01T08:00:00Z/2021-01-01T16:00:00Z",
            &["events"],
            &["a"],
        )];
        let refs: Vec<&SegmentDescriptor> = members.iter().collect();
        let reasons = evaluate_window(&day(), &refs, &set(&["events"]), &set(&["a"]), None);
        assert!(matches!(reasons.as_slice(), [DecisionReason::Fragment { .. }]));
    }

    #[test]
    fn test_under_sharded_window() {
        let members = [descriptor(
            "2021-01-01T00:00:00Z/2021-01-02T00:00:00Z",
            &["events"],
            &["a"],
        )];
        let refs: Vec<&SegmentDescriptor> = members.iter().collect();
        let reasons = evaluate_window(&day(), &refs, &set(&["events"]), &set(&["a"]), Some(4));
        assert_eq!(
            reasons,
            vec![DecisionReason::UnderSharded {
                segments: 1,
                threshold: 4
            }]
        );
        assert!(evaluate_window(&day(), &[], &set(&["events"]), &set(&["a"]), Some(4)).is_empty());
    }

    #[test]
    fn test_tiling_requires_contiguous_cover() {
        let gap = [
            descriptor("2021-01-01T00:00:00Z/2021-01-01T08:00:00Z", &[], &[]),
            descriptor("2021-01-01T09:00:00Z/2021-01-02T00:00:00Z", &[], &[]),
        ];
        let refs: Vec<&SegmentDescriptor> = gap.iter().collect();
        assert_eq!(tiles(&day(), &refs), None);

        let shards = [
            descriptor("2021-01-01T00:00:00Z/2021-01-02T00:00:00Z", &[], &[]),
            descriptor("2021-01-01T00:00:00Z/2021-01-02T00:00:00Z", &[], &[]),
        ];
        let refs: Vec<&SegmentDescriptor> = shards.iter().collect();
        assert_eq!(tiles(&day(), &refs), Some(1));
    }
}
