//! Compaction and unshard planning over published segments

mod common;

use common::{interval, page_views, segment, shard, StaticBroker};
use druid_warden::config::{SourceCatalog, SourceConfig};
use druid_warden::jobs::JobKind;
use druid_warden::planner::{
    overlapping, plan_compaction, plan_unshard, DecisionReason, ReconciliationContext, UnshardTask,
};
use druid_warden::segment::{LocalSegmentStore, Segment, SegmentCatalog, SegmentDescriptor};

use serde_json::Value;
use std::sync::Arc;

const DAY: &str = "2021-01-01T00:00:00Z/2021-01-02T00:00:00Z";
const FULL_METRICS: &str = "events,revenue";
const FULL_DIMENSIONS: &str = "country,device";

fn context(payloads: Vec<Value>, scan: &str) -> ReconciliationContext {
    let store = Arc::new(LocalSegmentStore::new());
    for payload in payloads {
        store.publish(payload).unwrap();
    }
    let catalog = Arc::new(SegmentCatalog::new(store, Arc::new(StaticBroker::default())));
    ReconciliationContext::new(catalog, interval(scan))
}

/// `page_views` with a shard threshold on its day windows
fn sharded_page_views(shards: u32) -> Arc<SourceConfig> {
    let raw = format!(
        r#"{{
            "web/page_views": {{
                "input": {{ "roots": ["/raw/page_views"] }},
                "dimensions": ["country", "device"],
                "metrics": {{ "revenue": "doubleSum" }},
                "output": {{ "segmentGranularity": "day", "numShards": {shards} }}
            }}
        }}"#
    );
    SourceCatalog::from_json_str(&raw)
        .unwrap()
        .get("web/page_views")
        .unwrap()
}

fn hourly_day() -> Vec<Value> {
    (0..24)
        .map(|h| {
            let end = if h == 23 {
                "2021-01-02T00:00:00Z".to_string()
            } else {
                format!("2021-01-01T{:02}:00:00Z", h + 1)
            };
            segment(
                &format!("2021-01-01T{h:02}:00:00Z/{end}"),
                "v1",
                FULL_METRICS,
                FULL_DIMENSIONS,
            )
        })
        .collect()
}

#[tokio::test]
async fn test_three_tiling_segments_need_no_compaction() {
    let ctx = context(
        vec![
            segment("2021-01-01T00:00:00Z/2021-01-01T08:00:00Z", "v1", FULL_METRICS, FULL_DIMENSIONS),
            segment("2021-01-01T08:00:00Z/2021-01-01T16:00:00Z", "v1", FULL_METRICS, FULL_DIMENSIONS),
            segment("2021-01-01T16:00:00Z/2021-01-02T00:00:00Z", "v1", FULL_METRICS, FULL_DIMENSIONS),
        ],
        DAY,
    );
    let decisions = plan_compaction(&ctx, &sharded_page_views(3)).await.unwrap();
    assert!(decisions.is_empty(), "{decisions:?}");

    // without a shard threshold the same tiling is three fragments
    let decisions = plan_compaction(&ctx, &page_views()).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].inputs.len(), 3);
}

#[tokio::test]
async fn test_hourly_segments_in_a_day_window_are_compacted() {
    for source in [page_views(), sharded_page_views(3)] {
        let ctx = context(hourly_day(), DAY);
        let decisions = plan_compaction(&ctx, &source).await.unwrap();

        assert_eq!(decisions.len(), 1, "{decisions:?}");
        assert_eq!(decisions[0].interval, interval(DAY));
        assert_eq!(decisions[0].inputs.len(), 24);
        let fragments = decisions[0]
            .reasons
            .iter()
            .filter(|r| matches!(r, DecisionReason::Fragment { .. }))
            .count();
        assert_eq!(fragments, 22);
    }
}

#[tokio::test]
async fn test_fragment_targets_the_whole_window() {
    let ctx = context(
        vec![segment(
            "2021-01-01T08:00:00Z/2021-01-01T16:00:00Z",
            "v1",
            FULL_METRICS,
            FULL_DIMENSIONS,
        )],
        DAY,
    );
    let decisions = plan_compaction(&ctx, &page_views()).await.unwrap();

    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].kind, JobKind::Compact);
    assert_eq!(decisions[0].interval, interval(DAY));
    assert_eq!(decisions[0].inputs.len(), 1);
    assert!(matches!(
        decisions[0].reasons[0],
        DecisionReason::Fragment { .. }
    ));
}

#[tokio::test]
async fn test_schema_reduction_is_flagged() {
    let ctx = context(
        vec![segment(DAY, "v1", "events,clicks", FULL_DIMENSIONS)],
        DAY,
    );
    let decisions = plan_compaction(&ctx, &page_views()).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(matches!(
        decisions[0].reasons[0],
        DecisionReason::SchemaReduction { .. }
    ));
}

#[tokio::test]
async fn test_windows_without_segments_are_skipped() {
    let ctx = context(
        vec![segment(DAY, "v1", FULL_METRICS, FULL_DIMENSIONS)],
        "2021-01-01T00:00:00Z/2021-01-04T00:00:00Z",
    );
    let decisions = plan_compaction(&ctx, &page_views()).await.unwrap();
    assert!(decisions.is_empty(), "{decisions:?}");
}

#[test]
fn test_overlap_expands_transitively() {
    let broker = Arc::new(StaticBroker::default());
    let make = |raw: &str| {
        Arc::new(Segment::new(
            SegmentDescriptor::from_payload(&segment(raw, "v1", FULL_METRICS, FULL_DIMENSIONS))
                .unwrap(),
            broker.clone(),
        ))
    };
    let segments = vec![
        make("2021-01-01T20:00:00Z/2021-01-02T04:00:00Z"),
        make("2021-01-02T02:00:00Z/2021-01-02T10:00:00Z"),
        make("2021-01-03T00:00:00Z/2021-01-04T00:00:00Z"),
    ];

    let (span, members) = overlapping(&segments, &interval(DAY));
    assert_eq!(members.len(), 2);
    assert_eq!(
        span,
        interval("2021-01-01T00:00:00Z/2021-01-02T10:00:00Z")
    );
}

#[tokio::test]
async fn test_partitioned_intervals_are_merged() {
    let hour = "2021-01-01T00:00:00Z/2021-01-01T01:00:00Z";
    let unpartitioned = "2021-01-01T01:00:00Z/2021-01-01T02:00:00Z";
    let ctx = context(
        vec![
            shard(hour, "hashed", 0),
            shard(hour, "hashed", 1),
            shard(hour, "hashed", 2),
            shard(unpartitioned, "numbered", 0),
            shard(unpartitioned, "numbered", 1),
            shard("2021-01-01T02:00:00Z/2021-01-01T03:00:00Z", "linear", 0),
        ],
        DAY,
    );

    let decisions = plan_unshard(&ctx, &page_views(), UnshardTask::Compact)
        .await
        .unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].kind, JobKind::Merge);
    assert_eq!(decisions[0].interval, interval(hour));
    assert_eq!(decisions[0].inputs.len(), 3);
    assert_eq!(
        decisions[0].reasons,
        vec![DecisionReason::Partitioned { shards: 3 }]
    );

    let decisions = plan_unshard(&ctx, &page_views(), UnshardTask::Index)
        .await
        .unwrap();
    assert_eq!(decisions[0].kind, JobKind::Unshard);
}

#[tokio::test]
async fn test_unshard_ignores_intervals_outside_the_scan() {
    let ctx = context(
        vec![
            shard("2021-01-05T00:00:00Z/2021-01-05T01:00:00Z", "hashed", 0),
            shard("2021-01-05T00:00:00Z/2021-01-05T01:00:00Z", "hashed", 1),
        ],
        DAY,
    );
    let decisions = plan_unshard(&ctx, &page_views(), UnshardTask::default())
        .await
        .unwrap();
    assert!(decisions.is_empty());
}
