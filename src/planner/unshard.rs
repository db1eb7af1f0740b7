//! Merge planning for intervals still split into sibling shards

use super::{DecisionReason, JobDecision, ReconciliationContext};
use crate::config::SourceConfig;
use crate::jobs::JobKind;
use crate::segment::Segment;
use crate::time::Interval;
use crate::{Error, Result};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Task type used to merge shards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnshardTask {
    /// Native compaction task
    #[default]
    Compact,
    /// Index task reading the segments back through a firehose
    Index,
}

impl UnshardTask {
    pub fn kind(&self) -> JobKind {
        match self {
            UnshardTask::Compact => JobKind::Merge,
            UnshardTask::Index => JobKind::Unshard,
        }
    }
}

impl std::str::FromStr for UnshardTask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(UnshardTask::Compact),
            "index" => Ok(UnshardTask::Index),
            other => Err(Error::Config(format!(
                "unknown unshard task '{}', expected 'compact' or 'index'",
                other
            ))),
        }
    }
}

pub async fn plan_unshard(
    ctx: &ReconciliationContext,
    source: &SourceConfig,
    task: UnshardTask,
) -> Result<Vec<JobDecision>> {
    let scan = ctx.interval();
    let segments = ctx.segments().load_all(&source.data_source).await?;

    let mut groups: BTreeMap<Interval, Vec<&Arc<Segment>>> = BTreeMap::new();
    for segment in segments.iter().filter(|s| s.interval().overlaps(&scan)) {
        groups.entry(segment.interval()).or_default().push(segment);
    }

    let mut decisions = Vec::new();
    for (interval, members) in groups {
        // all members share the interval, the first one stands for the group
        let partitioned = members[0].shard_spec().kind.is_partitioned();
        if !partitioned || members.len() < 2 {
            continue;
        }
        info!(
            topic = %source.topic,
            data_source = %source.data_source,
            interval = %interval,
            shards = members.len(),
            task = %task.kind(),
            "Merging shards"
        );
        let decision = JobDecision {
            kind: task.kind(),
            topic: source.topic.clone(),
            data_source: source.data_source.clone(),
            interval,
            inputs: members.iter().map(|s| s.id()).collect(),
            reasons: vec![DecisionReason::Partitioned {
                shards: members.len(),
            }],
        };
        decision.record("unshard");
        decisions.push(decision);
    }
    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unshard_task_parsing() {
        assert_eq!("compact".parse::<UnshardTask>().unwrap(), UnshardTask::Compact);
        assert_eq!(" INDEX ".parse::<UnshardTask>().unwrap(), UnshardTask::Index);
        assert!("hadoop".parse::<UnshardTask>().is_err());
        assert_eq!(UnshardTask::default().kind(), JobKind::Merge);
        assert_eq!(UnshardTask::Index.kind(), JobKind::Unshard);
    }
}
