//! Segment descriptors as stored in the metadata store

use crate::time::Interval;
use crate::{Error, Result};

use chrono::SecondsFormat;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Partitioning of a segment within its interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub kind: ShardKind,
    pub partition_num: u32,
    pub partitions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardKind {
    None,
    Linear,
    Hashed,
    Numbered,
    Other(String),
}

impl ShardKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "none" => ShardKind::None,
            "linear" => ShardKind::Linear,
            "hashed" => ShardKind::Hashed,
            "numbered" => ShardKind::Numbered,
            other => ShardKind::Other(other.to_string()),
        }
    }

    /// Whether segments of this kind are sibling shards awaiting a merge
    pub fn is_partitioned(&self) -> bool {
        matches!(self, ShardKind::Linear | ShardKind::Hashed)
    }
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self {
            kind: ShardKind::None,
            partition_num: 0,
            partitions: None,
        }
    }
}

/// Immutable description of one published segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    pub data_source: String,
    pub interval: Interval,
    pub version: String,
    pub dimensions: BTreeSet<String>,
    pub metrics: BTreeSet<String>,
    pub shard_spec: ShardSpec,
    pub load_spec: serde_json::Value,
}

/// Column list that may be stored comma-joined or as an array
#[derive(Deserialize)]
#[serde(untagged)]
enum ColumnList {
    Joined(String),
    Listed(Vec<String>),
}

impl ColumnList {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            ColumnList::Joined(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
            ColumnList::Listed(columns) => columns.into_iter().filter(|c| !c.is_empty()).collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawShardSpec {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    partition_num: Option<u32>,
    #[serde(default)]
    partitions: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    data_source: String,
    interval: Interval,
    version: String,
    #[serde(default)]
    dimensions: Option<ColumnList>,
    #[serde(default)]
    metrics: Option<ColumnList>,
    #[serde(default)]
    shard_spec: Option<RawShardSpec>,
    #[serde(default)]
    load_spec: serde_json::Value,
}

impl SegmentDescriptor {
    /// Parse a descriptor payload
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let raw = RawDescriptor::deserialize(payload).map_err(|e| {
            Error::Metadata(format!("malformed segment descriptor: {}", e))
        })?;
        let shard_spec = raw
            .shard_spec
            .map(|spec| ShardSpec {
                kind: ShardKind::parse(spec.kind.as_deref().unwrap_or("none")),
                partition_num: spec.partition_num.unwrap_or(0),
                partitions: spec.partitions,
            })
            .unwrap_or_default();

        Ok(Self {
            data_source: raw.data_source,
            interval: raw.interval,
            version: raw.version,
            dimensions: raw.dimensions.map(ColumnList::into_set).unwrap_or_default(),
            metrics: raw.metrics.map(ColumnList::into_set).unwrap_or_default(),
            shard_spec,
            load_spec: raw.load_spec,
        })
    }

    /// Segment identifier in the `dataSource_start_end_version[_partition]` form
    pub fn id(&self) -> String {
        let mut id = format!(
            "{}_{}_{}_{}",
            self.data_source,
            self.interval.start().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.interval.end().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.version
        );
        if self.shard_spec.partition_num > 0 {
            id.push('_');
            id.push_str(&self.shard_spec.partition_num.to_string());
        }
        id
    }
}
