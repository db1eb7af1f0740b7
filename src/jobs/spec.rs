//! Job documents accepted by the overlord
//!
//! [`build`] is a pure function from a [`JobKind`], a source and an interval
//! to a [`JobDocument`]. Each kind maps to one task type:
//!
//! | kind      | task             | reads from                       |
//! |-----------|------------------|----------------------------------|
//! | `Reindex` | `index_hadoop`   | raw files (static paths)         |
//! | `Compact` | `index_parallel` | the data source (`druid` input)  |
//! | `Merge`   | `compact`        | the data source (interval input) |
//! | `Unshard` | `index`          | the data source (`ingestSegment`)|

use crate::config::{OutputConfig, SourceConfig, EVENTS_METRIC};
use crate::time::{Granularity, Interval};
use crate::{Error, Result};

use serde::Serialize;
use serde_json::{json, Map, Value};

const DEFAULT_BITMAP: &str = "roaring";

/// Kind of corrective job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Rebuild an interval from raw files
    Reindex,
    /// Rewrite an interval from the stored segments
    Compact,
    /// Merge sibling shards of one interval with a native compaction task
    Merge,
    /// Merge sibling shards of one interval by re-indexing them
    Unshard,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Reindex => "reindex",
            JobKind::Compact => "compact",
            JobKind::Merge => "merge",
            JobKind::Unshard => "unshard",
        }
    }

    /// Task type the overlord sees
    pub fn task_type(&self) -> &'static str {
        match self {
            JobKind::Reindex => "index_hadoop",
            JobKind::Compact => "index_parallel",
            JobKind::Merge => "compact",
            JobKind::Unshard => "index",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submittable task document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobDocument {
    IndexHadoop { spec: IngestionSpec },
    IndexParallel { spec: IngestionSpec },
    Compact(CompactTask),
    Index { spec: IngestionSpec },
}

impl JobDocument {
    pub fn data_source(&self) -> &str {
        match self {
            JobDocument::IndexHadoop { spec }
            | JobDocument::IndexParallel { spec }
            | JobDocument::Index { spec } => &spec.data_schema.data_source,
            JobDocument::Compact(task) => &task.data_source,
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSpec {
    pub data_schema: DataSchema,
    pub io_config: IoConfig,
    pub tuning_config: TuningConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSchema {
    pub data_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser: Option<Parser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_spec: Option<TimestampSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions_spec: Option<DimensionsSpec>,
    pub metrics_spec: Vec<MetricSpec>,
    pub granularity_spec: GranularitySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Parser {
    pub parse_spec: ParseSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSpec {
    pub format: String,
    pub timestamp_spec: TimestampSpec,
    pub dimensions_spec: DimensionsSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampSpec {
    pub column: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionsSpec {
    pub dimensions: Vec<String>,
    pub spatial_dimensions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub field_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GranularitySpec {
    pub segment_granularity: Granularity,
    pub query_granularity: Granularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervals: Option<Vec<Interval>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollup: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IoConfig {
    Hadoop {
        #[serde(rename = "inputSpec")]
        input_spec: Value,
    },
    IndexParallel {
        #[serde(rename = "inputSource")]
        input_source: Value,
    },
    Index {
        firehose: Value,
    },
    Compact {
        #[serde(rename = "inputSpec")]
        input_spec: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions_spec: Option<PartitionsSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_spec: Option<Value>,
    /// Task-type specific knobs
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Secondary partitioning of the produced segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartitionsSpec {
    None,
    Hashed {
        #[serde(rename = "numShards", skip_serializing_if = "Option::is_none")]
        num_shards: Option<u32>,
        #[serde(rename = "targetPartitionSize", skip_serializing_if = "Option::is_none")]
        target_partition_size: Option<u64>,
        #[serde(rename = "partitionDimensions", skip_serializing_if = "Option::is_none")]
        partition_dimensions: Option<Vec<String>>,
    },
    Dynamic,
}

impl PartitionsSpec {
    /// Explicit `numShards`, then `targetPartitionSize`, then
    /// `partitionDimensions` alone; `fallback` when none is configured.
    pub fn for_output(output: &OutputConfig, fallback: PartitionsSpec) -> PartitionsSpec {
        let partition_dimensions = output.partition_dimensions.clone();
        if let Some(num_shards) = output.num_shards {
            PartitionsSpec::Hashed {
                num_shards: Some(num_shards),
                target_partition_size: None,
                partition_dimensions,
            }
        } else if let Some(size) = output.target_partition_size {
            PartitionsSpec::Hashed {
                num_shards: None,
                target_partition_size: Some(size),
                partition_dimensions,
            }
        } else if partition_dimensions.is_some() {
            PartitionsSpec::Hashed {
                num_shards: None,
                target_partition_size: None,
                partition_dimensions,
            }
        } else {
            fallback
        }
    }

    pub fn is_hashed(&self) -> bool {
        matches!(self, PartitionsSpec::Hashed { .. })
    }
}

/// Native compaction task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactTask {
    pub data_source: String,
    pub io_config: IoConfig,
    pub dimensions_spec: DimensionsSpec,
    pub metrics_spec: Vec<MetricSpec>,
    pub granularity_spec: GranularitySpec,
    pub tuning_config: TuningConfig,
}

/// Build the document for one job
///
/// `inputs` are the raw file patterns of a reindex; other kinds read the
/// interval back from the data source and ignore them.
pub fn build(
    kind: JobKind,
    source: &SourceConfig,
    interval: &Interval,
    inputs: &[String],
) -> Result<JobDocument> {
    match kind {
        JobKind::Reindex => build_reindex(source, interval, inputs),
        JobKind::Compact => Ok(build_compact(source, interval)),
        JobKind::Merge => Ok(build_merge(source, interval)),
        JobKind::Unshard => Ok(build_unshard(source, interval)),
    }
}

fn build_reindex(source: &SourceConfig, interval: &Interval, inputs: &[String]) -> Result<JobDocument> {
    if inputs.is_empty() {
        return Err(Error::Config(format!(
            "{}: reindex of {} has no input files",
            source.topic, interval
        )));
    }
    let mut options = Map::new();
    options.insert("overwriteFiles".into(), json!(true));
    options.insert("ignoreInvalidRows".into(), json!(true));
    options.insert("forceExtendableShardSpecs".into(), json!(true));
    options.insert("useCombiner".into(), json!(true));
    options.insert("maxRowsInMemory".into(), json!(10_000_000));

    Ok(JobDocument::IndexHadoop {
        spec: IngestionSpec {
            data_schema: DataSchema {
                data_source: source.data_source.clone(),
                parser: Some(Parser {
                    parse_spec: ParseSpec {
                        format: "json".to_string(),
                        timestamp_spec: timestamp_spec(source),
                        dimensions_spec: dimensions_spec(source),
                    },
                }),
                timestamp_spec: None,
                dimensions_spec: None,
                metrics_spec: metrics_spec(source),
                granularity_spec: granularity_spec(source, Some(interval), None),
            },
            io_config: IoConfig::Hadoop {
                input_spec: json!({ "type": "static", "paths": inputs.join(",") }),
            },
            tuning_config: TuningConfig {
                kind: "hadoop".to_string(),
                partitions_spec: Some(PartitionsSpec::for_output(
                    &source.output,
                    PartitionsSpec::None,
                )),
                index_spec: Some(index_spec(source)),
                options,
            },
        },
    })
}

fn build_compact(source: &SourceConfig, interval: &Interval) -> JobDocument {
    let partitions = PartitionsSpec::for_output(&source.output, PartitionsSpec::Dynamic);
    let mut options = Map::new();
    options.insert("maxRowsInMemory".into(), json!(50_000_000));
    options.insert("maxNumConcurrentSubTasks".into(), json!(20));
    if partitions.is_hashed() {
        options.insert("forceGuaranteedRollup".into(), json!(true));
        options.insert("totalNumMergeTasks".into(), json!(20));
    }

    JobDocument::IndexParallel {
        spec: IngestionSpec {
            data_schema: DataSchema {
                data_source: source.data_source.clone(),
                parser: None,
                timestamp_spec: Some(timestamp_spec(source)),
                dimensions_spec: Some(dimensions_spec(source)),
                metrics_spec: metrics_spec(source),
                granularity_spec: granularity_spec(source, Some(interval), Some(true)),
            },
            io_config: IoConfig::IndexParallel {
                input_source: json!({
                    "type": "druid",
                    "dataSource": source.data_source,
                    "interval": interval,
                }),
            },
            tuning_config: TuningConfig {
                kind: "index_parallel".to_string(),
                partitions_spec: Some(partitions),
                index_spec: Some(index_spec(source)),
                options,
            },
        },
    }
}

fn build_merge(source: &SourceConfig, interval: &Interval) -> JobDocument {
    JobDocument::Compact(CompactTask {
        data_source: source.data_source.clone(),
        io_config: IoConfig::Compact {
            input_spec: json!({ "type": "interval", "interval": interval }),
        },
        dimensions_spec: dimensions_spec(source),
        metrics_spec: metrics_spec(source),
        granularity_spec: granularity_spec(source, None, None),
        tuning_config: TuningConfig {
            kind: "index_parallel".to_string(),
            partitions_spec: Some(PartitionsSpec::for_output(
                &source.output,
                PartitionsSpec::Dynamic,
            )),
            index_spec: Some(index_spec(source)),
            options: Map::new(),
        },
    })
}

fn build_unshard(source: &SourceConfig, interval: &Interval) -> JobDocument {
    let mut options = Map::new();
    options.insert("maxRowsInMemory".into(), json!(400_000));

    JobDocument::Index {
        spec: IngestionSpec {
            data_schema: DataSchema {
                data_source: source.data_source.clone(),
                parser: None,
                timestamp_spec: None,
                dimensions_spec: None,
                metrics_spec: metrics_spec(source),
                granularity_spec: granularity_spec(source, Some(interval), None),
            },
            io_config: IoConfig::Index {
                firehose: json!({
                    "type": "ingestSegment",
                    "dataSource": source.data_source,
                    "interval": interval,
                    "dimensions": source.dimensions,
                }),
            },
            tuning_config: TuningConfig {
                kind: "index".to_string(),
                partitions_spec: Some(PartitionsSpec::for_output(
                    &source.output,
                    PartitionsSpec::Dynamic,
                )),
                index_spec: None,
                options,
            },
        },
    }
}

fn timestamp_spec(source: &SourceConfig) -> TimestampSpec {
    TimestampSpec {
        column: source.input.timestamp_column.clone(),
        format: source.input.timestamp_format.clone(),
    }
}

fn dimensions_spec(source: &SourceConfig) -> DimensionsSpec {
    DimensionsSpec {
        dimensions: source.dimensions.clone(),
        spatial_dimensions: source.spatial_dimensions.clone(),
    }
}

/// Declared metrics followed by the events sum
///
/// A declared metric named `events` is replaced: the events column is always
/// a sum so that stored counts compare against raw counts.
fn metrics_spec(source: &SourceConfig) -> Vec<MetricSpec> {
    source
        .metrics
        .iter()
        .filter(|(name, _)| name.as_str() != EVENTS_METRIC)
        .map(|(name, aggregator)| MetricSpec {
            kind: aggregator.clone(),
            name: name.clone(),
            field_name: name.clone(),
        })
        .chain(std::iter::once(MetricSpec {
            kind: "longSum".to_string(),
            name: EVENTS_METRIC.to_string(),
            field_name: EVENTS_METRIC.to_string(),
        }))
        .collect()
}

fn granularity_spec(
    source: &SourceConfig,
    interval: Option<&Interval>,
    rollup: Option<bool>,
) -> GranularitySpec {
    GranularitySpec {
        segment_granularity: source.output.segment_granularity,
        query_granularity: source.output.query_granularity,
        intervals: interval.map(|i| vec![*i]),
        rollup,
    }
}

fn index_spec(source: &SourceConfig) -> Value {
    json!({
        "bitmap": { "type": source.output.bitmap.as_deref().unwrap_or(DEFAULT_BITMAP) },
        "longEncoding": "auto",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceCatalog;

    fn source(output: &str) -> SourceConfig {
        let raw = format!(
            r#"{{ "svc/pv": {{
                "input": {{ "roots": ["/raw/pv"] }},
                "dimensions": ["country"],
                "metrics": {{ "revenue": "doubleSum", "events": "count" }},
                "output": {output}
            }} }}"#
        );
        let catalog = SourceCatalog::from_json_str(&raw).unwrap();
        catalog.get("svc/pv").unwrap().as_ref().clone()
    }

    fn hour() -> Interval {
        "2021-01-01T00:00:00Z/2021-01-01T01:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_partition_precedence() {
        let spec = |output: &str| {
            let doc = build(JobKind::Reindex, &source(output), &hour(), &["p".to_string()])
                .unwrap()
                .to_json()
                .unwrap();
            doc["spec"]["tuningConfig"]["partitionsSpec"].clone()
        };
        assert_eq!(
            spec(r#"{ "numShards": 4 }"#),
            json!({ "type": "hashed", "numShards": 4 })
        );
        assert_eq!(
            spec(r#"{ "targetPartitionSize": 1000 }"#),
            json!({ "type": "hashed", "targetPartitionSize": 1000 })
        );
        assert_eq!(
            spec(r#"{ "numShards": 4, "targetPartitionSize": 1000 }"#),
            json!({ "type": "hashed", "numShards": 4 })
        );
        assert_eq!(spec("{}"), json!({ "type": "none" }));
    }

    #[test]
    fn test_parallel_defaults_to_dynamic() {
        let doc = build(JobKind::Compact, &source("{}"), &hour(), &[])
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(doc["type"], "index_parallel");
        assert_eq!(
            doc["spec"]["tuningConfig"]["partitionsSpec"],
            json!({ "type": "dynamic" })
        );
        assert!(doc["spec"]["tuningConfig"].get("forceGuaranteedRollup").is_none());
        assert_eq!(doc["spec"]["ioConfig"]["inputSource"]["type"], "druid");
    }

    #[test]
    fn test_events_metric_is_always_a_long_sum() {
        let doc = build(JobKind::Reindex, &source("{}"), &hour(), &["p".to_string()])
            .unwrap()
            .to_json()
            .unwrap();
        let metrics = doc["spec"]["dataSchema"]["metricsSpec"].as_array().unwrap().clone();
        assert_eq!(
            metrics,
            vec![
                json!({ "type": "doubleSum", "name": "revenue", "fieldName": "revenue" }),
                json!({ "type": "longSum", "name": "events", "fieldName": "events" }),
            ]
        );
    }

    #[test]
    fn test_reindex_document_shape() {
        let doc = build(
            JobKind::Reindex,
            &source("{}"),
            &hour(),
            &["memory://a/*.gz".to_string(), "memory://b/*.gz".to_string()],
        )
        .unwrap()
        .to_json()
        .unwrap();
        assert_eq!(doc["type"], "index_hadoop");
        assert_eq!(
            doc["spec"]["dataSchema"]["granularitySpec"]["intervals"],
            json!(["2021-01-01T00:00:00Z/2021-01-01T01:00:00Z"])
        );
        assert_eq!(doc["spec"]["dataSchema"]["granularitySpec"]["segmentGranularity"], "hour");
        assert_eq!(doc["spec"]["dataSchema"]["granularitySpec"]["queryGranularity"], "minute");
        assert_eq!(
            doc["spec"]["ioConfig"]["inputSpec"]["paths"],
            "memory://a/*.gz,memory://b/*.gz"
        );
        assert_eq!(
            doc["spec"]["dataSchema"]["parser"]["parseSpec"]["timestampSpec"]["format"],
            "ruby"
        );
    }

    #[test]
    fn test_reindex_without_inputs_is_rejected() {
        assert!(build(JobKind::Reindex, &source("{}"), &hour(), &[]).is_err());
    }

    #[test]
    fn test_merge_and_unshard_documents() {
        let merge = build(JobKind::Merge, &source("{}"), &hour(), &[])
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(merge["type"], "compact");
        assert_eq!(merge["dataSource"], "pv");
        assert_eq!(merge["ioConfig"]["inputSpec"]["interval"], hour().to_string());
        assert!(merge["granularitySpec"].get("intervals").is_none());

        let unshard = build(JobKind::Unshard, &source("{}"), &hour(), &[])
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(unshard["type"], "index");
        assert_eq!(unshard["spec"]["ioConfig"]["firehose"]["type"], "ingestSegment");
        assert_eq!(unshard.as_object().unwrap().len(), 2);
    }
}
