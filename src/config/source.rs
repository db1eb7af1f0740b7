//! Typed per-source configuration
//!
//! The catalog file maps `"<service>/<dataSource>"` to a source entry. Every
//! entry is read as a partial [`SourceEntry`], merged field by field over the
//! optional `"_defaults"` entry, and only then resolved into a fully typed
//! [`SourceConfig`]. Resolution validates granularities and the directory
//! layout so that bad configuration fails before any I/O happens.

use crate::time::Granularity;
use crate::{Error, Result};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Reserved catalog key holding defaults for every other entry
pub const DEFAULTS_KEY: &str = "_defaults";

/// Column every job spec aggregates raw event counts into
pub const EVENTS_METRIC: &str = "events";

const DEFAULT_TIMESTAMP_COLUMN: &str = "timestamp";
const DEFAULT_TIMESTAMP_FORMAT: &str = "ruby";
const DEFAULT_LAYOUT: &str = "hourly/%Y/%m/%d/%H";
const DEFAULT_SUFFIX: &str = ".gz";

/// Fully resolved configuration of one topic / data source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    /// Catalog key, `service/dataSource`
    pub topic: String,
    /// Service (cluster) name, the part of the key before the first `/`
    pub service: String,
    /// Data source name, the part of the key after the last `/`
    pub data_source: String,
    pub input: InputConfig,
    pub dimensions: Vec<String>,
    pub spatial_dimensions: Vec<serde_json::Value>,
    /// Metric name to aggregator type
    pub metrics: BTreeMap<String, String>,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputConfig {
    /// Raw roots listed for every hour
    pub roots: Vec<String>,
    /// Upstream prefixes that must be present before an hour counts as landed
    pub required_prefixes: Vec<String>,
    pub timestamp_column: String,
    pub timestamp_format: String,
    /// Validation never looks before this instant
    pub epoch: Option<DateTime<Utc>>,
    /// strftime layout of the hour directory below each root
    pub layout: String,
    /// Suffix identifying data files
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub segment_granularity: Granularity,
    pub query_granularity: Granularity,
    pub num_shards: Option<u32>,
    pub target_partition_size: Option<u64>,
    pub partition_dimensions: Option<Vec<String>>,
    pub bitmap: Option<String>,
    pub max_shards: Option<u32>,
}

impl SourceConfig {
    /// Declared metrics plus the event-count column
    pub fn expected_metrics(&self) -> BTreeSet<String> {
        let mut metrics: BTreeSet<String> = self.metrics.keys().cloned().collect();
        metrics.insert(EVENTS_METRIC.to_string());
        metrics
    }

    pub fn expected_dimensions(&self) -> BTreeSet<String> {
        self.dimensions.iter().cloned().collect()
    }

    /// Minimum number of segments per granularity window, if configured
    pub fn shard_threshold(&self) -> Option<u32> {
        self.output.max_shards.or(self.output.num_shards)
    }
}

/// Partial source entry as written in the catalog file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEntry {
    #[serde(default)]
    pub input: Option<InputEntry>,
    #[serde(default)]
    pub dimensions: Option<Vec<String>>,
    #[serde(default, alias = "spacialDimensions")]
    pub spatial_dimensions: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub metrics: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub output: Option<OutputEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEntry {
    #[serde(default, alias = "camus")]
    pub roots: Option<Vec<String>>,
    #[serde(default, alias = "gobblin")]
    pub required: Option<OneOrMany>,
    #[serde(default)]
    pub timestamp: Option<TimestampEntry>,
    #[serde(default, alias = "epoc")]
    pub epoch: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimestampEntry {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEntry {
    #[serde(default)]
    pub segment_granularity: Option<String>,
    #[serde(default)]
    pub query_granularity: Option<String>,
    #[serde(default)]
    pub num_shards: Option<i64>,
    #[serde(default)]
    pub target_partition_size: Option<i64>,
    #[serde(default)]
    pub partition_dimensions: Option<Vec<String>>,
    #[serde(default)]
    pub bitmap: Option<String>,
    #[serde(default)]
    pub max_shards: Option<i64>,
}

/// The `_defaults` entry shares the partial shape of every other entry
pub type SourceDefaults = SourceEntry;

/// A single string or a list of strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

impl SourceEntry {
    /// Fill every field this entry leaves unset from `defaults`
    pub fn merged_over(self, defaults: &SourceDefaults) -> SourceEntry {
        SourceEntry {
            input: merge_nested(self.input, defaults.input.as_ref(), InputEntry::merged_over),
            dimensions: self.dimensions.or_else(|| defaults.dimensions.clone()),
            spatial_dimensions: self
                .spatial_dimensions
                .or_else(|| defaults.spatial_dimensions.clone()),
            metrics: self.metrics.or_else(|| defaults.metrics.clone()),
            output: merge_nested(self.output, defaults.output.as_ref(), OutputEntry::merged_over),
        }
    }

    /// Apply built-in defaults and validate
    pub fn resolve(self, topic: &str) -> Result<SourceConfig> {
        let (service, data_source) = split_topic(topic);
        let input = self.input.unwrap_or_default();
        let output = self.output.unwrap_or_default();

        let roots: Vec<String> = input
            .roots
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.trim().trim_end_matches('/').to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if roots.is_empty() {
            return Err(Error::Config(format!(
                "{} -> input.roots must be a non-empty array of raw paths",
                topic
            )));
        }

        let mut required_prefixes: Vec<String> = input
            .required
            .map(OneOrMany::into_vec)
            .unwrap_or_default();
        required_prefixes.sort();
        required_prefixes.dedup();

        let epoch = match input.epoch {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| {
                        Error::Config(format!("{} -> input.epoch '{}' is invalid: {}", topic, raw, e))
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let layout = input.layout.unwrap_or_else(|| DEFAULT_LAYOUT.to_string());
        validate_layout(topic, &layout)?;

        let timestamp = input.timestamp.unwrap_or_default();

        let segment_granularity = Granularity::parse_segment(
            output.segment_granularity.as_deref().unwrap_or("hour"),
        )?;
        let query_granularity =
            Granularity::parse_query(output.query_granularity.as_deref().unwrap_or("minute"))?;

        Ok(SourceConfig {
            topic: topic.to_string(),
            service,
            data_source,
            input: InputConfig {
                roots,
                required_prefixes,
                timestamp_column: timestamp
                    .column
                    .unwrap_or_else(|| DEFAULT_TIMESTAMP_COLUMN.to_string()),
                timestamp_format: timestamp
                    .format
                    .unwrap_or_else(|| DEFAULT_TIMESTAMP_FORMAT.to_string()),
                epoch,
                layout,
                suffix: input.suffix.unwrap_or_else(|| DEFAULT_SUFFIX.to_string()),
            },
            dimensions: self.dimensions.unwrap_or_default(),
            spatial_dimensions: self.spatial_dimensions.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
            output: OutputConfig {
                segment_granularity,
                query_granularity,
                num_shards: shard_count(topic, "numShards", output.num_shards)?,
                target_partition_size: positive(output.target_partition_size).map(|n| n as u64),
                partition_dimensions: output.partition_dimensions.filter(|d| !d.is_empty()),
                bitmap: output.bitmap,
                max_shards: shard_count(topic, "maxShards", output.max_shards)?,
            },
        })
    }
}

impl InputEntry {
    fn merged_over(self, defaults: &InputEntry) -> InputEntry {
        InputEntry {
            roots: self.roots.or_else(|| defaults.roots.clone()),
            required: self.required.or_else(|| defaults.required.clone()),
            timestamp: merge_nested(
                self.timestamp,
                defaults.timestamp.as_ref(),
                |own, fallback| TimestampEntry {
                    column: own.column.or_else(|| fallback.column.clone()),
                    format: own.format.or_else(|| fallback.format.clone()),
                },
            ),
            epoch: self.epoch.or_else(|| defaults.epoch.clone()),
            layout: self.layout.or_else(|| defaults.layout.clone()),
            suffix: self.suffix.or_else(|| defaults.suffix.clone()),
        }
    }
}

impl OutputEntry {
    fn merged_over(self, defaults: &OutputEntry) -> OutputEntry {
        OutputEntry {
            segment_granularity: self
                .segment_granularity
                .or_else(|| defaults.segment_granularity.clone()),
            query_granularity: self
                .query_granularity
                .or_else(|| defaults.query_granularity.clone()),
            num_shards: self.num_shards.or(defaults.num_shards),
            target_partition_size: self.target_partition_size.or(defaults.target_partition_size),
            partition_dimensions: self
                .partition_dimensions
                .or_else(|| defaults.partition_dimensions.clone()),
            bitmap: self.bitmap.or_else(|| defaults.bitmap.clone()),
            max_shards: self.max_shards.or(defaults.max_shards),
        }
    }
}

fn merge_nested<T: Clone>(
    own: Option<T>,
    fallback: Option<&T>,
    merge: impl FnOnce(T, &T) -> T,
) -> Option<T> {
    match (own, fallback) {
        (Some(own), Some(fallback)) => Some(merge(own, fallback)),
        (Some(own), None) => Some(own),
        (None, fallback) => fallback.cloned(),
    }
}

fn positive(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v > 0)
}

fn shard_count(topic: &str, key: &str, value: Option<i64>) -> Result<Option<u32>> {
    positive(value)
        .map(|n| {
            u32::try_from(n).map_err(|_| {
                Error::Config(format!("{} -> output.{} {} is out of range", topic, key, n))
            })
        })
        .transpose()
}

fn split_topic(topic: &str) -> (String, String) {
    let service = topic.split('/').next().unwrap_or(topic).to_string();
    let data_source = topic.rsplit('/').next().unwrap_or(topic).to_string();
    (service, data_source)
}

fn validate_layout(topic: &str, layout: &str) -> Result<()> {
    if StrftimeItems::new(layout).any(|item| matches!(item, Item::Error)) {
        return Err(Error::Config(format!(
            "{} -> input.layout '{}' is not a valid strftime pattern",
            topic, layout
        )));
    }
    Ok(())
}

/// All configured sources, keyed by topic
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    sources: BTreeMap<String, Arc<SourceConfig>>,
}

impl SourceCatalog {
    /// Load and resolve a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read sources file {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_json_str(&raw)?;
        info!(
            path = %path.display(),
            sources = catalog.len(),
            "Loaded source catalog"
        );
        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut entries: BTreeMap<String, SourceEntry> = serde_json::from_str(raw)?;
        let defaults = entries.remove(DEFAULTS_KEY).unwrap_or_default();
        Self::from_entries(&defaults, entries)
    }

    pub fn from_entries(
        defaults: &SourceDefaults,
        entries: impl IntoIterator<Item = (String, SourceEntry)>,
    ) -> Result<Self> {
        let mut sources = BTreeMap::new();
        for (topic, entry) in entries {
            let resolved = entry.merged_over(defaults).resolve(&topic)?;
            sources.insert(topic, Arc::new(resolved));
        }
        Ok(Self { sources })
    }

    pub fn insert(&mut self, source: SourceConfig) {
        self.sources.insert(source.topic.clone(), Arc::new(source));
    }

    pub fn get(&self, topic: &str) -> Result<Arc<SourceConfig>> {
        self.sources
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown topic '{}'", topic)))
    }

    /// Resolve the requested topics, or every topic when none are requested
    pub fn select(&self, topics: &[String]) -> Result<Vec<Arc<SourceConfig>>> {
        let selected: Vec<Arc<SourceConfig>> = if topics.is_empty() {
            self.sources.values().cloned().collect()
        } else {
            topics
                .iter()
                .map(|t| self.get(t))
                .collect::<Result<Vec<_>>>()?
        };
        if selected.is_empty() {
            return Err(Error::Config("topic list is empty".to_string()));
        }
        Ok(selected)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
