//! Published segments and their live statistics
//!
//! Descriptors come from a [`SegmentMetadataStore`]; event counts and column
//! types are fetched lazily from the [`Broker`] and memoized on the
//! [`Segment`] for the rest of the run.

mod broker;
mod descriptor;
mod store;

pub use broker::{
    column_metadata_query, event_count_query, parse_column_metadata, parse_event_count, Broker,
    ColumnMetadata, HttpBroker,
};
pub use descriptor::{SegmentDescriptor, ShardKind, ShardSpec};
pub use store::{CoordinatorSegmentStore, LocalSegmentStore, SegmentMetadataStore};

use crate::time::Interval;
use crate::Result;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// A published segment with lazily fetched statistics
pub struct Segment {
    descriptor: SegmentDescriptor,
    broker: Arc<dyn Broker>,
    events: Mutex<HashMap<Interval, u64>>,
    columns: OnceCell<ColumnMetadata>,
}

impl Segment {
    pub fn new(descriptor: SegmentDescriptor, broker: Arc<dyn Broker>) -> Self {
        Self {
            descriptor,
            broker,
            events: Mutex::new(HashMap::new()),
            columns: OnceCell::new(),
        }
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> String {
        self.descriptor.id()
    }

    pub fn data_source(&self) -> &str {
        &self.descriptor.data_source
    }

    pub fn interval(&self) -> Interval {
        self.descriptor.interval
    }

    pub fn version(&self) -> &str {
        &self.descriptor.version
    }

    pub fn dimensions(&self) -> &BTreeSet<String> {
        &self.descriptor.dimensions
    }

    pub fn metrics(&self) -> &BTreeSet<String> {
        &self.descriptor.metrics
    }

    pub fn shard_spec(&self) -> &ShardSpec {
        &self.descriptor.shard_spec
    }

    /// Stored events over `interval`
    ///
    /// A failed query counts as zero events so the slot gets rebuilt.
    pub async fn events(&self, interval: &Interval) -> u64 {
        if let Some(count) = self.events.lock().get(interval) {
            return *count;
        }
        let count = match self
            .broker
            .event_count(&self.descriptor.data_source, interval)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                counter!(
                    "warden_broker_query_failures_total",
                    "service" => crate::telemetry::service(),
                    "query" => "timeseries"
                )
                .increment(1);
                warn!(
                    segment = %self.id(),
                    interval = %interval,
                    error = %e,
                    "Event count query failed, assuming no events"
                );
                0
            }
        };
        *self.events.lock().entry(*interval).or_insert(count)
    }

    /// Column types of the segment's interval
    ///
    /// A failed query yields [`ColumnMetadata::Unavailable`].
    pub async fn column_metadata(&self) -> &ColumnMetadata {
        self.columns
            .get_or_init(|| async {
                match self
                    .broker
                    .column_metadata(&self.descriptor.data_source, &self.descriptor.interval)
                    .await
                {
                    Ok(columns) => columns,
                    Err(e) => {
                        counter!(
                            "warden_broker_query_failures_total",
                            "service" => crate::telemetry::service(),
                            "query" => "segment_metadata"
                        )
                        .increment(1);
                        warn!(
                            segment = %self.id(),
                            error = %e,
                            "Segment metadata query failed"
                        );
                        ColumnMetadata::Unavailable
                    }
                }
            })
            .await
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Used segments per data source, loaded once per run
pub struct SegmentCatalog {
    store: Arc<dyn SegmentMetadataStore>,
    broker: Arc<dyn Broker>,
    loaded: DashMap<String, Arc<[Arc<Segment>]>>,
}

impl SegmentCatalog {
    pub fn new(store: Arc<dyn SegmentMetadataStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            loaded: DashMap::new(),
        }
    }

    /// Every used segment of `data_source`, ordered by interval then version
    pub async fn load_all(&self, data_source: &str) -> Result<Arc<[Arc<Segment>]>> {
        if let Some(hit) = self.loaded.get(data_source) {
            return Ok(hit.value().clone());
        }
        let payloads = self.store.used_segments(data_source).await?;
        let mut segments = payloads
            .iter()
            .map(|payload| {
                SegmentDescriptor::from_payload(payload)
                    .map(|d| Arc::new(Segment::new(d, self.broker.clone())))
            })
            .collect::<Result<Vec<_>>>()?;
        segments.sort_by(|a, b| {
            a.interval()
                .cmp(&b.interval())
                .then_with(|| a.version().cmp(b.version()))
                .then_with(|| {
                    a.shard_spec()
                        .partition_num
                        .cmp(&b.shard_spec().partition_num)
                })
        });
        debug!(data_source, segments = segments.len(), "Loaded used segments");

        let segments: Arc<[Arc<Segment>]> = segments.into();
        Ok(self
            .loaded
            .entry(data_source.to_string())
            .or_insert(segments)
            .value()
            .clone())
    }
}
