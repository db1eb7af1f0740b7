//! Raw input inventory
//!
//! Lists the hour directories of every configured raw root and turns them
//! into [`Slot`]s. Raw data may be replicated across several stores; each
//! hour is listed on every replica and the replica holding the most events
//! wins, so a lagging mirror never hides data that already landed elsewhere.

mod slot;

pub use slot::{decode_event_count, qualify, Slot};

use crate::config::SourceConfig;
use crate::time::{Granularity, Interval};
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::try_join_all;
use futures::{StreamExt, TryStreamExt};
use metrics::counter;
use object_store::{path::Path, ObjectStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One replica of the raw input store
#[derive(Clone)]
pub struct RawStore {
    store: Arc<dyn ObjectStore>,
    uri: String,
}

impl RawStore {
    pub fn new(store: Arc<dyn ObjectStore>, uri: impl Into<String>) -> Self {
        Self {
            store,
            uri: uri.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl std::fmt::Debug for RawStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStore").field("uri", &self.uri).finish()
    }
}

/// Slot listing over one or more raw replicas, cached for the run
pub struct RawInventory {
    replicas: Vec<RawStore>,
    concurrency: usize,
    /// Write-once cache keyed by topic and scanned interval
    slots: DashMap<(String, Interval), Arc<Vec<Slot>>>,
    /// Topics whose configured root turned out to be a file
    rejected: HashMap<String, String>,
}

impl RawInventory {
    pub fn new(replicas: Vec<RawStore>, concurrency: usize) -> Result<Self> {
        if replicas.is_empty() {
            return Err(Error::Config("no raw store configured".to_string()));
        }
        Ok(Self {
            replicas,
            concurrency: concurrency.max(1),
            slots: DashMap::new(),
            rejected: HashMap::new(),
        })
    }

    /// Probe every replica against the roots of `sources`
    ///
    /// Unreachable replicas are dropped with a warning; the inventory fails
    /// with [`Error::Connectivity`] only when none is left. A root that is a
    /// file only fails its own topic: listing that topic later returns
    /// [`Error::NotADirectory`].
    pub async fn connect(
        replicas: Vec<RawStore>,
        concurrency: usize,
        sources: &[Arc<SourceConfig>],
    ) -> Result<Self> {
        let mut reachable = Vec::with_capacity(replicas.len());
        let mut rejected = HashMap::new();
        let mut last_error = None;
        for replica in replicas {
            match Self::probe(&replica, sources).await {
                Ok(files) => {
                    rejected.extend(files);
                    reachable.push(replica);
                }
                Err(Error::Connectivity(msg)) => {
                    warn!(replica = %replica.uri, error = %msg, "Raw replica unreachable");
                    last_error = Some(msg);
                }
                Err(e) => return Err(e),
            }
        }
        if reachable.is_empty() {
            return Err(Error::Connectivity(
                last_error.unwrap_or_else(|| "no raw replica configured".to_string()),
            ));
        }
        let mut inventory = Self::new(reachable, concurrency)?;
        inventory.rejected = rejected;
        Ok(inventory)
    }

    /// Topics of `sources` with a root that is a file on `replica`
    async fn probe(
        replica: &RawStore,
        sources: &[Arc<SourceConfig>],
    ) -> Result<Vec<(String, String)>> {
        let mut rejected = Vec::new();
        for source in sources {
            for root in &source.input.roots {
                let path = Path::from(root.as_str());
                match replica.store.head(&path).await {
                    Ok(_) => {
                        let root = qualify(&replica.uri, root);
                        warn!(topic = %source.topic, root = %root, "Raw root is not a directory");
                        rejected.push((source.topic.clone(), root));
                        break;
                    }
                    Err(object_store::Error::NotFound { .. }) => {}
                    Err(e) => {
                        return Err(Error::Connectivity(format!(
                            "{}: {}",
                            qualify(&replica.uri, root),
                            e
                        )))
                    }
                }
                let listing = replica
                    .store
                    .list_with_delimiter(Some(&path))
                    .await
                    .map_err(|e| {
                        Error::Connectivity(format!("{}: {}", qualify(&replica.uri, root), e))
                    })?;
                if listing.objects.is_empty() && listing.common_prefixes.is_empty() {
                    warn!(
                        topic = %source.topic,
                        root = %qualify(&replica.uri, root),
                        "Raw root is empty"
                    );
                }
            }
        }
        Ok(rejected)
    }

    pub fn replicas(&self) -> &[RawStore] {
        &self.replicas
    }

    /// Non-empty slots of `source` inside `interval`, cached per run
    pub async fn slots(&self, source: &SourceConfig, interval: &Interval) -> Result<Arc<Vec<Slot>>> {
        let key = (source.topic.clone(), *interval);
        if let Some(hit) = self.slots.get(&key) {
            return Ok(hit.value().clone());
        }
        let scanned = Arc::new(self.scan(source, interval).await?);
        Ok(self.slots.entry(key).or_insert(scanned).value().clone())
    }

    /// List every hour of `interval` without touching the cache
    pub async fn scan(&self, source: &SourceConfig, interval: &Interval) -> Result<Vec<Slot>> {
        if let Some(root) = self.rejected.get(&source.topic) {
            return Err(Error::NotADirectory(root.clone()));
        }
        let hours: Vec<DateTime<Utc>> = Granularity::Hour
            .buckets(interval)
            .map(|bucket| bucket.start())
            .collect();

        let slots: Vec<Slot> = futures::stream::iter(hours)
            .map(|hour| self.best_slot(source, hour))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let total = slots.len();
        let slots: Vec<Slot> = slots.into_iter().filter(|slot| !slot.is_empty()).collect();
        debug!(
            topic = %source.topic,
            interval = %interval,
            hours = total,
            non_empty = slots.len(),
            "Scanned raw inventory"
        );
        Ok(slots)
    }

    /// The replica slot with the most events for `hour`
    async fn best_slot(&self, source: &SourceConfig, hour: DateTime<Utc>) -> Result<Slot> {
        let candidates =
            try_join_all(self.replicas.iter().map(|r| self.slot_in(r, source, hour))).await?;

        let best = candidates
            .iter()
            .fold(None::<&Slot>, |best, candidate| match best {
                Some(current) if candidate.events <= current.events => Some(current),
                _ => Some(candidate),
            })
            .cloned()
            .unwrap_or_else(|| Slot::new(hour, ""));

        for other in candidates.iter().filter(|c| c.events != best.events) {
            counter!(
                "warden_replica_divergence_total",
                "service" => crate::telemetry::service(),
                "topic" => source.topic.clone()
            )
            .increment(1);
            warn!(
                topic = %source.topic,
                slot = %best.time,
                chosen = %best.origin,
                chosen_events = best.events,
                replica = %other.origin,
                replica_events = other.events,
                "Raw replicas diverge"
            );
        }
        if !best.is_empty() {
            info!(
                topic = %source.topic,
                slot = %best.time,
                events = best.events,
                origin = %best.origin,
                patterns = ?best.patterns(),
                "Found raw slot"
            );
        }
        Ok(best)
    }

    /// Slot of `hour` as seen by a single replica
    async fn slot_in(
        &self,
        replica: &RawStore,
        source: &SourceConfig,
        hour: DateTime<Utc>,
    ) -> Result<Slot> {
        let relative = hour.format(&source.input.layout).to_string();
        let listings = try_join_all(source.input.roots.iter().map(|root| {
            let dir = Path::from(format!("{}/{}", root, relative));
            let store = replica.store.clone();
            async move {
                match store.list_with_delimiter(Some(&dir)).await {
                    Ok(listing) => Ok(listing
                        .objects
                        .into_iter()
                        .map(|meta| meta.location.to_string())
                        .collect::<Vec<_>>()),
                    Err(object_store::Error::NotFound { .. }) => {
                        debug!(dir = %dir, "No events");
                        Ok(Vec::new())
                    }
                    Err(e) => Err(Error::from(e)),
                }
            }
        }))
        .await?;

        let files = listings
            .into_iter()
            .flatten()
            .filter(|path| path.ends_with(&source.input.suffix));
        Ok(Slot::from_files(hour, replica.uri.clone(), files))
    }
}
