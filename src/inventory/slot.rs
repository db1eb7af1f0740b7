//! Raw hour slots

use crate::time::{Granularity, Interval};

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Field of a raw file name (split on `.`) carrying its event count
const EVENT_COUNT_FIELD: usize = 3;

/// One hour of raw input, as found on a single replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Hour-aligned start of the slot
    pub time: DateTime<Utc>,
    /// URI of the replica the files were listed from
    pub origin: String,
    /// Object paths of every data file of the hour
    pub paths: BTreeSet<String>,
    /// Sum of the event counts encoded in the file names
    pub events: u64,
}

impl Slot {
    pub fn new(time: DateTime<Utc>, origin: impl Into<String>) -> Self {
        Self {
            time: Granularity::Hour.floor(time),
            origin: origin.into(),
            paths: BTreeSet::new(),
            events: 0,
        }
    }

    /// Build a slot from the data files of one hour
    pub fn from_files(
        time: DateTime<Utc>,
        origin: impl Into<String>,
        files: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut slot = Self::new(time, origin);
        for file in files {
            slot.add_file(file);
        }
        slot
    }

    /// Add a file; a path seen twice is counted once
    pub fn add_file(&mut self, path: String) {
        let events = decode_event_count(&path);
        if self.paths.insert(path) {
            self.events += events;
        }
    }

    pub fn interval(&self) -> Interval {
        Granularity::Hour.bucket(self.time)
    }

    pub fn is_empty(&self) -> bool {
        self.events == 0
    }

    /// Whether any file of the slot lives below `prefix`
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_start_matches('/').trim_end_matches('/');
        self.paths.iter().any(|path| {
            path.strip_prefix(prefix)
                .map(|rest| rest.is_empty() || rest.starts_with('/'))
                .unwrap_or(false)
        })
    }

    /// Glob patterns covering the slot, one per directory and extension
    ///
    /// Job specs and log lines use these instead of the full file list.
    pub fn patterns(&self) -> Vec<String> {
        let patterns: BTreeSet<String> = self
            .paths
            .iter()
            .map(|path| {
                let (dir, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
                let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or(name);
                if dir.is_empty() {
                    format!("*.{}", ext)
                } else {
                    format!("{}/*.{}", dir, ext)
                }
            })
            .collect();
        patterns.into_iter().collect()
    }

    /// Patterns qualified with the replica URI
    pub fn qualified_patterns(&self) -> Vec<String> {
        self.patterns()
            .into_iter()
            .map(|pattern| qualify(&self.origin, &pattern))
            .collect()
    }
}

/// Join a replica URI and an object path
pub fn qualify(origin: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if origin.ends_with("://") {
        return format!("{}{}", origin, path);
    }
    format!("{}/{}", origin.trim_end_matches('/'), path)
}

/// Event count encoded in a raw file name
///
/// Names look like `topic.partition.offset.<events>.gz`. Anything that does
/// not follow the convention counts as zero events.
pub fn decode_event_count(path: &str) -> u64 {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.')
        .nth(EVENT_COUNT_FIELD)
        .and_then(|field| field.parse::<u64>().ok())
        .unwrap_or(0)
}
