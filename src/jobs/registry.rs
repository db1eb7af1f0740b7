//! Active job registry

use super::OverlordClient;
use crate::time::Interval;
use crate::Result;

use futures::{StreamExt, TryStreamExt};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Overlord queue a task was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskListKind {
    Running,
    Pending,
    Waiting,
}

impl TaskListKind {
    pub const ALL: [TaskListKind; 3] = [
        TaskListKind::Running,
        TaskListKind::Pending,
        TaskListKind::Waiting,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            TaskListKind::Running => "runningTasks",
            TaskListKind::Pending => "pendingTasks",
            TaskListKind::Waiting => "waitingTasks",
        }
    }
}

/// A task the overlord currently knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    pub id: String,
    pub data_source: String,
    pub intervals: Vec<Interval>,
    pub kind: TaskListKind,
}

impl ActiveJob {
    fn duplicate_key(&self) -> Option<(&str, Interval)> {
        self.intervals
            .first()
            .map(|interval| (self.data_source.as_str(), *interval))
    }
}

/// Snapshot of running, pending and waiting tasks, fetched once
pub struct DuplicateJobRegistry {
    client: Arc<OverlordClient>,
    concurrency: usize,
    active: OnceCell<Vec<ActiveJob>>,
}

impl DuplicateJobRegistry {
    pub fn new(client: Arc<OverlordClient>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            active: OnceCell::new(),
        }
    }

    /// Active jobs in listing order, each id once
    pub async fn active_jobs(&self) -> Result<&[ActiveJob]> {
        let jobs = self.active.get_or_try_init(|| self.fetch()).await?;
        Ok(jobs.as_slice())
    }

    async fn fetch(&self) -> Result<Vec<ActiveJob>> {
        let mut seen = HashSet::new();
        let mut listed = Vec::new();
        for kind in TaskListKind::ALL {
            for id in self.client.list(kind).await? {
                if seen.insert(id.clone()) {
                    listed.push((id, kind));
                }
            }
        }

        let details: Vec<Option<ActiveJob>> = futures::stream::iter(listed)
            .map(|(id, kind)| {
                let client = self.client.clone();
                async move { client.detail(&id, kind).await }
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let jobs: Vec<ActiveJob> = details.into_iter().flatten().collect();
        info!(active = jobs.len(), "Fetched active overlord tasks");
        Ok(jobs)
    }

    /// Whether a task already covers exactly `interval` of `data_source`
    pub async fn exists(&self, data_source: &str, interval: &Interval) -> Result<bool> {
        Ok(self.active_jobs().await?.iter().any(|job| {
            job.data_source == data_source && job.intervals.iter().any(|i| i == interval)
        }))
    }

    /// Shut down every task but the first one per data source and first interval
    ///
    /// Returns the ids that were shut down.
    pub async fn kill_duplicates(&self) -> Result<Vec<String>> {
        let mut first_seen: HashMap<(&str, Interval), &str> = HashMap::new();
        let mut killed = Vec::new();

        for job in self.active_jobs().await? {
            let Some(key) = job.duplicate_key() else {
                continue;
            };
            let kept = match first_seen.get(&key) {
                Some(kept) => *kept,
                None => {
                    first_seen.insert(key, &job.id);
                    continue;
                }
            };
            info!(
                task = %job.id,
                kept = %kept,
                data_source = %job.data_source,
                interval = %key.1,
                "Shutting down duplicate task"
            );
            if self.shut_down(job).await {
                killed.push(job.id.clone());
            }
        }
        Ok(killed)
    }

    /// Shut down every active task, duplicated or not
    ///
    /// Returns the ids that were shut down; failures are logged and skipped.
    pub async fn kill_all(&self) -> Result<Vec<String>> {
        let mut killed = Vec::new();
        for job in self.active_jobs().await? {
            info!(
                task = %job.id,
                data_source = %job.data_source,
                queue = job.kind.path(),
                "Shutting down task"
            );
            if self.shut_down(job).await {
                killed.push(job.id.clone());
            }
        }
        Ok(killed)
    }

    async fn shut_down(&self, job: &ActiveJob) -> bool {
        match self.client.shutdown(&job.id).await {
            Ok(()) => {
                counter!(
                    "warden_jobs_killed_total",
                    "service" => crate::telemetry::service()
                )
                .increment(1);
                true
            }
            Err(e) => {
                warn!(task = %job.id, error = %e, "Shutdown failed");
                false
            }
        }
    }
}
