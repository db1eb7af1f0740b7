//! Submission and tracking of a decision queue

use super::spec;
use super::{DuplicateJobRegistry, Job, OverlordClient, TaskStatus};
use crate::config::{RunConfig, SourceCatalog};
use crate::planner::JobDecision;
use crate::Result;

use futures::future::join_all;
use metrics::{counter, gauge};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of jobs per run, 0 for no limit
    pub limit: usize,
    /// Newest decisions first
    pub reverse: bool,
    /// Render documents instead of submitting
    pub dry_run: bool,
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            reverse: false,
            dry_run: false,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl From<&RunConfig> for RunnerConfig {
    fn from(config: &RunConfig) -> Self {
        Self {
            limit: config.limit,
            reverse: config.reverse,
            dry_run: config.dry_run,
            poll_interval: config.poll_interval,
        }
    }
}

/// What happened to a decision queue
#[derive(Debug, Default)]
pub struct RunReport {
    /// Decisions handed to the runner
    pub planned: usize,
    /// Documents rendered in dry-run mode
    pub rendered: Vec<Value>,
    /// Ids of accepted jobs, in submission order
    pub submitted: Vec<String>,
    /// Decisions skipped because an identical job is already active
    pub skipped: usize,
    /// Decisions whose document could not be built or submitted
    pub failed: usize,
    /// Terminal status of every job that finished while waiting
    pub finished: Vec<(String, TaskStatus)>,
    /// Whether waiting was cut short
    pub cancelled: bool,
}

/// Result of waiting on submitted jobs
#[derive(Debug, Default)]
pub struct WaitOutcome {
    pub finished: Vec<Job>,
    pub pending: Vec<Job>,
    pub cancelled: bool,
}

pub struct JobRunner {
    client: Arc<OverlordClient>,
    registry: Arc<DuplicateJobRegistry>,
    sources: Arc<SourceCatalog>,
    config: RunnerConfig,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(
        client: Arc<OverlordClient>,
        registry: Arc<DuplicateJobRegistry>,
        sources: Arc<SourceCatalog>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            client,
            registry,
            sources,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelling [`JobRunner::wait_all`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Order, limit, deduplicate and submit `decisions`, then wait for the jobs
    pub async fn run(&self, decisions: Vec<JobDecision>) -> Result<RunReport> {
        let mut report = RunReport {
            planned: decisions.len(),
            ..RunReport::default()
        };
        gauge!("warden_jobs_scheduled", "service" => crate::telemetry::service())
            .set(decisions.len() as f64);

        let mut queue = decisions;
        if self.config.reverse {
            queue.reverse();
        }
        if self.config.limit > 0 && queue.len() > self.config.limit {
            info!(
                planned = queue.len(),
                limit = self.config.limit,
                "Truncating job queue"
            );
            queue.truncate(self.config.limit);
        }

        let mut jobs = Vec::with_capacity(queue.len());
        for decision in queue {
            let source = self.sources.get(&decision.topic)?;
            let document =
                match spec::build(decision.kind, &source, &decision.interval, &decision.inputs) {
                    Ok(document) => document,
                    Err(e) => {
                        error!(
                            data_source = %decision.data_source,
                            interval = %decision.interval,
                            error = %e,
                            "Cannot build job document"
                        );
                        report.failed += 1;
                        continue;
                    }
                };

            if self.config.dry_run {
                let rendered = document.to_json()?;
                info!(
                    kind = %decision.kind,
                    data_source = %decision.data_source,
                    interval = %decision.interval,
                    document = %rendered,
                    "Dry run, not submitting"
                );
                report.rendered.push(rendered);
                continue;
            }

            if self
                .registry
                .exists(&decision.data_source, &decision.interval)
                .await?
            {
                info!(
                    data_source = %decision.data_source,
                    interval = %decision.interval,
                    "Identical job already active, skipping"
                );
                counter!(
                    "warden_jobs_skipped_total",
                    "service" => crate::telemetry::service(),
                    "reason" => "duplicate"
                )
                .increment(1);
                report.skipped += 1;
                continue;
            }

            let kind = decision.kind;
            let mut job = Job::new(decision, document);
            match job.submit(&self.client).await {
                Ok(id) => {
                    counter!(
                        "warden_jobs_submitted_total",
                        "service" => crate::telemetry::service(),
                        "run_id" => crate::telemetry::run_id(),
                        "kind" => kind.as_str()
                    )
                    .increment(1);
                    report.submitted.push(id.to_string());
                    jobs.push(job);
                }
                Err(e) => {
                    error!(
                        kind = %kind,
                        data_source = %job.decision().data_source,
                        interval = %job.decision().interval,
                        error = %e,
                        "Job submission failed"
                    );
                    report.failed += 1;
                }
            }
        }

        if !jobs.is_empty() {
            let outcome = self.wait_all(jobs).await;
            report.cancelled = outcome.cancelled;
            report.finished = outcome
                .finished
                .iter()
                .filter_map(|job| match job.state() {
                    super::JobState::Finished { id, status } => Some((id.clone(), status.clone())),
                    _ => None,
                })
                .collect();
        }
        Ok(report)
    }

    /// Poll every job on a fixed period until none is running
    ///
    /// Jobs whose status cannot be read are dropped. Cancelling the shutdown
    /// token stops waiting and returns the jobs still pending.
    pub async fn wait_all(&self, jobs: Vec<Job>) -> WaitOutcome {
        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending = jobs;
        let mut finished = Vec::new();
        while !pending.is_empty() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.cancelled() => {
                    warn!(remaining = pending.len(), "Stopped waiting for jobs");
                    return WaitOutcome { finished, pending, cancelled: true };
                }
            }

            let polls = join_all(pending.iter_mut().map(|job| job.poll(&self.client))).await;
            let mut still_running = Vec::with_capacity(pending.len());
            for (job, poll) in pending.into_iter().zip(polls) {
                match poll {
                    Ok(false) => still_running.push(job),
                    Ok(true) | Err(_) => finished.push(job),
                }
            }
            pending = still_running;

            let ids: Vec<&str> = pending.iter().filter_map(Job::id).collect();
            info!(remaining = pending.len(), ids = ?ids, "Waiting for jobs");
        }
        WaitOutcome {
            finished,
            pending,
            cancelled: false,
        }
    }
}
