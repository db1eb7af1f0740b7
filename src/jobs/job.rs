//! Submitted job state machine

use super::{JobDocument, OverlordClient};
use crate::planner::JobDecision;
use crate::{Error, Result};

use tracing::{info, warn};

/// Status reported by the overlord for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Success,
    Failed,
    Other(String),
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "RUNNING" => TaskStatus::Running,
            "SUCCESS" => TaskStatus::Success,
            "FAILED" => TaskStatus::Failed,
            other => TaskStatus::Other(other.to_string()),
        }
    }

    /// Anything but running is terminal; success and failure are not told apart here
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Running => f.write_str("RUNNING"),
            TaskStatus::Success => f.write_str("SUCCESS"),
            TaskStatus::Failed => f.write_str("FAILED"),
            TaskStatus::Other(raw) => f.write_str(raw),
        }
    }
}

/// Lifecycle of one job
///
/// `Created -> Accepted -> Running -> Finished`, or `Failed` when the
/// overlord rejects a submission or a poll. Leader redirects change the
/// client's endpoint, never the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Created,
    Accepted { id: String },
    Running { id: String },
    Finished { id: String, status: TaskStatus },
    Failed { reason: String },
}

/// One corrective job and its document
#[derive(Debug, Clone)]
pub struct Job {
    decision: JobDecision,
    document: JobDocument,
    state: JobState,
}

impl Job {
    pub fn new(decision: JobDecision, document: JobDocument) -> Self {
        Self {
            decision,
            document,
            state: JobState::Created,
        }
    }

    pub fn decision(&self) -> &JobDecision {
        &self.decision
    }

    pub fn document(&self) -> &JobDocument {
        &self.document
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn id(&self) -> Option<&str> {
        match &self.state {
            JobState::Accepted { id } | JobState::Running { id } | JobState::Finished { id, .. } => {
                Some(id)
            }
            JobState::Created | JobState::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobState::Finished { .. } | JobState::Failed { .. }
        )
    }

    /// Submit the document; only valid from `Created`
    pub async fn submit(&mut self, client: &OverlordClient) -> Result<&str> {
        if self.state != JobState::Created {
            return Err(Error::Protocol(format!(
                "job for {} {} already submitted",
                self.decision.data_source, self.decision.interval
            )));
        }
        match client.submit(&self.document).await {
            Ok(id) => {
                info!(
                    task = %id,
                    kind = %self.decision.kind,
                    data_source = %self.decision.data_source,
                    interval = %self.decision.interval,
                    "Job accepted"
                );
                self.state = JobState::Accepted { id };
                Ok(self.id().unwrap_or_default())
            }
            Err(e) => {
                self.state = JobState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Poll the overlord once; returns whether the job reached a terminal state
    pub async fn poll(&mut self, client: &OverlordClient) -> Result<bool> {
        let id = match &self.state {
            JobState::Accepted { id } | JobState::Running { id } => id.clone(),
            _ => return Ok(self.is_terminal()),
        };
        match client.status(&id).await {
            Ok(status) if status.is_terminal() => {
                info!(task = %id, status = %status, "Job finished");
                self.state = JobState::Finished { id, status };
                Ok(true)
            }
            Ok(_) => {
                self.state = JobState::Running { id };
                Ok(false)
            }
            Err(e) => {
                warn!(task = %id, error = %e, "Job status unavailable, dropping it");
                self.state = JobState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }
}
