//! Overlord HTTP client
//!
//! Only the overlord leader accepts tasks; followers answer with a 3xx
//! pointing at the leader. Every call follows such redirects itself, up to a
//! fixed bound, and remembers the new leader for subsequent calls.

use super::{ActiveJob, JobDocument, TaskListKind, TaskStatus};
use crate::time::Interval;
use crate::{Error, Result};

use metrics::counter;
use parking_lot::RwLock;
use reqwest::header::LOCATION;
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Path of the indexing service below the overlord's origin
pub const INDEXER_PATH: &str = "/druid/indexer/v1";

pub struct OverlordClient {
    http: reqwest::Client,
    /// Base URL of the current leader, e.g. `http://host:8090/druid/indexer/v1`
    leader: RwLock<String>,
    max_redirects: u32,
}

impl OverlordClient {
    /// `endpoint` is either an origin or a full indexer base URL
    pub fn new(http: reqwest::Client, endpoint: &str, max_redirects: u32) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid overlord URL '{}': {}", endpoint, e)))?;
        let leader = if endpoint.ends_with(INDEXER_PATH) {
            endpoint.to_string()
        } else {
            format!("{}{}", endpoint, INDEXER_PATH)
        };
        Ok(Self {
            http,
            leader: RwLock::new(leader),
            max_redirects,
        })
    }

    /// Base URL of the last known leader
    pub fn leader(&self) -> String {
        self.leader.read().clone()
    }

    /// Submit a task document and return the task id
    pub async fn submit(&self, document: &JobDocument) -> Result<String> {
        let body = document.to_json()?;
        let (status, text) = self.send(Method::POST, "task", Some(&body)).await?;
        let response = expect_success(status, text)?;
        response["task"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("submission answer has no task id: {}", response)))
    }

    pub async fn status(&self, id: &str) -> Result<TaskStatus> {
        let (status, text) = self
            .send(Method::GET, &format!("task/{}/status", id), None)
            .await?;
        let response = expect_success(status, text)?;
        response["status"]["status"]
            .as_str()
            .map(TaskStatus::parse)
            .ok_or_else(|| Error::Protocol(format!("status of {} has no state: {}", id, response)))
    }

    /// Ids of the tasks in one overlord queue
    pub async fn list(&self, kind: TaskListKind) -> Result<Vec<String>> {
        let (status, text) = self.send(Method::GET, kind.path(), None).await?;
        let response = expect_success(status, text)?;
        let tasks = response
            .as_array()
            .ok_or_else(|| Error::Protocol(format!("{} is not a list", kind.path())))?;
        Ok(tasks
            .iter()
            .filter_map(|task| task["id"].as_str().map(str::to_string))
            .collect())
    }

    /// Data source and intervals of a task; `None` when the overlord has no usable detail
    pub async fn detail(&self, id: &str, kind: TaskListKind) -> Result<Option<ActiveJob>> {
        let (status, text) = self.send(Method::GET, &format!("task/{}", id), None).await?;
        if !status.is_success() {
            warn!(task = %id, status = %status, "Task detail unavailable");
            return Ok(None);
        }
        let response: Value = serde_json::from_str(&text)?;
        Ok(parse_detail(id, kind, &response["payload"]))
    }

    pub async fn shutdown(&self, id: &str) -> Result<()> {
        let (status, text) = self
            .send(Method::POST, &format!("task/{}/shutdown", id), None)
            .await?;
        expect_success(status, text)?;
        Ok(())
    }

    /// Issue one request, following leader redirects
    async fn send(
        &self,
        method: Method,
        suffix: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, String)> {
        let mut redirects = 0u32;
        loop {
            let url = format!("{}/{}", self.leader(), suffix);
            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.map_err(|e| {
                Error::Connectivity(format!("overlord at {} unreachable: {}", url, e))
            })?;

            let status = response.status();
            if !status.is_redirection() {
                let text = response.text().await?;
                debug!(method = %method, url = %url, status = %status, "Overlord answered");
                return Ok((status, text));
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    Error::Protocol(format!("{} redirected without a Location header", url))
                })?
                .to_string();
            if redirects >= self.max_redirects {
                return Err(Error::TooManyRedirects {
                    attempts: redirects + 1,
                    last_location: location,
                });
            }
            redirects += 1;
            counter!(
                "warden_overlord_redirects_total",
                "service" => crate::telemetry::service()
            )
            .increment(1);
            self.follow(&url, suffix, &location)?;
        }
    }

    /// Rebase the leader on a redirect target
    fn follow(&self, url: &str, suffix: &str, location: &str) -> Result<()> {
        let current = Url::parse(url)
            .map_err(|e| Error::Protocol(format!("invalid request URL '{}': {}", url, e)))?;
        let mut target = current
            .join(location)
            .map_err(|e| Error::Protocol(format!("invalid redirect '{}': {}", location, e)))?;
        target.set_query(None);
        let target = target.to_string();

        let leader = match target.strip_suffix(&format!("/{}", suffix)) {
            Some(base) => base.to_string(),
            None => {
                let path = Url::parse(&self.leader())
                    .map(|u| u.path().trim_end_matches('/').to_string())
                    .unwrap_or_else(|_| INDEXER_PATH.to_string());
                let origin = Url::parse(&target)
                    .map(|u| u.origin().ascii_serialization())
                    .map_err(|e| Error::Protocol(format!("invalid redirect '{}': {}", target, e)))?;
                format!("{}{}", origin, path)
            }
        };
        info!(from = %url, to = %leader, "Following overlord leader redirect");
        *self.leader.write() = leader;
        Ok(())
    }
}

fn expect_success(status: StatusCode, text: String) -> Result<Value> {
    if !status.is_success() {
        return Err(Error::Submission {
            status: status.as_u16(),
            body: text,
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// Read data source and intervals out of a task payload
pub(crate) fn parse_detail(id: &str, kind: TaskListKind, payload: &Value) -> Option<ActiveJob> {
    let data_source = payload["dataSource"].as_str()?.to_string();
    let declared = &payload["spec"]["dataSchema"]["granularitySpec"]["intervals"];
    let raw: Vec<&str> = match declared.as_array() {
        Some(intervals) => intervals.iter().filter_map(Value::as_str).collect(),
        None => [
            &payload["interval"],
            &payload["ioConfig"]["inputSpec"]["interval"],
        ]
        .into_iter()
        .filter_map(Value::as_str)
        .take(1)
        .collect(),
    };
    let intervals = raw
        .into_iter()
        .filter_map(|value| match value.parse::<Interval>() {
            Ok(interval) => Some(interval),
            Err(e) => {
                warn!(task = %id, interval = value, error = %e, "Ignoring task interval");
                None
            }
        })
        .collect();
    Some(ActiveJob {
        id: id.to_string(),
        data_source,
        intervals,
        kind,
    })
}
