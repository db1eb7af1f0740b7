//! Segment metadata stores

use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde_json::Value;

/// Source of used segment descriptors
#[async_trait]
pub trait SegmentMetadataStore: Send + Sync {
    /// Raw descriptor payloads of every used segment of `data_source`
    async fn used_segments(&self, data_source: &str) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone)]
struct SegmentRow {
    data_source: String,
    used: bool,
    payload: Value,
}

/// In-memory metadata store for development and testing
#[derive(Debug, Default)]
pub struct LocalSegmentStore {
    rows: RwLock<Vec<SegmentRow>>,
}

impl LocalSegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a used segment
    pub fn publish(&self, payload: Value) -> Result<()> {
        self.insert(payload, true)
    }

    /// Register a segment that has been marked unused
    pub fn publish_unused(&self, payload: Value) -> Result<()> {
        self.insert(payload, false)
    }

    fn insert(&self, payload: Value, used: bool) -> Result<()> {
        let data_source = payload["dataSource"]
            .as_str()
            .ok_or_else(|| Error::Metadata("segment payload has no dataSource".to_string()))?
            .to_string();
        self.rows.write().push(SegmentRow {
            data_source,
            used,
            payload,
        });
        Ok(())
    }
}

#[async_trait]
impl SegmentMetadataStore for LocalSegmentStore {
    async fn used_segments(&self, data_source: &str) -> Result<Vec<Value>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|row| row.used && row.data_source == data_source)
            .map(|row| row.payload.clone())
            .collect())
    }
}

/// Coordinator metadata API
///
/// `GET /druid/coordinator/v1/metadata/datasources/{ds}/segments?full` lists
/// the used segments of a data source; an unknown data source is a 404.
pub struct CoordinatorSegmentStore {
    client: reqwest::Client,
    url: String,
}

impl CoordinatorSegmentStore {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SegmentMetadataStore for CoordinatorSegmentStore {
    async fn used_segments(&self, data_source: &str) -> Result<Vec<Value>> {
        let endpoint = format!(
            "{}/druid/coordinator/v1/metadata/datasources/{}/segments?full",
            self.url, data_source
        );
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| Error::Metadata(format!("{} unreachable: {}", endpoint, e)))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Metadata(format!(
                "{} returned {}: {}",
                endpoint, status, body
            )));
        }
        match serde_json::from_str(&body)? {
            Value::Array(rows) => Ok(rows),
            other => Err(Error::Metadata(format!(
                "expected a segment list from {}, got {}",
                endpoint, other
            ))),
        }
    }
}
