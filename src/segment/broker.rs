//! Analytical store queries

use crate::config::EVENTS_METRIC;
use crate::time::Interval;
use crate::{Error, Result};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Physical column types of a segment interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnMetadata {
    /// Column name to physical type (`LONG`, `DOUBLE`, `STRING`, ...)
    Known(BTreeMap<String, String>),
    /// Metadata could not be fetched; every type comparison fails
    Unavailable,
}

impl ColumnMetadata {
    pub fn type_of(&self, column: &str) -> Option<&str> {
        match self {
            ColumnMetadata::Known(columns) => columns.get(column).map(String::as_str),
            ColumnMetadata::Unavailable => None,
        }
    }

    /// Whether `column` is present with `expected` type
    pub fn matches(&self, column: &str, expected: &str) -> bool {
        self.type_of(column)
            .map(|actual| actual.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }

    pub fn is_available(&self) -> bool {
        matches!(self, ColumnMetadata::Known(_))
    }
}

/// Query interface of the analytical store
#[async_trait]
pub trait Broker: Send + Sync {
    /// Sum of the events column over `interval`
    async fn event_count(&self, data_source: &str, interval: &Interval) -> Result<u64>;

    /// Merged column metadata of the segments covering `interval`
    async fn column_metadata(&self, data_source: &str, interval: &Interval)
        -> Result<ColumnMetadata>;
}

/// Broker reached over the native JSON query endpoint
pub struct HttpBroker {
    client: reqwest::Client,
    url: String,
}

impl HttpBroker {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn query(&self, query: &Value) -> Result<Value> {
        let endpoint = format!("{}/druid/v2/", self.url);
        let response = self.client.post(&endpoint).json(query).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Query(format!(
                "{} returned {}: {}",
                endpoint, status, body
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Timeseries query summing the events column over one interval
pub fn event_count_query(data_source: &str, interval: &Interval) -> Value {
    json!({
        "queryType": "timeseries",
        "dataSource": data_source,
        "granularity": "all",
        "intervals": [interval.to_string()],
        "aggregations": [
            { "type": "longSum", "name": EVENTS_METRIC, "fieldName": EVENTS_METRIC }
        ]
    })
}

pub fn column_metadata_query(data_source: &str, interval: &Interval) -> Value {
    json!({
        "queryType": "segmentMetadata",
        "dataSource": data_source,
        "intervals": [interval.to_string()],
        "merge": true,
        "analysisTypes": []
    })
}

/// Read `[{"result": {"events": n}}]`; an empty result means no rows
pub fn parse_event_count(response: &Value) -> Result<u64> {
    let rows = response
        .as_array()
        .ok_or_else(|| Error::Query("timeseries response is not an array".to_string()))?;
    let Some(first) = rows.first() else {
        return Ok(0);
    };
    let events = &first["result"][EVENTS_METRIC];
    events
        .as_u64()
        .or_else(|| events.as_f64().map(|f| f.max(0.0).round() as u64))
        .ok_or_else(|| Error::Query(format!("timeseries result has no {}", EVENTS_METRIC)))
}

/// Read `[{"columns": {"name": {"type": "LONG"}}}]`
pub fn parse_column_metadata(response: &Value) -> Result<ColumnMetadata> {
    let columns = response
        .as_array()
        .and_then(|rows| rows.first())
        .and_then(|row| row["columns"].as_object())
        .ok_or_else(|| Error::Query("segmentMetadata returned no columns".to_string()))?;
    Ok(ColumnMetadata::Known(
        columns
            .iter()
            .filter_map(|(name, column)| {
                column["type"]
                    .as_str()
                    .map(|kind| (name.clone(), kind.to_string()))
            })
            .collect(),
    ))
}

#[async_trait]
impl Broker for HttpBroker {
    async fn event_count(&self, data_source: &str, interval: &Interval) -> Result<u64> {
        let response = self.query(&event_count_query(data_source, interval)).await?;
        parse_event_count(&response)
    }

    async fn column_metadata(
        &self,
        data_source: &str,
        interval: &Interval,
    ) -> Result<ColumnMetadata> {
        let response = self
            .query(&column_metadata_query(data_source, interval))
            .await?;
        parse_column_metadata(&response)
    }
}
