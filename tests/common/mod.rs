//! Shared fixtures for integration tests
//!
//! In-process axum servers stand in for the overlord, a redirecting
//! follower and the coordinator; a static broker answers live queries.

#![allow(dead_code)]

use druid_warden::config::{SourceCatalog, SourceConfig};
use druid_warden::segment::{Broker, ColumnMetadata};
use druid_warden::time::Interval;
use druid_warden::{Error, Result};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use object_store::memory::InMemory;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::net::TcpListener;

pub const CATALOG: &str = r#"{
    "web/page_views": {
        "input": { "roots": ["/raw/page_views"] },
        "dimensions": ["country", "device"],
        "metrics": { "revenue": "doubleSum" },
        "output": { "segmentGranularity": "day" }
    }
}"#;

pub fn catalog() -> Arc<SourceCatalog> {
    Arc::new(SourceCatalog::from_json_str(CATALOG).unwrap())
}

pub fn page_views() -> Arc<SourceConfig> {
    catalog().get("web/page_views").unwrap()
}

pub fn interval(raw: &str) -> Interval {
    raw.parse().unwrap()
}

pub async fn put(store: &InMemory, path: &str) {
    store
        .put(&object_store::path::Path::from(path), PutPayload::from_static(b"x"))
        .await
        .unwrap();
}

/// Descriptor payload as stored in the metadata store
pub fn segment(interval: &str, version: &str, metrics: &str, dimensions: &str) -> Value {
    json!({
        "dataSource": "page_views",
        "interval": interval,
        "version": version,
        "metrics": metrics,
        "dimensions": dimensions,
        "shardSpec": { "type": "none" },
        "loadSpec": { "type": "local" }
    })
}

pub fn shard(interval: &str, kind: &str, partition: u32) -> Value {
    json!({
        "dataSource": "page_views",
        "interval": interval,
        "version": "v1",
        "metrics": "events,revenue",
        "dimensions": "country,device",
        "shardSpec": { "type": kind, "partitionNum": partition }
    })
}

/// Broker answering every event query with the count set for its interval
#[derive(Default)]
pub struct StaticBroker {
    events: Mutex<HashMap<Interval, u64>>,
    columns: Option<BTreeMap<String, String>>,
}

impl StaticBroker {
    pub fn with_columns(columns: &[(&str, &str)]) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            columns: Some(
                columns
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        }
    }

    pub fn set_events(&self, interval: Interval, events: u64) {
        self.events.lock().insert(interval, events);
    }
}

#[async_trait]
impl Broker for StaticBroker {
    async fn event_count(&self, _data_source: &str, interval: &Interval) -> Result<u64> {
        Ok(self.events.lock().get(interval).copied().unwrap_or(0))
    }

    async fn column_metadata(&self, _data_source: &str, _interval: &Interval) -> Result<ColumnMetadata> {
        self.columns
            .clone()
            .map(ColumnMetadata::Known)
            .ok_or_else(|| Error::Query("no columns configured".to_string()))
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn serve(listener: TcpListener, app: Router) {
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// Recorded traffic and canned answers of the fake overlord
#[derive(Default)]
pub struct OverlordState {
    /// Status polls answered RUNNING before a task reports SUCCESS
    pub running_polls: usize,
    pub submitted: Mutex<Vec<Value>>,
    pub shutdowns: Mutex<Vec<String>>,
    polls: Mutex<HashMap<String, usize>>,
    lists: Mutex<HashMap<&'static str, Vec<String>>>,
    payloads: Mutex<HashMap<String, Value>>,
}

impl OverlordState {
    pub fn new(running_polls: usize) -> Arc<Self> {
        Arc::new(Self {
            running_polls,
            ..Self::default()
        })
    }

    /// Register a task in one of the overlord queues
    pub fn add_active(&self, list: &'static str, id: &str, data_source: &str, interval: &str) {
        self.lists.lock().entry(list).or_default().push(id.to_string());
        self.payloads.lock().insert(
            id.to_string(),
            json!({
                "type": "index_hadoop",
                "id": id,
                "dataSource": data_source,
                "spec": {
                    "dataSchema": {
                        "dataSource": data_source,
                        "granularitySpec": { "intervals": [interval] }
                    }
                }
            }),
        );
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn polls_of(&self, id: &str) -> usize {
        self.polls.lock().get(id).copied().unwrap_or(0)
    }
}

async fn submit(State(state): State<Arc<OverlordState>>, Json(body): Json<Value>) -> Json<Value> {
    let mut submitted = state.submitted.lock();
    submitted.push(body);
    Json(json!({ "task": format!("task-{}", submitted.len()) }))
}

async fn status(State(state): State<Arc<OverlordState>>, Path(id): Path<String>) -> Json<Value> {
    let mut polls = state.polls.lock();
    let count = polls.entry(id.clone()).or_insert(0);
    *count += 1;
    let status = if *count > state.running_polls {
        "SUCCESS"
    } else {
        "RUNNING"
    };
    Json(json!({ "task": id, "status": { "id": id, "status": status } }))
}

async fn detail(
    State(state): State<Arc<OverlordState>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Value>, StatusCode> {
    state
        .payloads
        .lock()
        .get(&id)
        .cloned()
        .map(|payload| Json(json!({ "task": id, "payload": payload })))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn shutdown(State(state): State<Arc<OverlordState>>, Path(id): Path<String>) -> Json<Value> {
    state.shutdowns.lock().push(id.clone());
    Json(json!({ "task": id }))
}

fn listing(state: &OverlordState, list: &'static str) -> Json<Value> {
    let ids = state.lists.lock().get(list).cloned().unwrap_or_default();
    Json(Value::Array(
        ids.into_iter().map(|id| json!({ "id": id })).collect(),
    ))
}

/// Start a fake overlord leader; returns its origin
pub async fn spawn_overlord(state: Arc<OverlordState>) -> String {
    let app = Router::new()
        .route("/druid/indexer/v1/task", post(submit))
        .route("/druid/indexer/v1/task/:id", get(detail))
        .route("/druid/indexer/v1/task/:id/status", get(status))
        .route("/druid/indexer/v1/task/:id/shutdown", post(shutdown))
        .route(
            "/druid/indexer/v1/runningTasks",
            get(|State(s): State<Arc<OverlordState>>| async move { listing(&s, "runningTasks") }),
        )
        .route(
            "/druid/indexer/v1/pendingTasks",
            get(|State(s): State<Arc<OverlordState>>| async move { listing(&s, "pendingTasks") }),
        )
        .route(
            "/druid/indexer/v1/waitingTasks",
            get(|State(s): State<Arc<OverlordState>>| async move { listing(&s, "waitingTasks") }),
        )
        .with_state(state);
    let (listener, url) = bind().await;
    serve(listener, app);
    url
}

/// Start a follower redirecting every request to `leader`
pub async fn spawn_follower(leader: String) -> String {
    let app = Router::new().fallback(move |uri: Uri| {
        let leader = leader.clone();
        async move {
            (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, format!("{}{}", leader, uri.path()))],
            )
        }
    });
    let (listener, url) = bind().await;
    serve(listener, app);
    url
}

/// Start a server redirecting every request to itself
pub async fn spawn_redirect_loop() -> String {
    let (listener, url) = bind().await;
    let target = url.clone();
    let app = Router::new().fallback(move |uri: Uri| {
        let target = target.clone();
        async move {
            (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, format!("{}{}", target, uri.path()))],
            )
        }
    });
    serve(listener, app);
    url
}

/// Start a coordinator serving `segments` per data source
pub async fn spawn_coordinator(segments: HashMap<String, Vec<Value>>) -> String {
    let segments = Arc::new(segments);
    let app = Router::new().route(
        "/druid/coordinator/v1/metadata/datasources/:ds/segments",
        get(move |Path(ds): Path<String>| {
            let segments = segments.clone();
            async move {
                match segments.get(&ds) {
                    Some(rows) => Ok(Json(Value::Array(rows.clone()))),
                    None => Err(StatusCode::NOT_FOUND),
                }
            }
        }),
    );
    let (listener, url) = bind().await;
    serve(listener, app);
    url
}
