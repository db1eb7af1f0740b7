//! Run configuration and component factory
//!
//! Sources are described by a JSON catalog (see [`source`]). Everything that
//! talks to the outside world is created through [`ComponentFactory`] from a
//! URI, so the same binary can run against in-memory fakes, a local mirror of
//! the raw store, or S3.

pub mod source;

pub use source::{
    InputConfig, OutputConfig, SourceCatalog, SourceConfig, SourceDefaults, SourceEntry,
    DEFAULTS_KEY, EVENTS_METRIC,
};

use crate::inventory::RawStore;
use crate::jobs::OverlordClient;
use crate::planner::UnshardTask;
use crate::segment::{
    Broker, CoordinatorSegmentStore, HttpBroker, LocalSegmentStore, SegmentMetadataStore,
};
use crate::time::{Interval, RunWindow};
use crate::{Error, Result};

use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, prefix::PrefixStore,
    ObjectStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Knobs shared by every mode of a run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub window: RunWindow,
    /// Explicit interval, overriding the trailing window
    pub forced_interval: Option<Interval>,
    /// Rebuild every slot regardless of its checks
    pub force: bool,
    /// Submit jobs newest first
    pub reverse: bool,
    /// Maximum number of jobs submitted in one run, 0 for no limit
    pub limit: usize,
    /// Print job documents instead of submitting them
    pub dry_run: bool,
    /// Maximum concurrent listings and queries
    pub io_concurrency: usize,
    pub poll_interval: Duration,
    pub max_redirects: u32,
    pub unshard_task: UnshardTask,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            window: RunWindow::default(),
            forced_interval: None,
            force: false,
            reverse: false,
            limit: 0,
            dry_run: false,
            io_concurrency: 8,
            poll_interval: Duration::from_secs(30),
            max_redirects: 5,
            unshard_task: UnshardTask::default(),
        }
    }
}

impl RunConfig {
    /// Interval this run scans
    pub fn scan_interval(&self) -> Interval {
        self.forced_interval
            .unwrap_or_else(|| self.window.resolve_now())
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create a raw store replica from a URI
    ///
    /// Supported schemes:
    /// - `memory://`: empty in-memory store (tests, dry runs)
    /// - `file:///path` or a bare path: local mirror rooted at `path`
    /// - `s3://bucket[/prefix]`: S3 or a compatible store
    ///
    /// S3 reads the same environment as the rest of the deployment:
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY: credentials (optional, IAM role otherwise)
    pub fn create_raw_store(uri: &str) -> Result<RawStore> {
        let uri = uri.trim();

        if uri == "memory" || uri.starts_with("memory://") {
            info!("Using in-memory raw store");
            return Ok(RawStore::new(Arc::new(InMemory::new()), "memory://"));
        }

        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(Error::Config(format!("raw store '{}' names no bucket", uri)));
            }
            let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());
            info!(bucket, prefix, region = %region, "Using S3 raw store");

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(&region);
            if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                info!("Using custom S3 endpoint: {}", endpoint);
                builder = builder.with_endpoint(&endpoint).with_allow_http(true);
            }
            if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                builder = builder.with_access_key_id(&key);
            }
            if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                builder = builder.with_secret_access_key(&secret);
            }

            let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
            let store: Arc<dyn ObjectStore> = if prefix.is_empty() {
                store
            } else {
                Arc::new(PrefixStore::new(store, prefix))
            };
            return Ok(RawStore::new(store, uri));
        }

        let path = match uri.strip_prefix("file://") {
            Some(path) => path,
            None if uri.contains("://") => {
                return Err(Error::Config(format!(
                    "Unknown raw store scheme in '{}'. Use memory://, file:// or s3://",
                    uri
                )))
            }
            None => uri,
        };
        if path.is_empty() {
            return Err(Error::Config("raw store path is empty".to_string()));
        }
        info!(path, "Using local raw store");
        let store = LocalFileSystem::new_with_prefix(path)?;
        Ok(RawStore::new(
            Arc::new(store),
            format!("file://{}", path.trim_end_matches('/')),
        ))
    }

    /// Create the segment metadata store
    ///
    /// `memory` yields an empty local store; anything else is the coordinator base URL.
    pub fn create_segment_store(coordinator: &str) -> Result<Arc<dyn SegmentMetadataStore>> {
        if coordinator == "memory" || coordinator.starts_with("memory://") {
            info!("Using LocalSegmentStore (development mode)");
            return Ok(Arc::new(LocalSegmentStore::new()));
        }
        info!(coordinator, "Using coordinator segment metadata");
        Ok(Arc::new(CoordinatorSegmentStore::new(
            Self::http_client(true)?,
            coordinator,
        )))
    }

    pub fn create_broker(broker: &str) -> Result<Arc<dyn Broker>> {
        info!(broker, "Using broker");
        Ok(Arc::new(HttpBroker::new(Self::http_client(true)?, broker)))
    }

    /// Create the overlord client; leader redirects are followed by the client itself
    pub fn create_overlord(overlord: &str, max_redirects: u32) -> Result<OverlordClient> {
        info!(overlord, max_redirects, "Using overlord");
        OverlordClient::new(Self::http_client(false)?, overlord, max_redirects)
    }

    /// HTTP client with a connect timeout and no read timeout
    ///
    /// Overlord submissions can take long to be acknowledged, so only the
    /// connect phase is bounded.
    pub fn http_client(follow_redirects: bool) -> Result<reqwest::Client> {
        let policy = if follow_redirects {
            reqwest::redirect::Policy::limited(5)
        } else {
            reqwest::redirect::Policy::none()
        };
        Ok(reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(policy)
            .build()?)
    }
}
