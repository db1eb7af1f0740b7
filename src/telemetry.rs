//! Shared telemetry bootstrap for warden binaries.

use crate::{Error, Result};

use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_SERVICE: &str = "druid-warden";

static SERVICE: OnceLock<String> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// `service` label attached to every metric
pub fn service() -> String {
    SERVICE.get_or_init(|| DEFAULT_SERVICE.to_string()).clone()
}

/// `run_id` label attached to per-run metrics, `none` outside a run
pub fn run_id() -> String {
    RUN_ID.get_or_init(|| "none".to_string()).clone()
}

/// Handle returned once the subscriber is installed.
#[derive(Debug)]
pub struct Telemetry {
    service_name: String,
    run_id: Option<String>,
}

impl Telemetry {
    /// Install the JSON log subscriber for a binary.
    ///
    /// The service name comes from `WARDEN_SERVICE_NAME` when set, the run id
    /// from `WARDEN_RUN_ID`. Both end up as metric labels.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let level = parse_log_level(log_level)?;
        let service_name = std::env::var("WARDEN_SERVICE_NAME")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_service_name.to_string());
        let run_id = std::env::var("WARDEN_RUN_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .try_init()
            .map_err(|e| {
                Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
            })?;

        let _ = SERVICE.set(service_name.clone());
        if let Some(run_id) = &run_id {
            let _ = RUN_ID.set(run_id.clone());
        }

        info!(
            service_name = %service_name,
            run_id = %run_id.as_deref().unwrap_or("none"),
            log_level = %level,
            "Telemetry bootstrap initialized"
        );

        Ok(Self {
            service_name,
            run_id,
        })
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}
