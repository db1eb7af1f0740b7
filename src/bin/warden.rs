//! Druid Warden
//!
//! One reconciliation pass: plan corrective jobs for the selected sources,
//! submit them to the overlord and wait until none is running.

use druid_warden::config::{ComponentFactory, RunConfig, SourceCatalog, SourceConfig};
use druid_warden::inventory::RawInventory;
use druid_warden::jobs::{DuplicateJobRegistry, JobRunner, RunnerConfig};
use druid_warden::planner::{
    plan_compaction, plan_unshard, reconcile, JobDecision, ReconciliationContext, UnshardTask,
};
use druid_warden::segment::SegmentCatalog;
use druid_warden::telemetry::Telemetry;
use druid_warden::time::{Interval, RunWindow};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Reconcile raw inventory against segments and reindex what differs
    Verify,
    /// Compact fragmented or under-sharded granularity windows
    Compact,
    /// Merge intervals still split into sibling shards
    Unshard,
    /// Shut down duplicate active jobs and exit
    KillDuplicates,
    /// Shut down every active job and exit
    KillAll,
}

/// Druid Warden
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, value_enum, env = "WARDEN_MODE", default_value = "verify")]
    mode: Mode,

    /// Source catalog (JSON)
    #[arg(long, env = "WARDEN_SOURCES")]
    sources: std::path::PathBuf,

    /// Topics to process, all catalog entries when omitted
    #[arg(long = "topic")]
    topics: Vec<String>,

    /// Raw store replica URI (memory://, file:///path, s3://bucket/prefix)
    #[arg(long = "raw-store", env = "WARDEN_RAW_STORE", value_delimiter = ',')]
    raw_stores: Vec<String>,

    /// Coordinator base URL, or `memory`
    #[arg(long, env = "WARDEN_COORDINATOR")]
    coordinator: Option<String>,

    /// Broker base URL
    #[arg(long, env = "WARDEN_BROKER")]
    broker: Option<String>,

    /// Overlord base URL
    #[arg(long, env = "WARDEN_OVERLORD")]
    overlord: String,

    /// Hours scanned, ending `--offset` hours ago
    #[arg(long, default_value = "24")]
    window: u32,

    #[arg(long, default_value = "3")]
    offset: u32,

    /// Explicit ISO interval `start/end`, overriding the window
    #[arg(long)]
    interval: Option<Interval>,

    /// Maximum jobs submitted, 0 for no limit
    #[arg(long, default_value = "0")]
    limit: usize,

    #[arg(long)]
    force: bool,

    /// Submit newest intervals first
    #[arg(long)]
    reverse: bool,

    #[arg(long)]
    dry_run: bool,

    #[arg(long, env = "WARDEN_IO_CONCURRENCY", default_value = "8")]
    io_concurrency: usize,

    #[arg(long, default_value = "30")]
    poll_interval_secs: u64,

    #[arg(long, default_value = "5")]
    max_redirects: u32,

    /// Task used by `unshard` (compact, index)
    #[arg(long, default_value = "compact")]
    unshard_task: UnshardTask,

    /// Log level
    #[arg(long, env = "WARDEN_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            window: RunWindow::new(self.window, self.offset),
            forced_interval: self.interval,
            force: self.force,
            reverse: self.reverse,
            limit: self.limit,
            dry_run: self.dry_run,
            io_concurrency: self.io_concurrency.max(1),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_redirects: self.max_redirects,
            unshard_task: self.unshard_task,
        }
    }

    fn segment_catalog(&self) -> anyhow::Result<Arc<SegmentCatalog>> {
        let coordinator = self
            .coordinator
            .as_deref()
            .context("--coordinator is required for this mode")?;
        let broker = self
            .broker
            .as_deref()
            .context("--broker is required for this mode")?;
        Ok(Arc::new(SegmentCatalog::new(
            ComponentFactory::create_segment_store(coordinator)?,
            ComponentFactory::create_broker(broker)?,
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("druid-warden", &args.log_level)?;

    let catalog = Arc::new(
        SourceCatalog::load(&args.sources)
            .with_context(|| format!("loading source catalog {}", args.sources.display()))?,
    );
    let sources = catalog.select(&args.topics)?;
    let config = args.run_config();

    info!(
        mode = ?args.mode,
        sources = sources.len(),
        interval = %config.scan_interval(),
        dry_run = config.dry_run,
        "Starting Druid Warden"
    );

    let overlord = Arc::new(ComponentFactory::create_overlord(
        &args.overlord,
        config.max_redirects,
    )?);
    let registry = Arc::new(DuplicateJobRegistry::new(
        overlord.clone(),
        config.io_concurrency,
    ));

    let decisions = match args.mode {
        Mode::KillDuplicates => {
            let killed = registry.kill_duplicates().await?;
            info!(killed = killed.len(), ids = ?killed, "Duplicate jobs shut down");
            return Ok(());
        }
        Mode::KillAll => {
            let killed = registry.kill_all().await?;
            info!(killed = killed.len(), ids = ?killed, "Active jobs shut down");
            return Ok(());
        }
        Mode::Verify => {
            if args.raw_stores.is_empty() {
                bail!("--raw-store is required for verify");
            }
            let replicas = args
                .raw_stores
                .iter()
                .map(|uri| ComponentFactory::create_raw_store(uri))
                .collect::<Result<Vec<_>, _>>()?;
            let inventory =
                RawInventory::connect(replicas, config.io_concurrency, &sources).await?;
            let ctx = ReconciliationContext::for_run(args.segment_catalog()?, &config)
                .with_inventory(Arc::new(inventory));
            plan(&ctx, &sources, args.mode, config.unshard_task).await
        }
        Mode::Compact | Mode::Unshard => {
            let ctx = ReconciliationContext::for_run(args.segment_catalog()?, &config);
            plan(&ctx, &sources, args.mode, config.unshard_task).await
        }
    };

    let runner = JobRunner::new(
        overlord,
        registry,
        catalog,
        RunnerConfig::from(&config),
    );
    let token = runner.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    let report = runner.run(decisions).await?;
    info!(
        planned = report.planned,
        rendered = report.rendered.len(),
        submitted = report.submitted.len(),
        skipped = report.skipped,
        failed = report.failed,
        finished = report.finished.len(),
        cancelled = report.cancelled,
        "Run complete"
    );
    if report.cancelled {
        warn!("Shut down before every job finished");
    }
    Ok(())
}

/// Plan every source; a failing source is logged and left out of the run
async fn plan(
    ctx: &ReconciliationContext,
    sources: &[Arc<SourceConfig>],
    mode: Mode,
    task: UnshardTask,
) -> Vec<JobDecision> {
    let mut decisions = Vec::new();
    for source in sources {
        let planned = match mode {
            Mode::Verify => reconcile(ctx, source).await,
            Mode::Compact => plan_compaction(ctx, source).await,
            Mode::Unshard => plan_unshard(ctx, source, task).await,
            Mode::KillDuplicates | Mode::KillAll => Ok(Vec::new()),
        };
        match planned {
            Ok(mut planned) => decisions.append(&mut planned),
            Err(e) => error!(topic = %source.topic, error = %e, "Planning failed, skipping source"),
        }
    }
    decisions
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
