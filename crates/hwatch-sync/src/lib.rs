//! Change-detection pipeline: configuration, source registry, dedup gate,
//! metrics, orchestration, and the optional in-process scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use hwatch_notify::WebhookNotifier;
use hwatch_storage::{HttpFetcher, PageArchive, PgReportStore, RedisMarkerStore};

mod config;
mod metrics;
mod pipeline;
mod scheduler;
mod sources;

pub use config::{
    DatabaseConfig, HttpSettings, RedisConfig, SchedulerConfig, WatchConfig, WebConfig,
};
pub use metrics::{compute_metrics, deltas, rolling_mean, MetricsError, MetricsPolicy};
pub use pipeline::{
    dedup_gate, GateDecision, PipelineError, RunOutcome, WatchContext, WatchPipeline,
};
pub use scheduler::build_scheduler;
pub use sources::{builtin_sources, source_for_id, SourceDescriptor};

pub const CRATE_NAME: &str = "hwatch-sync";

pub async fn connect_report_store(config: &WatchConfig) -> Result<PgReportStore> {
    PgReportStore::connect(config.connect_options()?).await
}

/// Production collaborators: HTTP fetcher, Postgres reports, Redis markers,
/// webhook delivery.
pub async fn connect_context(config: &WatchConfig) -> Result<WatchContext> {
    let fetcher = HttpFetcher::new(config.fetch_config())?;
    let reports = connect_report_store(config).await?;
    let markers = RedisMarkerStore::connect(config.redis_connection_info()?)
        .await
        .context("connecting to redis")?;
    let notifier = WebhookNotifier::new(config.delivery_timeout());

    Ok(WatchContext {
        fetcher: Arc::new(fetcher),
        reports: Arc::new(reports),
        markers: Arc::new(markers),
        notifier: Arc::new(notifier),
        targets: config.targets(),
        archive: config.artifacts_dir.as_ref().map(PageArchive::new),
    })
}
