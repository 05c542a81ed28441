use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::pipeline::WatchPipeline;
use crate::sources::SourceDescriptor;

/// One job running every source on `cron` (six-field, seconds first). A tick
/// that fires while the previous one is still running is skipped, so two
/// invocations never race on the same marker.
pub async fn build_scheduler(
    pipeline: Arc<WatchPipeline>,
    sources: Vec<SourceDescriptor>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let sources = Arc::new(sources);
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let sources = sources.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous invocation still running; skipping tick");
                return;
            };
            for (source_id, result) in pipeline.run_all(&sources).await {
                match result {
                    Ok(outcome) => info!(source = %source_id, outcome = %outcome.summary(), "scheduled run finished"),
                    Err(err) => error!(source = %source_id, error = %err, "scheduled run failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
