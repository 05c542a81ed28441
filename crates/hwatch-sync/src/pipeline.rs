use std::sync::Arc;

use chrono::NaiveDate;
use hwatch_adapters::ExtractionError;
use hwatch_core::{Marker, Report, ReportMetrics};
use hwatch_notify::{fan_out, DeliveryReport, NotificationTarget, Notifier};
use hwatch_storage::{
    FetchError, FetchedPage, MarkerError, MarkerStore, PageArchive, PageFetcher, PersistError,
    ReportStore,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::metrics::compute_metrics;
use crate::sources::SourceDescriptor;

/// Terminal failure of one invocation for one source. Each variant names the
/// stage that stopped the run; nothing after that stage happened.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Network(#[from] FetchError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("persist failed: {0}")]
    Persist(#[from] PersistError),
    #[error("marker store failed: {0}")]
    Marker(#[from] MarkerError),
}

impl PipelineError {
    pub fn terminal_state(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_failed",
            Self::Extraction(_) => "extraction_failed",
            Self::Persist(_) => "persist_failed",
            Self::Marker(_) => "marker_failed",
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The page still shows the report the marker already covers.
    Unchanged { date: NaiveDate },
    Published {
        report: Report,
        /// The row already existed from an earlier interrupted run.
        recovered: bool,
        metrics: ReportMetrics,
        deliveries: DeliveryReport,
    },
}

impl RunOutcome {
    pub fn summary(&self) -> String {
        match self {
            Self::Unchanged { date } => format!("unchanged ({date})"),
            Self::Published {
                report,
                recovered,
                deliveries,
                ..
            } => format!(
                "published {}{} ({} delivered, {} failed)",
                report.date,
                if *recovered { " [recovered]" } else { "" },
                deliveries.delivered(),
                deliveries.failed()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Duplicate,
    New,
}

/// Only the date decides: a corrected counter under the same date is not a
/// new report.
pub fn dedup_gate(marker: Option<&Marker>, report: &Report) -> GateDecision {
    match marker {
        Some(marker) if marker.last_date == report.date => GateDecision::Duplicate,
        _ => GateDecision::New,
    }
}

/// Collaborators of a run. Every external system sits behind a trait so
/// tests can swap in memory doubles.
#[derive(Clone)]
pub struct WatchContext {
    pub fetcher: Arc<dyn PageFetcher>,
    pub reports: Arc<dyn ReportStore>,
    pub markers: Arc<dyn MarkerStore>,
    pub notifier: Arc<dyn Notifier>,
    pub targets: Vec<NotificationTarget>,
    pub archive: Option<PageArchive>,
}

pub struct WatchPipeline {
    ctx: WatchContext,
}

impl WatchPipeline {
    pub fn new(ctx: WatchContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &WatchContext {
        &self.ctx
    }

    /// One invocation for one source: marker, fetch, extract, gate,
    /// persist, marker update, metrics, notify. Persist always precedes the
    /// marker update; notification only follows a successful marker update.
    pub async fn run_source(&self, source: &SourceDescriptor) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("watch_run", %run_id, source = %source.id);
        async move {
            let result = self.run_stages(source).await;
            match &result {
                Ok(outcome) => info!(outcome = %outcome.summary(), "run finished"),
                Err(err) => error!(state = err.terminal_state(), error = %err, "run failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Sources are independent; one failing never stops the others.
    pub async fn run_all(
        &self,
        sources: &[SourceDescriptor],
    ) -> Vec<(String, Result<RunOutcome, PipelineError>)> {
        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            results.push((source.id.clone(), self.run_source(source).await));
        }
        results
    }

    async fn run_stages(&self, source: &SourceDescriptor) -> Result<RunOutcome, PipelineError> {
        let marker = self.read_marker(source).await?;

        let page = self.ctx.fetcher.fetch_page(&source.url).await?;
        info!(status = page.status.as_u16(), bytes = page.body.len(), "page fetched");

        let report = match source.extraction.extract(&source.id, &page.body) {
            Ok(report) => report,
            Err(err) => {
                self.archive_drifted_page(source, &page).await;
                return Err(err.into());
            }
        };

        if dedup_gate(marker.as_ref(), &report) == GateDecision::Duplicate {
            info!(date = %report.date, "no new report");
            return Ok(RunOutcome::Unchanged { date: report.date });
        }

        let recovered = self.persist(source, &report).await?;

        // A stored report older than the marker means the page rolled back,
        // not that an earlier run stopped before its marker write.
        if recovered && marker.as_ref().is_some_and(|m| m.last_date > report.date) {
            warn!(date = %report.date, "page shows an older, already announced report");
            return Ok(RunOutcome::Unchanged { date: report.date });
        }

        let marker_value = source.format_marker(report.date);
        self.ctx
            .markers
            .store(&source.marker_key, &marker_value)
            .await?;
        info!(key = %source.marker_key, marker = %marker_value, "marker updated");

        let metrics = self.metrics_for(source, &report).await;
        let message = source
            .template
            .render(&source.display_name, &report, &metrics);
        let deliveries = fan_out(self.ctx.notifier.as_ref(), &self.ctx.targets, &message).await;

        Ok(RunOutcome::Published {
            report,
            recovered,
            metrics,
            deliveries,
        })
    }

    async fn read_marker(&self, source: &SourceDescriptor) -> Result<Option<Marker>, PipelineError> {
        let Some(raw) = self.ctx.markers.load(&source.marker_key).await? else {
            info!(key = %source.marker_key, "no marker yet");
            return Ok(None);
        };
        match source.parse_marker(&raw) {
            Some(last_date) => Ok(Some(Marker {
                source_id: source.id.clone(),
                last_date,
            })),
            None => {
                warn!(key = %source.marker_key, value = %raw, "unparseable marker treated as absent");
                Ok(None)
            }
        }
    }

    /// Returns whether the row was already there.
    async fn persist(&self, source: &SourceDescriptor, report: &Report) -> Result<bool, PipelineError> {
        match self.ctx.reports.insert(&source.table, report).await {
            Ok(()) => {
                info!(table = %source.table.table, date = %report.date, "report persisted");
                Ok(false)
            }
            Err(err) if err.is_duplicate() => {
                warn!(
                    table = %source.table.table,
                    date = %report.date,
                    "report already persisted; catching marker up"
                );
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn metrics_for(&self, source: &SourceDescriptor, report: &Report) -> ReportMetrics {
        let history = self
            .ctx
            .reports
            .history_before(
                &source.table,
                &source.id,
                report.date,
                source.metrics.history_len(),
            )
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "history unavailable; notifying without metrics");
                Vec::new()
            });
        compute_metrics(report, &history, &source.metrics)
    }

    async fn archive_drifted_page(&self, source: &SourceDescriptor, page: &FetchedPage) {
        let Some(archive) = &self.ctx.archive else {
            return;
        };
        match archive
            .archive_page(page.fetched_at, &source.id, &page.body)
            .await
        {
            Ok(archived) => warn!(
                path = %archived.path.display(),
                hash = %archived.content_hash,
                "archived page that failed extraction"
            ),
            Err(err) => warn!(error = %format!("{err:#}"), "could not archive page"),
        }
    }
}
