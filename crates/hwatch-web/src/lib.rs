//! Read-only JSON API over persisted report series.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hwatch_core::Report;
use hwatch_storage::ReportStore;
use hwatch_sync::{builtin_sources, connect_report_store, SourceDescriptor, WatchConfig};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "hwatch-web";

const WELCOME: &str = "Welcome to the GT JPJ API. Try /gt-jpj/cases or /gt-jpj/testing.";

#[derive(Clone)]
pub struct AppState {
    pub reports: Arc<dyn ReportStore>,
    pub sources: Vec<SourceDescriptor>,
}

impl AppState {
    pub fn new(reports: Arc<dyn ReportStore>) -> Self {
        Self {
            reports,
            sources: builtin_sources(),
        }
    }

    fn source_for_path(&self, series: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.api_path == series)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/gt-jpj", get(welcome_handler))
        .route("/gt-jpj/{series}", get(series_handler))
        .route("/gt-jpj/{series}/chart", get(chart_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WatchConfig) -> anyhow::Result<()> {
    let store = connect_report_store(config).await?;
    let state = AppState::new(Arc::new(store));
    let listener = TcpListener::bind(("0.0.0.0", config.web.port)).await?;
    info!(port = config.web.port, "read api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn welcome_handler() -> Response {
    envelope(StatusCode::OK, Value::from(WELCOME))
}

async fn not_found_handler() -> Response {
    envelope(StatusCode::NOT_FOUND, Value::from("Not Found"))
}

async fn series_handler(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
) -> Response {
    let Some(source) = state.source_for_path(&series) else {
        return not_found_handler().await;
    };
    match state.reports.all(&source.table, &source.id).await {
        Ok(reports) => {
            let rows = reports
                .iter()
                .enumerate()
                .map(|(i, report)| row_json(i + 1, report))
                .collect::<Vec<_>>();
            envelope(StatusCode::OK, Value::Array(rows))
        }
        Err(err) => server_error(err.into()),
    }
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
) -> Response {
    let Some(source) = state.source_for_path(&series) else {
        return not_found_handler().await;
    };
    match state.reports.all(&source.table, &source.id).await {
        Ok(reports) => {
            let x = reports.iter().map(|r| r.date.to_string()).collect::<Vec<_>>();
            let traces = source
                .chart_counters
                .iter()
                .map(|counter| {
                    let y = reports.iter().map(|r| r.counter(counter)).collect::<Vec<_>>();
                    json!({
                        "type": "bar",
                        "name": counter,
                        "x": x,
                        "y": y,
                    })
                })
                .collect::<Vec<_>>();
            Json(json!({
                "data": traces,
                "layout": {
                    "title": format!("{} by Date", source.display_name),
                    "barmode": "group",
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc"
                }
            }))
            .into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

fn row_json(id: usize, report: &Report) -> Value {
    let mut row = Map::new();
    row.insert("id".into(), Value::from(id));
    row.insert("date".into(), Value::from(report.date.to_string()));
    for (name, value) in &report.counters {
        row.insert(name.clone(), Value::from(*value));
    }
    Value::Object(row)
}

fn envelope(status: StatusCode, payload: Value) -> Response {
    (
        status,
        Json(json!({ "payload": payload, "status_code": status.as_u16() })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "read api request failed");
    envelope(
        StatusCode::INTERNAL_SERVER_ERROR,
        Value::from("Internal Server Error"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::NaiveDate;
    use hwatch_core::TableSpec;
    use hwatch_storage::{MemoryReportStore, PersistError};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn march(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, day).unwrap()
    }

    async fn seeded_app() -> Router {
        let store = MemoryReportStore::new();
        let cases = TableSpec::new("cases", &["reported", "total"]);
        // Inserted out of order; responses are ordered by date.
        for (day, reported, total) in [(5, 15, 1000), (4, 12, 985)] {
            let report = Report::new("cases", march(day))
                .with_counter("reported", reported)
                .with_counter("total", total);
            store.insert(&cases, &report).await.unwrap();
        }
        app(AppState::new(Arc::new(store)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn welcome_route() {
        let (status, body) = get_json(seeded_app().await, "/gt-jpj").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status_code"], 200);
        assert!(body["payload"].as_str().unwrap().contains("Welcome"));
    }

    #[tokio::test]
    async fn series_rows_are_numbered_by_date() {
        let (status, body) = get_json(seeded_app().await, "/gt-jpj/cases").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["payload"],
            json!([
                {"id": 1, "date": "2021-03-04", "reported": 12, "total": 985},
                {"id": 2, "date": "2021-03-05", "reported": 15, "total": 1000},
            ])
        );
    }

    #[tokio::test]
    async fn empty_series_is_an_empty_list() {
        let (status, body) = get_json(seeded_app().await, "/gt-jpj/testing").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"], json!([]));
    }

    #[tokio::test]
    async fn chart_is_a_plotly_figure() {
        let (status, body) = get_json(seeded_app().await, "/gt-jpj/cases/chart").await;
        assert_eq!(status, StatusCode::OK);
        let trace = &body["data"][0];
        assert_eq!(trace["type"], "bar");
        assert_eq!(trace["x"], json!(["2021-03-04", "2021-03-05"]));
        assert_eq!(trace["y"], json!([12, 15]));
        assert!(body["layout"]["title"].is_string());
    }

    #[tokio::test]
    async fn unknown_series_is_not_found() {
        for uri in ["/gt-jpj/vaccines", "/gt-jpj/vaccines/chart", "/elsewhere"] {
            let (status, body) = get_json(seeded_app().await, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body, json!({"payload": "Not Found", "status_code": 404}));
        }
    }

    struct UnavailableStore;

    #[async_trait]
    impl ReportStore for UnavailableStore {
        async fn insert(&self, _spec: &TableSpec, _report: &Report) -> Result<(), PersistError> {
            unreachable!("read api never inserts")
        }

        async fn history_before(
            &self,
            _spec: &TableSpec,
            _source_id: &str,
            _before: NaiveDate,
            _limit: usize,
        ) -> Result<Vec<Report>, PersistError> {
            unreachable!("read api never reads history")
        }

        async fn all(&self, _spec: &TableSpec, _source_id: &str) -> Result<Vec<Report>, PersistError> {
            Err(PersistError::InvalidRow {
                table: "cases".into(),
                message: "connection reset".into(),
            })
        }
    }

    #[tokio::test]
    async fn storage_failure_is_a_server_error() {
        let app = app(AppState::new(Arc::new(UnavailableStore)));
        let (status, body) = get_json(app, "/gt-jpj/cases").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["payload"], "Internal Server Error");
    }
}
