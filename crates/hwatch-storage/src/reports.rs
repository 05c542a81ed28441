use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use hwatch_core::{Report, TableSpec};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum PersistError {
    /// A row for this date already exists; a prior run got as far as the
    /// insert. Callers treat this as "already persisted".
    #[error("duplicate key: {table} already has a row for {date}")]
    Duplicate { table: String, date: NaiveDate },
    #[error("report for {date} is missing counter {counter}")]
    MissingCounter { date: NaiveDate, counter: String },
    #[error("invalid table spec for {0}")]
    InvalidTable(String),
    #[error("invalid row in {table}: {message}")]
    InvalidRow { table: String, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Durable home of persisted reports, one table per series.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Insert keyed by `report.date`; a second insert for the same date
    /// fails with [`PersistError::Duplicate`].
    async fn insert(&self, spec: &TableSpec, report: &Report) -> Result<(), PersistError>;

    /// Up to `limit` reports strictly before `before`, ordered oldest first.
    async fn history_before(
        &self,
        spec: &TableSpec,
        source_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Report>, PersistError>;

    /// Every report in the series, ordered by date.
    async fn all(&self, spec: &TableSpec, source_id: &str) -> Result<Vec<Report>, PersistError>;
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(options: PgConnectOptions) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }
}

fn checked(spec: &TableSpec) -> Result<&TableSpec, PersistError> {
    if spec.is_valid() {
        Ok(spec)
    } else {
        Err(PersistError::InvalidTable(spec.table.clone()))
    }
}

fn insert_sql(spec: &TableSpec) -> String {
    let placeholders = (0..spec.counters.len())
        .map(|i| format!("${}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} (date, {}) VALUES ($1, {})",
        spec.table,
        spec.counters.join(", "),
        placeholders
    )
}

fn select_sql(spec: &TableSpec, filter: &str) -> String {
    format!(
        "SELECT date, {} FROM {} {}",
        spec.counters.join(", "),
        spec.table,
        filter
    )
}

fn row_to_report(
    spec: &TableSpec,
    source_id: &str,
    row: &sqlx::postgres::PgRow,
) -> Result<Report, PersistError> {
    let date: NaiveDate = row.try_get("date")?;
    let mut report = Report::new(source_id, date);
    for counter in &spec.counters {
        let value: i64 = row.try_get(counter.as_str())?;
        report.counters.insert(counter.clone(), value);
    }
    Ok(report)
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn insert(&self, spec: &TableSpec, report: &Report) -> Result<(), PersistError> {
        let spec = checked(spec)?;
        let sql = insert_sql(spec);
        let mut query = sqlx::query(&sql).bind(report.date);
        for counter in &spec.counters {
            let value = report
                .counter(counter)
                .ok_or_else(|| PersistError::MissingCounter {
                    date: report.date,
                    counter: counter.clone(),
                })?;
            query = query.bind(value);
        }

        match query.execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(PersistError::Duplicate {
                    table: spec.table.clone(),
                    date: report.date,
                })
            }
            Err(err) => Err(PersistError::Database(err)),
        }
    }

    async fn history_before(
        &self,
        spec: &TableSpec,
        source_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Report>, PersistError> {
        let spec = checked(spec)?;
        let sql = select_sql(spec, "WHERE date < $1 ORDER BY date DESC LIMIT $2");
        let limit = i64::try_from(limit).map_err(|_| PersistError::InvalidRow {
            table: spec.table.clone(),
            message: format!("history limit {limit} out of range"),
        })?;
        let rows = sqlx::query(&sql)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut reports = rows
            .iter()
            .map(|row| row_to_report(spec, source_id, row))
            .collect::<Result<Vec<_>, _>>()?;
        reports.reverse();
        Ok(reports)
    }

    async fn all(&self, spec: &TableSpec, source_id: &str) -> Result<Vec<Report>, PersistError> {
        let spec = checked(spec)?;
        let sql = select_sql(spec, "ORDER BY date");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row_to_report(spec, source_id, row))
            .collect()
    }
}

/// In-process store with the same uniqueness semantics as the Postgres
/// tables. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    tables: Mutex<BTreeMap<String, BTreeMap<NaiveDate, Report>>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .await
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn insert(&self, spec: &TableSpec, report: &Report) -> Result<(), PersistError> {
        let spec = checked(spec)?;
        let mut row = Report::new(report.source_id.clone(), report.date);
        for counter in &spec.counters {
            let value = report
                .counter(counter)
                .ok_or_else(|| PersistError::MissingCounter {
                    date: report.date,
                    counter: counter.clone(),
                })?;
            row.counters.insert(counter.clone(), value);
        }

        let mut tables = self.tables.lock().await;
        let table = tables.entry(spec.table.clone()).or_default();
        if table.contains_key(&report.date) {
            return Err(PersistError::Duplicate {
                table: spec.table.clone(),
                date: report.date,
            });
        }
        table.insert(report.date, row);
        Ok(())
    }

    async fn history_before(
        &self,
        spec: &TableSpec,
        source_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Report>, PersistError> {
        let spec = checked(spec)?;
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(&spec.table) else {
            return Ok(Vec::new());
        };
        let mut reports = table
            .range(..before)
            .rev()
            .take(limit)
            .map(|(_, r)| Report {
                source_id: source_id.to_string(),
                ..r.clone()
            })
            .collect::<Vec<_>>();
        reports.reverse();
        Ok(reports)
    }

    async fn all(&self, spec: &TableSpec, source_id: &str) -> Result<Vec<Report>, PersistError> {
        let spec = checked(spec)?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&spec.table)
            .map(|table| {
                table
                    .values()
                    .map(|r| Report {
                        source_id: source_id.to_string(),
                        ..r.clone()
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
