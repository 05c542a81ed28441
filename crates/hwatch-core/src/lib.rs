//! Core domain model for the health-report watcher.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hwatch-core";

/// One dated observation with named non-negative counters from one source.
///
/// `date` is the natural key within a source; at most one report per
/// `(source_id, date)` is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub source_id: String,
    pub date: NaiveDate,
    pub counters: BTreeMap<String, i64>,
}

impl Report {
    pub fn new(source_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            source_id: source_id.into(),
            date,
            counters: BTreeMap::new(),
        }
    }

    pub fn with_counter(mut self, name: impl Into<String>, value: i64) -> Self {
        self.counters.insert(name.into(), value);
        self
    }

    pub fn counter(&self, name: &str) -> Option<i64> {
        self.counters.get(name).copied()
    }
}

/// Last report date successfully persisted for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub source_id: String,
    pub last_date: NaiveDate,
}

/// Physical layout of one persisted series: a table keyed by a unique
/// `date` column plus one integer column per counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table: String,
    pub counters: Vec<String>,
}

impl TableSpec {
    pub fn new(table: impl Into<String>, counters: &[&str]) -> Self {
        Self {
            table: table.into(),
            counters: counters.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Identifiers are interpolated into SQL, so only `[a-z0-9_]` is allowed.
    pub fn is_valid_identifier(ident: &str) -> bool {
        !ident.is_empty()
            && ident
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !ident.starts_with(|c: char| c.is_ascii_digit())
    }

    pub fn is_valid(&self) -> bool {
        Self::is_valid_identifier(&self.table)
            && !self.counters.is_empty()
            && self.counters.iter().all(|c| Self::is_valid_identifier(c))
    }
}

/// Arithmetic mean of one counter over the last `window` historical entries.
/// `value` is `None` when fewer than `window` entries exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingMean {
    pub counter: String,
    pub window: usize,
    pub value: Option<f64>,
}

/// Derived statistics for a newly published report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportMetrics {
    /// Per-counter change versus the immediately prior report.
    pub deltas: BTreeMap<String, i64>,
    pub rolling_means: Vec<RollingMean>,
}

impl ReportMetrics {
    pub fn delta(&self, counter: &str) -> Option<i64> {
        self.deltas.get(counter).copied()
    }

    pub fn rolling_mean(&self, counter: &str, window: usize) -> Option<f64> {
        self.rolling_means
            .iter()
            .find(|m| m.counter == counter && m.window == window)
            .and_then(|m| m.value)
    }
}
