use std::collections::BTreeMap;

use hwatch_core::{Report, ReportMetrics, RollingMean};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("rolling mean over {window} entries requested on an empty series")]
    EmptySeries { window: usize },
}

/// Which counter gets rolling means, and over which windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsPolicy {
    pub rolling_counter: Option<String>,
    pub windows: Vec<usize>,
}

impl MetricsPolicy {
    /// History rows needed: the largest window, and at least one for deltas.
    pub fn history_len(&self) -> usize {
        self.windows.iter().copied().max().unwrap_or(0).max(1)
    }
}

/// Mean of `counter` over the last `window` entries of `series`. Undefined
/// (`None`) when the series is shorter than the window; never computed over a
/// short window.
pub fn rolling_mean(
    series: &[Report],
    counter: &str,
    window: usize,
) -> Result<Option<f64>, MetricsError> {
    if series.is_empty() {
        return Err(MetricsError::EmptySeries { window });
    }
    if window == 0 || series.len() < window {
        return Ok(None);
    }
    let values = series[series.len() - window..]
        .iter()
        .map(|r| r.counter(counter))
        .collect::<Option<Vec<_>>>();
    Ok(values.map(|values| values.iter().sum::<i64>() as f64 / window as f64))
}

/// Change of every counter present in both reports.
pub fn deltas(report: &Report, previous: Option<&Report>) -> BTreeMap<String, i64> {
    let Some(previous) = previous else {
        return BTreeMap::new();
    };
    report
        .counters
        .iter()
        .filter_map(|(name, value)| previous.counter(name).map(|prev| (name.clone(), value - prev)))
        .collect()
}

/// `series` is the history ending just before `report`, oldest first.
pub fn compute_metrics(report: &Report, series: &[Report], policy: &MetricsPolicy) -> ReportMetrics {
    let rolling_means = match &policy.rolling_counter {
        Some(counter) => policy
            .windows
            .iter()
            .map(|&window| RollingMean {
                counter: counter.clone(),
                window,
                value: rolling_mean(series, counter, window).ok().flatten(),
            })
            .collect(),
        None => Vec::new(),
    };

    ReportMetrics {
        deltas: deltas(report, series.last()),
        rolling_means,
    }
}
