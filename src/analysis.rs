//! Threshold summary over exported runs.
//!
//! Keeps rows whose RPM on one channel is strictly above a threshold and reports
//! count, mean, sample standard deviation and range.

use crate::storage::ExportRecord;
use serde::Serialize;
use std::fmt;

/// Default RPM threshold.
pub const DEFAULT_RPM_THRESHOLD: f64 = 2500.0;

/// Shaft channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Channel {
    /// `RPM A`
    A,
    /// `RPM B`
    B,
}

impl Channel {
    fn rpm(self, record: &ExportRecord) -> f64 {
        match self {
            Self::A => record.rpm_a,
            Self::B => record.rpm_b,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Descriptive statistics of the RPM values above the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RpmSummary {
    /// Channel summarised
    pub channel: Channel,
    /// Values must be strictly above this
    pub threshold: f64,
    /// Values above the threshold
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// Sample standard deviation; `None` with fewer than two values
    pub std_dev: Option<f64>,
    /// Smallest value
    pub min: f64,
    /// Largest value
    pub max: f64,
}

impl fmt::Display for RpmSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RPM {} > {}: count={} mean={:.2} std={} min={:.2} max={:.2}",
            self.channel,
            self.threshold,
            self.count,
            self.mean,
            self.std_dev
                .map_or_else(|| "n/a".to_string(), |s| format!("{s:.2}")),
            self.min,
            self.max
        )
    }
}

/// Summarise `channel` RPM over rows strictly above `threshold`.
///
/// Returns `None` if no row qualifies.
pub fn summarize_above(
    records: &[ExportRecord],
    channel: Channel,
    threshold: f64,
) -> Option<RpmSummary> {
    let values: Vec<f64> = records
        .iter()
        .map(|r| channel.rpm(r))
        .filter(|rpm| *rpm > threshold)
        .collect();
    let count = values.len();
    if count == 0 {
        return None;
    }

    let mean = values.iter().sum::<f64>() / count as f64;
    let std_dev = (count > 1).then(|| {
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    });
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Some(RpmSummary {
        channel,
        threshold,
        count,
        mean,
        std_dev,
        min,
        max,
    })
}
