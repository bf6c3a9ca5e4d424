use crate::model::CommandRecord;
use hdrhistogram::Histogram;

/// Mean per-command duration in seconds. NaN for an empty slice, meaning "no data".
pub fn average_duration(records: &[CommandRecord]) -> f64 {
    if records.is_empty() {
        return f64::NAN;
    }
    records.iter().map(|r| r.duration).sum::<f64>() / records.len() as f64
}

/// Duration distribution of a batch, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationMetrics {
    pub mean: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    pub max: f64,
}

/// Compute mean and percentiles (microsecond resolution) from per-command records.
pub fn compute_metrics(records: &[CommandRecord]) -> Option<DurationMetrics> {
    if records.is_empty() {
        return None;
    }
    let mut hist = Histogram::<u64>::new(3).ok()?;
    for r in records {
        let micros = (r.duration.max(0.0) * 1_000_000.0).round() as u64;
        hist.record(micros.max(1)).ok()?;
    }
    let secs = |v: u64| v as f64 / 1_000_000.0;
    Some(DurationMetrics {
        mean: average_duration(records),
        median: secs(hist.value_at_quantile(0.5)),
        p25: secs(hist.value_at_quantile(0.25)),
        p75: secs(hist.value_at_quantile(0.75)),
        max: secs(hist.max()),
    })
}
