//! Text summary builder for CLI output.
//!
//! Formats stored runs and batches as plain lines for `run` and `show`.

use crate::metrics;
use crate::model::{BatchResult, RunInfo};
use crate::storage::RunExport;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn fmt_secs(v: f64) -> String {
    if v.is_nan() {
        "-".to_string()
    } else {
        format!("{v:.3}s")
    }
}

pub(crate) fn run_line(run: &RunInfo) -> String {
    if run.message.trim().is_empty() {
        format!("{}  {}", run.id, run.date)
    } else {
        format!("{}  {}  {}", run.id, run.date, run.message)
    }
}

fn batch_line(b: &BatchResult) -> String {
    format!(
        "{} [{}] {}/{} total {} avg {} mem {:+} MB load {:+.2} disk {:+} MB",
        b.batch,
        b.backend,
        b.numrecs,
        b.count,
        fmt_secs(b.total_time),
        fmt_secs(b.avg_time),
        b.mem_increase,
        b.load_increase,
        b.disk_increase
    )
}

/// Build the summary of one run. Per-command lines and a percentile line are
/// included for batches whose records were loaded.
pub(crate) fn build_text_summary(export: &RunExport) -> TextSummary {
    let mut lines = Vec::new();
    lines.push(format!("Run {}", run_line(&export.run)));
    if let Some(image) = export.batches.first().map(|b| b.result.image.as_str()) {
        lines.push(format!("Image: {image}"));
    }
    if export.batches.is_empty() {
        lines.push("No batches recorded.".to_string());
    }

    for b in &export.batches {
        lines.push(batch_line(&b.result));
        let Some(records) = b.records.as_deref() else {
            continue;
        };
        for r in records {
            lines.push(format!("    {:>9}  {}", fmt_secs(r.duration), r.command));
        }
        if let Some(m) = metrics::compute_metrics(records) {
            lines.push(format!(
                "    avg {} med {} p25 {} p75 {} max {}",
                fmt_secs(m.mean),
                fmt_secs(m.median),
                fmt_secs(m.p25),
                fmt_secs(m.p75),
                fmt_secs(m.max)
            ));
        }
    }

    TextSummary { lines }
}
