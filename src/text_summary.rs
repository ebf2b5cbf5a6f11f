//! Text summary builder for CLI output.
//!
//! This module computes acquisition metrics and formats human-readable lines.

use crate::metrics;
use crate::model::RunRecord;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished run.
pub(crate) fn build_text_summary(record: &RunRecord) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Experiment directory: {}", record.experiment_dir.display()));
    lines.push(format!(
        "Backend: {}{}",
        record.backend,
        if record.running { "" } else { " (dry run)" }
    ));

    let completed: Vec<_> = record.acquisitions.iter().filter(|a| !a.skipped).collect();
    let skipped = record.acquisitions.len() - completed.len();
    lines.push(format!(
        "Acquisitions: {} completed, {} skipped",
        completed.len(),
        skipped
    ));
    lines.push(format!("Saved files: {}", record.saved_files.len()));
    if let Some(last) = record.saved_files.last() {
        lines.push(format!("Last saved: {}", last.display()));
    }

    let elapsed: Vec<f64> = completed.iter().map(|a| a.elapsed.as_secs_f64()).collect();
    if let Some((mean, median, p25, p75)) = metrics::compute_metrics(&elapsed) {
        lines.push(format!(
            "Acquisition time: avg {:.1} med {:.1} p25 {:.1} p75 {:.1} s",
            mean, median, p25, p75
        ));
    } else if let Some(only) = elapsed.first() {
        lines.push(format!("Acquisition time: {:.1} s", only));
    }

    let pairs: Vec<(f64, f64)> = completed
        .iter()
        .map(|a| (a.elapsed.as_secs_f64(), a.expected.as_secs_f64()))
        .collect();
    let ratios = metrics::overrun_ratios(&pairs);
    if let Some((mean, median, _, p75)) = metrics::compute_metrics(&ratios) {
        lines.push(format!(
            "Actual/expected time: avg {:.2} med {:.2} p75 {:.2}",
            mean, median, p75
        ));
    }

    let stalls: u32 = record.acquisitions.iter().map(|a| a.stall_warnings).sum();
    let repeats: u32 = record.acquisitions.iter().map(|a| a.repeats).sum();
    if stalls > 0 {
        lines.push(format!("Stall warnings: {stalls}"));
    }
    if repeats > 0 {
        lines.push(format!("Repeated acquisitions: {repeats}"));
    }
    if let Some(err) = record.error.as_deref() {
        lines.push(format!("Run failed: {err}"));
    }

    TextSummary { lines }
}
