//! Post-run processing utilities.
//!
//! Closes out the session, saves the run summary next to the data and builds
//! the text summary for the console.

use crate::engine::Session;
use crate::model::RunRecord;
use crate::spectrometer::Spectrometer;
use crate::text_summary;
use anyhow::Result;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub record: RunRecord,
    pub summary_path: std::path::PathBuf,
    pub lines: Vec<String>,
}

/// Finish the session, recording `error` if the run failed.
pub(crate) fn process_run_completion<S: Spectrometer>(
    session: Session<S>,
    error: Option<&anyhow::Error>,
) -> Result<ProcessedRun> {
    let summary_path = session.log_paths().summary.clone();
    let record = session.finish(error.map(|e| format!("{e:#}")))?;
    let lines = text_summary::build_text_summary(&record).lines;
    Ok(ProcessedRun {
        record,
        summary_path,
        lines,
    })
}
