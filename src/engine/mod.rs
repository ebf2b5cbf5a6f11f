//! Spectrometer control session.
//!
//! A [`Session`] owns the backend, the experiment directory and its logs, and
//! keeps at most one experiment file open at a time: opening a file closes the
//! previously current one, and saving under a new name closes the old path.

mod acquisition;

use acquisition::sleep_unless_cancelled;

use crate::model::{
    now_utc_string, AcquisitionRecord, InfoEvent, ParamValue, RunRecord, SessionConfig,
    SessionEvent,
};
use crate::prompt::{is_negative, Prompter};
use crate::runlog::TextLog;
use crate::spectrometer::{params, Spectrometer};
use crate::workspace::{self, ExperimentDir, LogPaths};
use anyhow::{Context, Result};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Session<S: Spectrometer> {
    cfg: SessionConfig,
    spectrometer: S,
    prompter: Box<dyn Prompter>,
    exp: ExperimentDir,
    logs: LogPaths,
    run_log: TextLog,
    data_log: TextLog,
    /// The experiment file this session considers open.
    current: Option<PathBuf>,
    event_tx: Option<mpsc::UnboundedSender<SessionEvent>>,
    cancel: Arc<AtomicBool>,
    record: RunRecord,
}

fn is_active(active: Option<&Path>, path: &Path) -> bool {
    active.is_some_and(|a| workspace::same_file(a, path))
}

impl<S: Spectrometer> Session<S> {
    /// Prepare the experiment directory and logs, then wait for the operator.
    pub fn start(
        mut cfg: SessionConfig,
        spectrometer: S,
        prompter: Box<dyn Prompter>,
        event_tx: Option<mpsc::UnboundedSender<SessionEvent>>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        // The application runs in its own working directory.
        cfg.root = std::path::absolute(&cfg.root)
            .with_context(|| format!("resolve root {}", cfg.root.display()))?;
        let exp = workspace::resolve_experiment_dir(&cfg.root, &cfg.directory, cfg.unique)?;
        let emit = |ev: SessionEvent| {
            if let Some(tx) = &event_tx {
                let _ = tx.send(ev);
            }
        };
        emit(SessionEvent::Info(InfoEvent::ExperimentDir {
            path: exp.path.clone(),
            created: exp.created,
        }));

        let suffix = match cfg.plan_path.as_deref() {
            Some(plan) => {
                let (archived, plan_suffix) = workspace::archive_plan(&exp.path, plan)?;
                emit(SessionEvent::Info(InfoEvent::PlanArchived { path: archived }));
                workspace::later_suffix(
                    plan_suffix,
                    workspace::version_suffix(&exp.path, "run_log", Some("txt")),
                )
            }
            None => workspace::version_suffix(&exp.path, "run_log", Some("txt")),
        };
        let logs = workspace::log_paths(&exp.path, &suffix);
        let run_log = TextLog::create(&logs.run_log, event_tx.clone())?;
        let data_log = TextLog::create(&logs.data_log, None)?;

        let current = spectrometer
            .active_doc_path()
            .context("query active document")?;
        let record = RunRecord {
            started_utc: now_utc_string(),
            finished_utc: None,
            experiment_dir: exp.path.clone(),
            running: cfg.running,
            backend: spectrometer.name().to_string(),
            saved_files: Vec::new(),
            acquisitions: Vec::new(),
            error: None,
        };

        let mut session = Self {
            cfg,
            spectrometer,
            prompter,
            exp,
            logs,
            run_log,
            data_log,
            current,
            event_tx,
            cancel,
            record,
        };
        session.report()?;
        if !session.cfg.running {
            session.emit(SessionEvent::Info(InfoEvent::DryRun));
        }
        if !session.cfg.assume_yes {
            let answer = session.prompter.ask("Ready?")?;
            anyhow::ensure!(!is_negative(&answer), "operator declined to start the run");
        }
        Ok(session)
    }

    fn emit(&self, ev: SessionEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    #[cfg(test)]
    pub fn experiment_dir(&self) -> &Path {
        &self.exp.path
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    #[cfg(test)]
    pub fn spectrometer(&self) -> &S {
        &self.spectrometer
    }

    pub fn log_paths(&self) -> &LogPaths {
        &self.logs
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Resolve an experiment file name against this session's directories.
    pub fn resolve(&self, file: &str) -> PathBuf {
        workspace::resolve_file(&self.exp.root, &self.exp.path, file)
    }

    /// Write the session configuration to the run log.
    pub fn report(&self) -> Result<()> {
        self.run_log.line(format!("root = {}", self.exp.root.display()))?;
        self.run_log
            .line(format!("experiment_dir = {}", self.exp.path.display()))?;
        self.run_log.line(format!("running = {}", self.cfg.running))?;
        self.run_log.line(format!("unique = {}", self.cfg.unique))?;
        self.run_log
            .line(format!("backend = {}", self.spectrometer.name()))?;
        self.run_log.line(format!(
            "current = {}",
            self.current
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into())
        ))
    }

    /// Open an experiment file, closing the previously current one.
    pub fn open(&mut self, file: &str) -> Result<()> {
        let path = self.resolve(file);
        self.run_log.line("")?;
        self.run_log.line("---------------")?;
        self.run_log.line(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )?;
        self.run_log.line(format!(" OPENING {}", path.display()))?;

        // Loops reopen the same file; leave it alone.
        if is_active(self.spectrometer.active_doc_path()?.as_deref(), &path) {
            self.run_log.line("  Already Opened")?;
            self.current = Some(path);
            return self.run_log.line("");
        }

        tracing::debug!(path = %path.display(), "open");
        self.spectrometer.open_file(&path)?;
        let active = self.spectrometer.active_doc_path()?;
        if !is_active(active.as_deref(), &path) {
            self.run_log.line("    Could not open")?;
            self.run_log.line(path.display().to_string())?;
            self.run_log.line(
                active
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".into()),
            )?;
            anyhow::bail!("could not open {}", path.display());
        }

        if let Some(previous) = self.current.take() {
            if !workspace::same_file(&previous, &path) {
                self.close_path(&previous)?;
            }
        }
        self.current = Some(path);
        self.run_log.line("")
    }

    /// Close an experiment file. Not needed between opens, which close the
    /// current file themselves.
    pub fn close(&mut self, file: &str) -> Result<()> {
        let path = self.resolve(file);
        self.close_path(&path)?;
        if is_active(self.current.as_deref(), &path) {
            self.current = self.spectrometer.active_doc_path()?;
        }
        Ok(())
    }

    fn close_path(&mut self, path: &Path) -> Result<()> {
        self.run_log.line(format!("  CLOSED {}", path.display()))?;
        tracing::debug!(path = %path.display(), "close");
        self.spectrometer.close_file(path)?;
        Ok(())
    }

    /// Save the current file under a new name, which becomes current.
    pub fn save_as(&mut self, file: &str) -> Result<PathBuf> {
        let path = self.resolve(file);
        let previous = self.current.clone();
        self.run_log.line(format!(
            "  SAVING {}",
            previous
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into())
        ))?;
        self.run_log.line(format!("      AS {}", path.display()))?;
        tracing::debug!(path = %path.display(), "save as");
        self.spectrometer
            .save_as(&path)
            .with_context(|| format!("save {}", path.display()))?;
        if let Some(previous) = previous {
            if !workspace::same_file(&previous, &path) {
                self.close_path(&previous)?;
            }
        }
        self.current = self.spectrometer.active_doc_path()?;
        self.record.saved_files.push(path.clone());
        self.run_log.line("")?;
        Ok(path)
    }

    pub fn get_param(&mut self, name: &str) -> Result<ParamValue> {
        let value = self
            .spectrometer
            .get_param(name)
            .with_context(|| format!("read parameter {name}"))?;
        self.run_log
            .line(format!("    - {name} has value {value}"))?;
        Ok(value)
    }

    pub fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        self.run_log
            .line(format!("    -Setting {name} to {value}"))?;
        self.spectrometer
            .set_param(name, value)
            .with_context(|| format!("set parameter {name}"))?;
        Ok(())
    }

    pub fn get_table(&mut self, name: &str) -> Result<String> {
        let values = self
            .spectrometer
            .get_table(name)
            .with_context(|| format!("read table {name}"))?;
        self.run_log
            .line(format!("    - {name} has values {values}"))?;
        Ok(values)
    }

    /// Replace a table; `values` is comma separated.
    pub fn set_table(&mut self, name: &str, values: &str) -> Result<()> {
        self.run_log
            .line(format!("    -Setting {name} to {values}"))?;
        self.spectrometer
            .set_table(name, values)
            .with_context(|| format!("set table {name}"))?;
        Ok(())
    }

    /// Write an operator line to the data log.
    pub fn log(&self, line: &str) -> Result<()> {
        self.data_log.line(line)?;
        self.emit(SessionEvent::Log {
            line: line.to_string(),
        });
        Ok(())
    }

    /// Write a comma-separated record to the data log.
    pub fn log_values<T: Display>(&self, values: &[T]) -> Result<()> {
        self.data_log.record(values)?;
        let line = values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.emit(SessionEvent::Log { line });
        Ok(())
    }

    /// Sleep, but only when actually running.
    pub async fn sleep(&self, d: Duration) -> Result<()> {
        if !self.cfg.running {
            return Ok(());
        }
        if !sleep_unless_cancelled(d, &self.cancel).await {
            anyhow::bail!("sleep cancelled");
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.run_log.line("Resetting Hardware")?;
        self.spectrometer.reset()?;
        Ok(())
    }

    fn count_param(&self, name: &str) -> Result<u64> {
        let v = self
            .spectrometer
            .get_param(name)
            .with_context(|| format!("read parameter {name}"))?;
        let n = v
            .as_i64()
            .with_context(|| format!("{name} is not an integer: {v}"))?;
        Ok(n.max(0) as u64)
    }

    /// Zero-and-go: run the current file and wait for completion.
    ///
    /// With `manual_check` the operator is asked whether the result is
    /// acceptable; a negative answer repeats the acquisition.
    pub async fn zg(&mut self, manual_check: bool) -> Result<AcquisitionRecord> {
        let scans_1d = self.count_param(params::SCANS_1D)?;
        let points_2d = self.count_param(params::POINTS_2D)?;
        anyhow::ensure!(
            scans_1d >= 1 && points_2d >= 1,
            "{} and {} must be at least 1 (got {scans_1d} and {points_2d})",
            params::SCANS_1D,
            params::POINTS_2D
        );
        let total_scans = scans_1d * points_2d;

        let points_3d = self.count_param(params::POINTS_3D)?;
        let points_4d = self.count_param(params::POINTS_4D)?;
        anyhow::ensure!(
            points_3d * points_4d <= 1,
            "3D and 4D acquisitions are not supported ({} = {points_3d}, {} = {points_4d})",
            params::POINTS_3D,
            params::POINTS_4D
        );

        let mut repeats = 0u32;
        loop {
            let mut record = if self.cfg.running {
                acquisition::run_acquisition(acquisition::AcquisitionParams {
                    spectrometer: &mut self.spectrometer,
                    scans_1d,
                    total_scans,
                    run_log: &self.run_log,
                    event_tx: self.event_tx.as_ref(),
                    cancel: self.cancel.clone(),
                })
                .await?
            } else {
                self.run_log.line(" DRY RUN: acquisition skipped")?;
                AcquisitionRecord {
                    total_scans,
                    skipped: true,
                    ..Default::default()
                }
            };

            if manual_check {
                let answer = self.prompter.ask("Happy?")?;
                if is_negative(&answer) {
                    repeats += 1;
                    self.run_log.line("  Repeating acquisition")?;
                    continue;
                }
            }

            record.repeats = repeats;
            record.file = self.current.clone();
            self.record.acquisitions.push(record.clone());
            self.emit(SessionEvent::AcquisitionFinished {
                record: Box::new(record.clone()),
            });
            return Ok(record);
        }
    }

    /// Close out the run and save its summary next to the data.
    pub fn finish(mut self, error: Option<String>) -> Result<RunRecord> {
        self.record.finished_utc = Some(now_utc_string());
        self.record.error = error;
        let json = serde_json::to_string_pretty(&self.record)?;
        std::fs::write(&self.logs.summary, json)
            .with_context(|| format!("write {}", self.logs.summary.display()))?;
        self.run_log
            .line(format!("Run summary saved to {}", self.logs.summary.display()))?;
        Ok(self.record)
    }
}
