//! Plain-text run and data logs kept in the experiment directory.

use crate::model::SessionEvent;
use anyhow::{Context, Result};
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;

/// Append-only text log that echoes every line to the console layer.
///
/// The file is reopened for each line so that nothing written before a crash
/// is lost.
#[derive(Debug, Clone)]
pub struct TextLog {
    path: PathBuf,
    echo: Option<UnboundedSender<SessionEvent>>,
}

impl TextLog {
    /// Create (or truncate) the log file.
    pub fn create(path: &Path, echo: Option<UnboundedSender<SessionEvent>>) -> Result<Self> {
        std::fs::write(path, "").with_context(|| format!("create log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            echo,
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open log {}", self.path.display()))?;
        writeln!(f, "{line}").with_context(|| format!("write log {}", self.path.display()))?;
        if let Some(tx) = &self.echo {
            let _ = tx.send(SessionEvent::Log { line });
        }
        Ok(())
    }

    /// Write one comma-separated record.
    pub fn record<T: Display>(&self, values: &[T]) -> Result<()> {
        let line = values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.line(line)
    }
}
