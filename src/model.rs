use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Session-level configuration assembled from the CLI and the sweep plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory that relative template paths and the experiment directory hang off.
    pub root: PathBuf,
    /// Experiment directory name, relative to `root`.
    pub directory: String,
    pub unique: bool,
    /// When false nothing is acquired and session sleeps are skipped.
    pub running: bool,
    /// Skip the initial "Ready?" confirmation.
    pub assume_yes: bool,
    /// Plan file archived into the experiment directory.
    #[serde(default)]
    pub plan_path: Option<PathBuf>,
}

/// A scalar acquisition parameter as the vendor application hands it back.
///
/// Many numeric parameters come back as text, so the numeric readers accept
/// numeric strings too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            ParamValue::Float(_) => None,
            ParamValue::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|v| v.fract() == 0.0).map(|v| v as i64))
            }
        }
    }

    /// Parse a `NAME=VALUE` right-hand side, preferring numbers over text.
    pub fn parse_lenient(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(v) = raw.parse::<i64>() {
            ParamValue::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            ParamValue::Float(v)
        } else {
            ParamValue::Text(raw.to_string())
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A line written to the run log or data log, echoed for the console.
    Log { line: String },
    AcquisitionStarted {
        file: Option<PathBuf>,
        #[serde(with = "humantime_serde")]
        expected: Duration,
        total_scans: u64,
    },
    Progress { percent: f64 },
    StallSuspected {
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
        #[serde(with = "humantime_serde")]
        expected: Duration,
        percent: f64,
    },
    AcquisitionFinished {
        // Boxed to keep the enum small.
        record: Box<AcquisitionRecord>,
    },
    /// Operator question, printed without a trailing newline.
    Prompt { question: String },
    Info(InfoEvent),
}

/// Structured info events consumed by the console layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    ExperimentDir { path: PathBuf, created: bool },
    PlanArchived { path: PathBuf },
    DryRun,
    Cancelling,
}

impl InfoEvent {
    /// Render a human-readable message for the console.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::ExperimentDir { path, created } => {
                if *created {
                    format!("Making experiment directory {}", path.display())
                } else {
                    format!("Experiment directory {} exists", path.display())
                }
            }
            InfoEvent::PlanArchived { path } => format!("Plan archived to {}", path.display()),
            InfoEvent::DryRun => "Dry run: acquisitions and sleeps are skipped".to_string(),
            InfoEvent::Cancelling => "Cancelling…".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    pub file: Option<PathBuf>,
    pub total_scans: u64,
    #[serde(with = "humantime_serde")]
    pub expected: Duration,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub stall_warnings: u32,
    /// Times the operator rejected the result and asked for a re-run.
    pub repeats: u32,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub started_utc: String,
    #[serde(default)]
    pub finished_utc: Option<String>,
    pub experiment_dir: PathBuf,
    pub running: bool,
    pub backend: String,
    #[serde(default)]
    pub saved_files: Vec<PathBuf>,
    #[serde(default)]
    pub acquisitions: Vec<AcquisitionRecord>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Current UTC time as RFC 3339.
pub fn now_utc_string() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
