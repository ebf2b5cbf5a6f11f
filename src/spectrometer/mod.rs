//! Call surface of the spectrometer control application.
//!
//! Everything the session does to the instrument goes through [`Spectrometer`].
//! The simulated backend is always available; the TNMR automation backend is
//! Windows-only and behind the `tnmr-com` feature.

#[cfg(all(windows, feature = "tnmr-com"))]
mod com;
mod simulated;

#[cfg(all(windows, feature = "tnmr-com"))]
pub use com::TnmrAutomation;
pub use simulated::{SimDocument, SimulatedSpectrometer};

use crate::model::ParamValue;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Parameter names the acquisition monitor reads.
pub mod params {
    pub const SCANS_1D: &str = "Scans 1D";
    pub const POINTS_2D: &str = "Points 2D";
    pub const POINTS_3D: &str = "Points 3D";
    pub const POINTS_4D: &str = "Points 4D";
    pub const EXP_ELAPSED_TIME: &str = "Exp. Elapsed Time";
    pub const ACTUAL_SCANS_1D: &str = "Actual Scans 1D";
    pub const ACTUAL_POINTS_2D: &str = "Actual Points 2D";
}

#[derive(Error, Debug)]
pub enum SpectrometerError {
    /// Backend could not be reached or created
    #[cfg_attr(not(all(windows, feature = "tnmr-com")), allow(dead_code))]
    #[error("spectrometer connection failed: {0}")]
    Connection(String),

    /// The application has no active document to act on
    #[error("no active document")]
    NoActiveDocument,

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("acquisition already running")]
    AcquisitionRunning,

    /// Automation call rejected by the application
    #[cfg_attr(not(all(windows, feature = "tnmr-com")), allow(dead_code))]
    #[error("{call} failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("document I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document format error for {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type SpectrometerResult<T> = Result<T, SpectrometerError>;

/// Narrow automation surface of the spectrometer application.
///
/// Calls are blocking and expected to return quickly; waiting for an
/// acquisition is done by polling [`Spectrometer::check_acquisition`].
pub trait Spectrometer {
    /// Short backend name for reports.
    fn name(&self) -> &'static str;

    fn active_doc_path(&self) -> SpectrometerResult<Option<PathBuf>>;

    /// Open an experiment file. A file the application cannot open leaves the
    /// active document unchanged rather than failing here.
    fn open_file(&mut self, path: &Path) -> SpectrometerResult<()>;

    /// Close the document at `path`. Closing a document that is not open is a no-op.
    fn close_file(&mut self, path: &Path) -> SpectrometerResult<()>;

    /// Save the active document as `path`, which becomes the active document.
    fn save_as(&mut self, path: &Path) -> SpectrometerResult<()>;

    fn get_param(&self, name: &str) -> SpectrometerResult<ParamValue>;

    fn set_param(&mut self, name: &str, value: &ParamValue) -> SpectrometerResult<()>;

    /// Table values as a comma-separated string.
    fn get_table(&self, name: &str) -> SpectrometerResult<String>;

    fn set_table(&mut self, name: &str, values: &str) -> SpectrometerResult<()>;

    /// Start an acquisition on the active document.
    fn zero_and_go(&mut self) -> SpectrometerResult<()>;

    /// True once the last started acquisition has completed.
    fn check_acquisition(&self) -> SpectrometerResult<bool>;

    fn abort(&mut self) -> SpectrometerResult<()>;

    fn reset(&mut self) -> SpectrometerResult<()>;
}

impl<T: Spectrometer + ?Sized> Spectrometer for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn active_doc_path(&self) -> SpectrometerResult<Option<PathBuf>> {
        (**self).active_doc_path()
    }
    fn open_file(&mut self, path: &Path) -> SpectrometerResult<()> {
        (**self).open_file(path)
    }
    fn close_file(&mut self, path: &Path) -> SpectrometerResult<()> {
        (**self).close_file(path)
    }
    fn save_as(&mut self, path: &Path) -> SpectrometerResult<()> {
        (**self).save_as(path)
    }
    fn get_param(&self, name: &str) -> SpectrometerResult<ParamValue> {
        (**self).get_param(name)
    }
    fn set_param(&mut self, name: &str, value: &ParamValue) -> SpectrometerResult<()> {
        (**self).set_param(name, value)
    }
    fn get_table(&self, name: &str) -> SpectrometerResult<String> {
        (**self).get_table(name)
    }
    fn set_table(&mut self, name: &str, values: &str) -> SpectrometerResult<()> {
        (**self).set_table(name, values)
    }
    fn zero_and_go(&mut self) -> SpectrometerResult<()> {
        (**self).zero_and_go()
    }
    fn check_acquisition(&self) -> SpectrometerResult<bool> {
        (**self).check_acquisition()
    }
    fn abort(&mut self) -> SpectrometerResult<()> {
        (**self).abort()
    }
    fn reset(&mut self) -> SpectrometerResult<()> {
        (**self).reset()
    }
}
