//! In-process stand-in for the spectrometer application.
//!
//! Experiment files are JSON documents on disk, so sweep plans can be
//! rehearsed end to end without the instrument. Acquisitions advance on the
//! tokio clock, which lets tests drive them with paused time.

use super::{params, Spectrometer, SpectrometerError, SpectrometerResult};
use crate::model::ParamValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Simulated experiment file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimDocument {
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub tables: BTreeMap<String, String>,
    /// Number of acquisitions run on this document.
    #[serde(default)]
    pub acquisitions: u32,
}

impl SimDocument {
    /// A one-dimensional, single-scan document.
    pub fn with_defaults() -> Self {
        let mut doc = Self::default();
        for name in [
            params::SCANS_1D,
            params::POINTS_2D,
            params::POINTS_3D,
            params::POINTS_4D,
        ] {
            doc.params.insert(name.to_string(), ParamValue::Int(1));
        }
        doc
    }

    pub fn load(path: &Path) -> SpectrometerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| SpectrometerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SpectrometerError::Format {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> SpectrometerResult<()> {
        let raw = serde_json::to_string_pretty(self).map_err(|source| SpectrometerError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, raw).map_err(|source| SpectrometerError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn count(&self, name: &str) -> u64 {
        self.params
            .get(name)
            .and_then(ParamValue::as_i64)
            .map(|v| v.max(1) as u64)
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct SimAcquisition {
    started: Instant,
    scans_1d: u64,
    total_scans: u64,
}

#[derive(Debug)]
pub struct SimulatedSpectrometer {
    docs: BTreeMap<PathBuf, SimDocument>,
    active: Option<PathBuf>,
    acquisition: Option<SimAcquisition>,
    /// Time per scan used for the reported expected duration.
    scan_time: Duration,
    /// Factor applied to the real time per scan; above 1.0 the acquisition
    /// runs slower than the application predicts.
    slowdown: f64,
    zg_count: u32,
    resets: u32,
}

impl Default for SimulatedSpectrometer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl SimulatedSpectrometer {
    pub fn new(scan_time: Duration) -> Self {
        Self {
            docs: BTreeMap::new(),
            active: None,
            acquisition: None,
            scan_time,
            slowdown: 1.0,
            zg_count: 0,
            resets: 0,
        }
    }

    pub fn with_slowdown(mut self, slowdown: f64) -> Self {
        self.slowdown = slowdown.max(f64::MIN_POSITIVE);
        self
    }

    /// Paths of the documents currently open, in path order.
    #[cfg(test)]
    pub fn open_documents(&self) -> Vec<&Path> {
        self.docs.keys().map(PathBuf::as_path).collect()
    }

    #[cfg(test)]
    pub fn zg_count(&self) -> u32 {
        self.zg_count
    }

    #[cfg(test)]
    pub fn resets(&self) -> u32 {
        self.resets
    }

    fn active_doc(&self) -> SpectrometerResult<&SimDocument> {
        self.active
            .as_ref()
            .and_then(|p| self.docs.get(p))
            .ok_or(SpectrometerError::NoActiveDocument)
    }

    fn active_doc_mut(&mut self) -> SpectrometerResult<&mut SimDocument> {
        let path = self
            .active
            .clone()
            .ok_or(SpectrometerError::NoActiveDocument)?;
        self.docs
            .get_mut(&path)
            .ok_or(SpectrometerError::NoActiveDocument)
    }

    fn expected_duration(&self, total_scans: u64) -> Duration {
        self.scan_time.saturating_mul(total_scans.min(u32::MAX as u64) as u32)
    }

    /// Scans completed so far in the running (or last) acquisition.
    fn completed_scans(&self) -> u64 {
        let Some(acq) = self.acquisition else {
            return 0;
        };
        let per_scan = self.scan_time.as_secs_f64() * self.slowdown;
        if per_scan <= 0.0 {
            return acq.total_scans;
        }
        let done = (acq.started.elapsed().as_secs_f64() / per_scan).floor() as u64;
        done.min(acq.total_scans)
    }

    /// (`Actual Scans 1D`, `Actual Points 2D`) for the current acquisition.
    fn actual_progress(&self) -> (u64, u64) {
        let Some(acq) = self.acquisition else {
            return (0, 1);
        };
        let done = self.completed_scans();
        if done >= acq.total_scans {
            (acq.scans_1d, acq.total_scans / acq.scans_1d)
        } else {
            (done % acq.scans_1d, done / acq.scans_1d + 1)
        }
    }
}

/// Format a duration the way the application reports elapsed time.
pub(crate) fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

impl Spectrometer for SimulatedSpectrometer {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn active_doc_path(&self) -> SpectrometerResult<Option<PathBuf>> {
        Ok(self.active.clone())
    }

    fn open_file(&mut self, path: &Path) -> SpectrometerResult<()> {
        if self.docs.contains_key(path) {
            self.active = Some(path.to_path_buf());
            return Ok(());
        }
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "simulated open: no such file");
            return Ok(());
        }
        let doc = SimDocument::load(path)?;
        self.docs.insert(path.to_path_buf(), doc);
        self.active = Some(path.to_path_buf());
        Ok(())
    }

    fn close_file(&mut self, path: &Path) -> SpectrometerResult<()> {
        if self.docs.remove(path).is_some() && self.active.as_deref() == Some(path) {
            self.active = self.docs.keys().next_back().cloned();
        }
        Ok(())
    }

    fn save_as(&mut self, path: &Path) -> SpectrometerResult<()> {
        let old = self
            .active
            .clone()
            .ok_or(SpectrometerError::NoActiveDocument)?;
        let doc = self
            .docs
            .remove(&old)
            .ok_or(SpectrometerError::NoActiveDocument)?;
        doc.save(path)?;
        self.docs.insert(path.to_path_buf(), doc);
        self.active = Some(path.to_path_buf());
        Ok(())
    }

    fn get_param(&self, name: &str) -> SpectrometerResult<ParamValue> {
        let doc = self.active_doc()?;
        match name {
            params::EXP_ELAPSED_TIME => {
                let total = doc.count(params::SCANS_1D) * doc.count(params::POINTS_2D);
                Ok(ParamValue::Text(format_hms(self.expected_duration(total))))
            }
            params::ACTUAL_SCANS_1D => Ok(ParamValue::Int(self.actual_progress().0 as i64)),
            params::ACTUAL_POINTS_2D => Ok(ParamValue::Int(self.actual_progress().1 as i64)),
            params::SCANS_1D | params::POINTS_2D | params::POINTS_3D | params::POINTS_4D => {
                Ok(ParamValue::Int(doc.count(name) as i64))
            }
            _ => doc
                .params
                .get(name)
                .cloned()
                .ok_or_else(|| SpectrometerError::UnknownParameter(name.to_string())),
        }
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> SpectrometerResult<()> {
        let doc = self.active_doc_mut()?;
        doc.params.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn get_table(&self, name: &str) -> SpectrometerResult<String> {
        self.active_doc()?
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| SpectrometerError::UnknownTable(name.to_string()))
    }

    fn set_table(&mut self, name: &str, values: &str) -> SpectrometerResult<()> {
        let doc = self.active_doc_mut()?;
        doc.tables.insert(name.to_string(), values.to_string());
        Ok(())
    }

    fn zero_and_go(&mut self) -> SpectrometerResult<()> {
        if !self.check_acquisition()? {
            return Err(SpectrometerError::AcquisitionRunning);
        }
        let doc = self.active_doc_mut()?;
        doc.acquisitions += 1;
        let scans_1d = doc.count(params::SCANS_1D);
        let total_scans = scans_1d * doc.count(params::POINTS_2D);
        self.acquisition = Some(SimAcquisition {
            started: Instant::now(),
            scans_1d,
            total_scans,
        });
        self.zg_count += 1;
        Ok(())
    }

    fn check_acquisition(&self) -> SpectrometerResult<bool> {
        Ok(match self.acquisition {
            Some(acq) => self.completed_scans() >= acq.total_scans,
            None => true,
        })
    }

    fn abort(&mut self) -> SpectrometerResult<()> {
        self.acquisition = None;
        Ok(())
    }

    fn reset(&mut self) -> SpectrometerResult<()> {
        self.acquisition = None;
        self.resets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(dir: &Path, name: &str, scans: i64, points: i64) -> PathBuf {
        let mut doc = SimDocument::with_defaults();
        doc.params
            .insert(params::SCANS_1D.into(), ParamValue::Int(scans));
        doc.params
            .insert(params::POINTS_2D.into(), ParamValue::Int(points));
        let path = dir.join(name);
        doc.save(&path).unwrap();
        path
    }

    #[test]
    fn opening_missing_file_leaves_active_document() {
        let dir = tempfile::tempdir().unwrap();
        let a = template(dir.path(), "a.tnt", 1, 1);
        let mut sim = SimulatedSpectrometer::default();
        sim.open_file(&a).unwrap();
        sim.open_file(&dir.path().join("missing.tnt")).unwrap();
        assert_eq!(sim.active_doc_path().unwrap(), Some(a));
    }

    #[test]
    fn save_as_moves_the_active_document() {
        let dir = tempfile::tempdir().unwrap();
        let a = template(dir.path(), "a.tnt", 1, 1);
        let b = dir.path().join("b.tnt");
        let mut sim = SimulatedSpectrometer::default();
        sim.open_file(&a).unwrap();
        sim.set_param("Receiver Gain", &ParamValue::Int(60)).unwrap();
        sim.save_as(&b).unwrap();

        assert_eq!(sim.active_doc_path().unwrap(), Some(b.clone()));
        assert_eq!(sim.open_documents(), vec![b.as_path()]);
        let saved = SimDocument::load(&b).unwrap();
        assert_eq!(saved.params.get("Receiver Gain"), Some(&ParamValue::Int(60)));
        // The template on disk is untouched.
        assert!(SimDocument::load(&a).unwrap().params.get("Receiver Gain").is_none());
    }

    #[test]
    fn closing_unopened_document_is_noop() {
        let mut sim = SimulatedSpectrometer::default();
        sim.close_file(Path::new("nothing.tnt")).unwrap();
        assert!(sim.active_doc_path().unwrap().is_none());
    }

    #[test]
    fn expected_time_reported_as_hms() {
        assert_eq!(format_hms(Duration::from_secs(3725)), "01:02:05");
        let dir = tempfile::tempdir().unwrap();
        let a = template(dir.path(), "a.tnt", 4, 3);
        let mut sim = SimulatedSpectrometer::new(Duration::from_secs(5));
        sim.open_file(&a).unwrap();
        assert_eq!(
            sim.get_param(params::EXP_ELAPSED_TIME).unwrap(),
            ParamValue::Text("00:01:00".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_progress_follows_clock() {
        let dir = tempfile::tempdir().unwrap();
        let a = template(dir.path(), "a.tnt", 4, 3);
        let mut sim = SimulatedSpectrometer::new(Duration::from_secs(1));
        sim.open_file(&a).unwrap();
        sim.zero_and_go().unwrap();
        assert!(!sim.check_acquisition().unwrap());
        assert!(matches!(
            sim.zero_and_go(),
            Err(SpectrometerError::AcquisitionRunning)
        ));

        tokio::time::advance(Duration::from_millis(5500)).await;
        // 5 scans done: second row, one scan in.
        assert_eq!(sim.get_param(params::ACTUAL_SCANS_1D).unwrap(), ParamValue::Int(1));
        assert_eq!(sim.get_param(params::ACTUAL_POINTS_2D).unwrap(), ParamValue::Int(2));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(sim.check_acquisition().unwrap());
        assert_eq!(sim.get_param(params::ACTUAL_SCANS_1D).unwrap(), ParamValue::Int(4));
        assert_eq!(sim.get_param(params::ACTUAL_POINTS_2D).unwrap(), ParamValue::Int(3));
    }

    #[tokio::test(start_paused = true)]
    async fn slowdown_stretches_the_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let a = template(dir.path(), "a.tnt", 2, 1);
        let mut sim = SimulatedSpectrometer::new(Duration::from_secs(1)).with_slowdown(3.0);
        sim.open_file(&a).unwrap();
        sim.zero_and_go().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!sim.check_acquisition().unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(sim.check_acquisition().unwrap());
    }
}
