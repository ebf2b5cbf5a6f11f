use crate::model::{AcquisitionRecord, SessionEvent};
use crate::runlog::TextLog;
use crate::spectrometer::{params, Spectrometer};
use anyhow::{Context, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Zero progress is only suspicious after this long (or after the expected
/// duration, whichever is later).
pub const ZERO_PROGRESS_GRACE: Duration = Duration::from_secs(20);

/// Pause between triggering zg and reading the expected duration.
const SETTLE: Duration = Duration::from_millis(100);

/// Granularity at which sleeps notice a cancel request.
const CANCEL_SLICE: Duration = Duration::from_millis(100);

/// Parse the application's elapsed-time field (`HH:MM:SS`, `MM:SS` or `SS`).
pub fn parse_elapsed_time(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split(':').collect();
    anyhow::ensure!(
        !raw.is_empty() && parts.len() <= 3,
        "unrecognised elapsed time {raw:?}"
    );
    let mut secs = 0f64;
    for part in parts {
        let v: f64 = part
            .trim()
            .parse()
            .with_context(|| format!("unrecognised elapsed time {raw:?}"))?;
        anyhow::ensure!(v.is_finite() && v >= 0.0, "unrecognised elapsed time {raw:?}");
        secs = secs * 60.0 + v;
    }
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("elapsed time {raw:?} out of range"))
}

/// Poll every ninth of the expected duration, but no faster than once a second.
pub fn poll_interval(expected: Duration) -> Duration {
    (expected / 9).max(Duration::from_secs(1))
}

/// Completed fraction of the acquisition in percent, from the live counters.
pub fn percent_done(actual_scans_1d: u64, actual_points_2d: u64, scans_1d: u64, total_scans: u64) -> f64 {
    if total_scans == 0 {
        return 100.0;
    }
    let done = actual_scans_1d as f64 + (actual_points_2d as f64 - 1.0) * scans_1d as f64;
    (100.0 * done / total_scans as f64).clamp(0.0, 100.0)
}

/// Whether the acquisition looks stuck: time is running more than twice as
/// fast as progress, or nothing has happened well past the grace period.
pub fn stall_suspected(elapsed: Duration, expected: Duration, percent: f64) -> bool {
    if percent <= 0.0 {
        return elapsed > ZERO_PROGRESS_GRACE.max(expected);
    }
    let expected = expected.as_secs_f64().max(f64::MIN_POSITIVE);
    elapsed.as_secs_f64() / expected > 2.0 * percent / 100.0
}

/// Tracks 10% progress milestones.
#[derive(Debug, Clone)]
pub struct Milestones {
    next: f64,
}

impl Default for Milestones {
    fn default() -> Self {
        Self { next: 10.0 }
    }
}

impl Milestones {
    /// Returns the percentage to report when a milestone has been crossed.
    pub fn update(&mut self, percent: f64) -> Option<f64> {
        if percent < self.next {
            return None;
        }
        self.next = ((percent / 10.0).floor() + 1.0) * 10.0;
        Some(percent)
    }
}

/// Sleep for `d`, returning false early if `cancel` is raised.
pub(crate) async fn sleep_unless_cancelled(d: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + d;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_SLICE)).await;
    }
}

/// Parameters for one acquisition wait.
pub(crate) struct AcquisitionParams<'a, S: ?Sized> {
    pub spectrometer: &'a mut S,
    pub scans_1d: u64,
    pub total_scans: u64,
    pub run_log: &'a TextLog,
    pub event_tx: Option<&'a mpsc::UnboundedSender<SessionEvent>>,
    pub cancel: Arc<AtomicBool>,
}

fn read_count<S: Spectrometer + ?Sized>(spectrometer: &S, name: &str) -> Result<u64> {
    let v = spectrometer.get_param(name)?;
    v.as_i64()
        .map(|v| v.max(0) as u64)
        .with_context(|| format!("{name} is not a number: {v}"))
}

/// Trigger zero-and-go and wait for the acquisition to complete.
pub(crate) async fn run_acquisition<S: Spectrometer + ?Sized>(
    args: AcquisitionParams<'_, S>,
) -> Result<AcquisitionRecord> {
    let AcquisitionParams {
        spectrometer,
        scans_1d,
        total_scans,
        run_log,
        event_tx,
        cancel,
    } = args;
    let emit = |ev: SessionEvent| {
        if let Some(tx) = event_tx {
            let _ = tx.send(ev);
        }
    };

    run_log.line("")?;
    run_log.line(" RUNNING")?;
    spectrometer.zero_and_go()?;
    let t0 = Instant::now();
    tokio::time::sleep(SETTLE).await;

    let expected_raw = spectrometer.get_param(params::EXP_ELAPSED_TIME)?.to_string();
    let mut expected = parse_elapsed_time(&expected_raw)?;
    if expected.is_zero() {
        expected = Duration::from_secs(1);
    }
    run_log.line(format!("expected_time_str = {expected_raw}"))?;
    run_log.line(format!("expected_time = {}s", expected.as_secs()))?;
    run_log.line(format!("total_scans = {total_scans}"))?;
    tracing::info!(?expected, total_scans, "acquisition started");
    emit(SessionEvent::AcquisitionStarted {
        file: spectrometer.active_doc_path()?,
        expected,
        total_scans,
    });

    let interval = poll_interval(expected);
    let mut milestones = Milestones::default();
    let mut stall_warnings = 0u32;

    loop {
        if !sleep_unless_cancelled(interval, &cancel).await {
            run_log.line(" ABORTED by operator")?;
            spectrometer.abort()?;
            anyhow::bail!("acquisition cancelled");
        }

        let done = spectrometer.check_acquisition()?;
        let actual_scans = read_count(&*spectrometer, params::ACTUAL_SCANS_1D)?;
        let actual_points = read_count(&*spectrometer, params::ACTUAL_POINTS_2D)?;
        let percent = if done {
            100.0
        } else {
            percent_done(actual_scans, actual_points, scans_1d, total_scans)
        };
        let elapsed = t0.elapsed();

        if !done && stall_suspected(elapsed, expected, percent) {
            stall_warnings += 1;
            tracing::warn!(?elapsed, ?expected, percent, "acquisition may have stalled");
            run_log.line(format!(
                "Collect failed? {:.1} % after {:.0}s of {}s",
                percent,
                elapsed.as_secs_f64(),
                expected.as_secs()
            ))?;
            emit(SessionEvent::StallSuspected {
                elapsed,
                expected,
                percent,
            });
        }

        if let Some(reached) = milestones.update(percent) {
            run_log.line(format!("percent_done = {reached:.1} %"))?;
            emit(SessionEvent::Progress { percent: reached });
        }

        if done {
            let elapsed = t0.elapsed();
            tracing::info!(?elapsed, stall_warnings, "acquisition finished");
            return Ok(AcquisitionRecord {
                file: spectrometer.active_doc_path()?,
                total_scans,
                expected,
                elapsed,
                stall_warnings,
                repeats: 0,
                skipped: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamValue;
    use crate::spectrometer::{SimDocument, SimulatedSpectrometer};

    #[test]
    fn elapsed_time_formats() {
        assert_eq!(parse_elapsed_time("01:02:05").unwrap(), Duration::from_secs(3725));
        assert_eq!(parse_elapsed_time("02:05").unwrap(), Duration::from_secs(125));
        assert_eq!(parse_elapsed_time(" 42 ").unwrap(), Duration::from_secs(42));
        assert_eq!(parse_elapsed_time("00:00:00").unwrap(), Duration::ZERO);
        assert!(parse_elapsed_time("").is_err());
        assert!(parse_elapsed_time("1:2:3:4").is_err());
        assert!(parse_elapsed_time("aa:00:01").is_err());
        assert!(parse_elapsed_time("99999999999999999999").is_err());
    }

    #[test]
    fn poll_interval_is_a_ninth_with_floor() {
        assert_eq!(poll_interval(Duration::from_secs(90)), Duration::from_secs(10));
        assert_eq!(poll_interval(Duration::from_secs(3)), Duration::from_secs(1));
    }

    #[test]
    fn percent_counts_completed_rows() {
        // 4 scans per row, 3 rows: second row with one scan done is 5/12.
        let p = percent_done(1, 2, 4, 12);
        assert!((p - 500.0 / 12.0).abs() < 1e-9);
        assert_eq!(percent_done(0, 1, 4, 12), 0.0);
        assert_eq!(percent_done(4, 3, 4, 12), 100.0);
        assert_eq!(percent_done(0, 0, 4, 12), 0.0);
    }

    #[test]
    fn stall_detection() {
        let expected = Duration::from_secs(100);
        // On schedule.
        assert!(!stall_suspected(Duration::from_secs(50), expected, 50.0));
        // Time running more than twice as fast as progress.
        assert!(stall_suspected(Duration::from_secs(50), expected, 20.0));
        // No progress: only flagged after the grace and the expected time.
        assert!(!stall_suspected(Duration::from_secs(30), expected, 0.0));
        assert!(stall_suspected(Duration::from_secs(101), expected, 0.0));
        assert!(!stall_suspected(Duration::from_secs(15), Duration::from_secs(5), 0.0));
        assert!(stall_suspected(Duration::from_secs(21), Duration::from_secs(5), 0.0));
    }

    #[test]
    fn milestones_fire_once_per_decade() {
        let mut m = Milestones::default();
        assert_eq!(m.update(5.0), None);
        assert_eq!(m.update(12.0), Some(12.0));
        assert_eq!(m.update(15.0), None);
        assert_eq!(m.update(47.0), Some(47.0));
        assert_eq!(m.update(49.9), None);
        assert_eq!(m.update(100.0), Some(100.0));
        assert_eq!(m.update(100.0), None);
    }

    fn open_sim(dir: &std::path::Path, scans: i64, points: i64, sim: &mut SimulatedSpectrometer) {
        let mut doc = SimDocument::with_defaults();
        doc.params.insert(params::SCANS_1D.into(), ParamValue::Int(scans));
        doc.params.insert(params::POINTS_2D.into(), ParamValue::Int(points));
        let path = dir.join("t.tnt");
        doc.save(&path).unwrap();
        sim.open_file(&path).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_done_and_reports_milestones() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = SimulatedSpectrometer::new(Duration::from_secs(1));
        open_sim(dir.path(), 9, 2, &mut sim);
        let log = TextLog::create(&dir.path().join("run_log.txt"), None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let record = run_acquisition(AcquisitionParams {
            spectrometer: &mut sim,
            scans_1d: 9,
            total_scans: 18,
            run_log: &log,
            event_tx: Some(&tx),
            cancel: Arc::new(AtomicBool::new(false)),
        })
        .await
        .unwrap();

        assert_eq!(record.expected, Duration::from_secs(18));
        assert_eq!(record.stall_warnings, 0);
        assert!(record.elapsed >= Duration::from_secs(18));
        assert!(record.elapsed < Duration::from_secs(22));

        let mut progress = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let SessionEvent::Progress { percent } = ev {
                progress.push(percent);
            }
        }
        assert_eq!(progress.last(), Some(&100.0));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains(" RUNNING"));
        assert!(text.contains("expected_time_str = 00:00:18"));
        assert!(text.contains("percent_done = 100.0 %"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acquisition_is_flagged_not_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = SimulatedSpectrometer::new(Duration::from_secs(1)).with_slowdown(4.0);
        open_sim(dir.path(), 10, 1, &mut sim);
        let log = TextLog::create(&dir.path().join("run_log.txt"), None).unwrap();

        let record = run_acquisition(AcquisitionParams {
            spectrometer: &mut sim,
            scans_1d: 10,
            total_scans: 10,
            run_log: &log,
            event_tx: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
        .await
        .unwrap();

        assert!(record.stall_warnings > 0);
        assert!(record.elapsed >= Duration::from_secs(40));
        assert!(std::fs::read_to_string(log.path())
            .unwrap()
            .contains("Collect failed?"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_the_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = SimulatedSpectrometer::new(Duration::from_secs(1));
        open_sim(dir.path(), 100, 1, &mut sim);
        let log = TextLog::create(&dir.path().join("run_log.txt"), None).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));

        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::Relaxed);
        });

        let err = run_acquisition(AcquisitionParams {
            spectrometer: &mut sim,
            scans_1d: 100,
            total_scans: 100,
            run_log: &log,
            event_tx: None,
            cancel,
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("cancelled"));
        // Abort leaves no acquisition running.
        assert!(sim.check_acquisition().unwrap());
    }
}
