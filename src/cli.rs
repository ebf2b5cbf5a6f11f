use crate::engine::Session;
use crate::model::{ParamValue, SessionConfig, SessionEvent};
use crate::orchestrator;
use crate::plan::Plan;
use crate::prompt::{AutoAccept, Prompter, StdinPrompter};
use crate::spectrometer::{SimDocument, SimulatedSpectrometer, Spectrometer};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// Written to stderr without a newline, then flushed.
    Prompt(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
                OutputLine::Prompt(question) => {
                    let _ = out.flush();
                    let _ = write!(err, "{} ", question);
                    let _ = err.flush();
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "tnmr-sweep",
    version,
    about = "Scripted parameter sweeps for the TNMR spectrometer application"
)]
pub struct Cli {
    /// Debug-level diagnostics (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Run a sweep plan against the spectrometer
    Run(RunArgs),
    /// Validate a sweep plan without touching the spectrometer
    Check {
        plan: PathBuf,
    },
    /// Write an experiment file for the simulated backend
    Template {
        path: PathBuf,
        /// Parameter to set, as NAME=VALUE (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, ParamValue)>,
    },
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Sweep plan (JSON)
    pub plan: PathBuf,

    /// Root that templates and the experiment directory are resolved against
    /// (defaults to the plan's directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Experiment directory name, overriding the plan
    #[arg(long = "dir")]
    pub directory: Option<String>,

    /// Use --unique true or --unique false to override the plan
    #[arg(long, action = clap::ArgAction::Set)]
    pub unique: Option<bool>,

    /// Walk the plan without acquiring or sleeping
    #[arg(long)]
    pub dry_run: bool,

    /// Answer every prompt with the default
    #[arg(long, short)]
    pub yes: bool,

    #[arg(long, value_enum, default_value_t = Backend::Simulated)]
    pub backend: Backend,

    /// Simulated time per scan
    #[arg(long, default_value = "1s")]
    pub scan_time: humantime::Duration,

    /// Simulated acquisitions run this many times slower than predicted
    #[arg(long, default_value_t = 1.0)]
    pub slowdown: f64,

    /// Print the run record as JSON instead of the log and text summary
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Simulated,
    Tnmr,
}

fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty parameter name in {raw:?}"));
    }
    Ok((name.to_string(), ParamValue::parse_lenient(value)))
}

pub async fn run(args: Cli) -> Result<()> {
    match args.command {
        Commands::Run(run) => run_sweep(run).await,
        Commands::Check { plan } => check_plan(&plan),
        Commands::Template { path, params } => write_template(&path, params),
    }
}

/// Build a `SessionConfig` from CLI arguments and the loaded plan.
pub fn build_config(args: &RunArgs, plan: &Plan) -> SessionConfig {
    let root = args.root.clone().unwrap_or_else(|| match args.plan.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    });
    SessionConfig {
        root,
        directory: args
            .directory
            .clone()
            .unwrap_or_else(|| plan.directory.clone()),
        unique: args.unique.unwrap_or(plan.unique),
        running: !args.dry_run,
        assume_yes: args.yes,
        plan_path: Some(args.plan.clone()),
    }
}

fn connect_backend(args: &RunArgs) -> Result<Box<dyn Spectrometer>> {
    match args.backend {
        Backend::Simulated => Ok(Box::new(
            SimulatedSpectrometer::new(Duration::from(args.scan_time))
                .with_slowdown(args.slowdown),
        )),
        Backend::Tnmr => connect_tnmr(),
    }
}

#[cfg(all(windows, feature = "tnmr-com"))]
fn connect_tnmr() -> Result<Box<dyn Spectrometer>> {
    let app = crate::spectrometer::TnmrAutomation::connect()
        .context("failed to connect to the TNMR application")?;
    Ok(Box::new(app))
}

#[cfg(not(all(windows, feature = "tnmr-com")))]
fn connect_tnmr() -> Result<Box<dyn Spectrometer>> {
    anyhow::bail!("the tnmr backend needs a Windows build with the `tnmr-com` feature")
}

/// Forward session events to the output writer.
fn spawn_event_printer(
    mut evt_rx: mpsc::UnboundedReceiver<SessionEvent>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    json: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ev) = evt_rx.recv().await {
            match ev {
                SessionEvent::Log { line } => {
                    if !json {
                        let _ = out_tx.send(OutputLine::Stderr(line));
                    }
                }
                SessionEvent::Prompt { question } => {
                    let _ = out_tx.send(OutputLine::Prompt(question));
                }
                SessionEvent::Info(info) => {
                    let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
                }
                SessionEvent::AcquisitionStarted {
                    expected,
                    total_scans,
                    ..
                } => {
                    tracing::debug!(
                        expected = %humantime::format_duration(expected),
                        total_scans,
                        "acquisition started"
                    );
                }
                SessionEvent::Progress { percent } => {
                    tracing::debug!(percent, "acquisition progress");
                }
                SessionEvent::StallSuspected {
                    elapsed, expected, ..
                } => {
                    if json {
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "Acquisition may have stalled: {} elapsed of {} expected",
                            humantime::format_duration(elapsed),
                            humantime::format_duration(expected)
                        )));
                    }
                }
                SessionEvent::AcquisitionFinished { record } => {
                    tracing::debug!(
                        elapsed = %humantime::format_duration(record.elapsed),
                        skipped = record.skipped,
                        repeats = record.repeats,
                        "acquisition finished"
                    );
                }
            }
        }
    })
}

async fn run_sweep(args: RunArgs) -> Result<()> {
    let plan = Plan::load(&args.plan)?;
    let cfg = build_config(&args, &plan);
    let spectrometer = connect_backend(&args)?;
    tracing::info!(backend = spectrometer.name(), root = %cfg.root.display(), "starting run");

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let printer = spawn_event_printer(evt_rx, out_tx.clone(), args.json);
    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl = orchestrator::spawn_cancel_handler(cancel.clone(), evt_tx.clone());

    let prompter: Box<dyn Prompter> = if args.yes {
        Box::new(AutoAccept)
    } else {
        Box::new(StdinPrompter::new(Some(evt_tx.clone())))
    };

    let outcome = match Session::start(
        cfg,
        spectrometer,
        prompter,
        Some(evt_tx.clone()),
        cancel.clone(),
    ) {
        Ok(mut session) => {
            let run = orchestrator::run_plan(&mut session, &plan, &cancel).await;
            let processed = orchestrator::process_run_completion(session, run.as_ref().err());
            keep_run_error(processed, run)
        }
        Err(e) => Err(e),
    };

    // Every event sender has to go before the printer drains.
    ctrl.abort();
    drop(evt_tx);
    let _ = printer.await;

    let (processed, run) = match outcome {
        Ok(v) => v,
        Err(e) => {
            drop(out_tx);
            let _ = out_handle.await;
            return Err(e);
        }
    };

    if args.json {
        let out = serde_json::to_string_pretty(&processed.record)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in processed.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    let _ = out_tx.send(OutputLine::Stderr(format!(
        "Saved: {}",
        processed.summary_path.display()
    )));

    drop(out_tx);
    let _ = out_handle.await;

    run
}

/// Pair post-processing with the run result. When post-processing fails the
/// run's own error is kept as context.
fn keep_run_error<T>(processed: Result<T>, run: Result<()>) -> Result<(T, Result<()>)> {
    match (processed, run) {
        (Ok(processed), run) => Ok((processed, run)),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(run_err)) => Err(e.context(format!("run failed: {run_err:#}"))),
    }
}

fn check_plan(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    println!(
        "{}: {} steps, {} acquisitions",
        path.display(),
        plan.executed_steps(),
        plan.acquisitions()
    );
    for (i, step) in plan.expand().iter().enumerate() {
        tracing::debug!("{:>4}  {}", i + 1, step.describe());
    }
    Ok(())
}

fn write_template(path: &Path, params: Vec<(String, ParamValue)>) -> Result<()> {
    let mut doc = SimDocument::with_defaults();
    doc.params.extend(params);
    let path = with_tnt_extension(path);
    doc.save(&path)
        .with_context(|| format!("failed to write template {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn with_tnt_extension(path: &Path) -> PathBuf {
    let has_ext = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("tnt"));
    if has_ext {
        path.to_path_buf()
    } else {
        let mut raw = path.as_os_str().to_owned();
        raw.push(".tnt");
        PathBuf::from(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["tnmr-sweep", "run", "lab/delay.json"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn plan() -> Plan {
        serde_json::from_str(r#"{"directory": "delay", "steps": [{"op": "zg"}]}"#).unwrap()
    }

    #[test]
    fn config_defaults_come_from_plan() {
        let cfg = build_config(&run_args(&[]), &plan());
        assert_eq!(cfg.root, PathBuf::from("lab"));
        assert_eq!(cfg.directory, "delay");
        assert!(cfg.unique);
        assert!(cfg.running);
        assert!(!cfg.assume_yes);
        assert_eq!(cfg.plan_path, Some(PathBuf::from("lab/delay.json")));
    }

    #[test]
    fn cli_overrides_plan() {
        let args = run_args(&[
            "--root", "/data", "--dir", "T1", "--unique", "false", "--dry-run", "--yes",
        ]);
        let cfg = build_config(&args, &plan());
        assert_eq!(cfg.root, PathBuf::from("/data"));
        assert_eq!(cfg.directory, "T1");
        assert!(!cfg.unique);
        assert!(!cfg.running);
        assert!(cfg.assume_yes);
    }

    #[test]
    fn scan_time_accepts_humantime() {
        let args = run_args(&["--scan-time", "250ms", "--slowdown", "3"]);
        assert_eq!(Duration::from(args.scan_time), Duration::from_millis(250));
        assert_eq!(args.slowdown, 3.0);
    }

    #[test]
    fn template_params_parse_as_name_value() {
        let cli = Cli::try_parse_from([
            "tnmr-sweep",
            "template",
            "RO",
            "--param",
            "Scans 1D=16",
            "--param",
            "Observe Freq.=2.25164",
        ])
        .unwrap();
        let Commands::Template { path, params } = cli.command else {
            panic!("expected template command");
        };
        assert_eq!(path, PathBuf::from("RO"));
        assert_eq!(
            params,
            vec![
                ("Scans 1D".to_string(), ParamValue::Int(16)),
                ("Observe Freq.".to_string(), ParamValue::Float(2.25164)),
            ]
        );
        assert!(parse_param("novalue").is_err());
    }

    #[test]
    fn failed_summary_keeps_run_error() {
        let err = keep_run_error::<()>(
            Err(anyhow::anyhow!("write run_summary.json")),
            Err(anyhow::anyhow!("acquisition cancelled")),
        )
        .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("acquisition cancelled"), "{msg}");
        assert!(msg.contains("write run_summary.json"), "{msg}");

        let (v, run) = keep_run_error(Ok(7), Err(anyhow::anyhow!("boom"))).unwrap();
        assert_eq!(v, 7);
        assert!(run.is_err());
    }

    #[test]
    fn tnt_extension_added_once() {
        assert_eq!(with_tnt_extension(Path::new("a/RO")), PathBuf::from("a/RO.tnt"));
        assert_eq!(with_tnt_extension(Path::new("a/RO.TNT")), PathBuf::from("a/RO.TNT"));
    }

    #[test]
    fn template_writes_loadable_document() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("RO");
        write_template(&base, vec![("Scans 1D".into(), ParamValue::Int(4))]).unwrap();
        let doc = SimDocument::load(&dir.path().join("RO.tnt")).unwrap();
        assert_eq!(doc.params.get("Scans 1D"), Some(&ParamValue::Int(4)));
    }

    #[cfg(not(all(windows, feature = "tnmr-com")))]
    #[test]
    fn tnmr_backend_unavailable_off_windows() {
        let args = run_args(&["--backend", "tnmr"]);
        assert!(connect_backend(&args).is_err());
    }
}
