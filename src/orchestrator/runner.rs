//! Walks an expanded sweep plan against a session.

use crate::engine::Session;
use crate::plan::{Plan, Step};
use crate::spectrometer::Spectrometer;
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Run every step of `plan` in order, stopping at the first failure.
///
/// Cancellation is honoured between steps; a cancel that lands mid-acquisition
/// or mid-sleep is handled by the session itself.
pub(crate) async fn run_plan<S: Spectrometer>(
    session: &mut Session<S>,
    plan: &Plan,
    cancel: &AtomicBool,
) -> Result<()> {
    let steps = plan.expand();
    tracing::info!(steps = steps.len(), "running plan");
    for (i, step) in steps.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            tracing::warn!(step = i + 1, "run cancelled by operator");
            bail!("run cancelled before step {}", i + 1);
        }
        tracing::debug!(step = i + 1, "{}", step.describe());
        run_step(session, step)
            .await
            .with_context(|| format!("step {}: {}", i + 1, step.describe()))?;
    }
    let record = session.record();
    tracing::info!(
        acquisitions = record.acquisitions.len(),
        saved = record.saved_files.len(),
        "plan finished"
    );
    Ok(())
}

async fn run_step<S: Spectrometer>(session: &mut Session<S>, step: &Step) -> Result<()> {
    match step {
        Step::Open { file } => session.open(file)?,
        Step::Close { file } => session.close(file)?,
        Step::SaveAs { file } => {
            session.save_as(file)?;
        }
        Step::SetParam { name, value } => session.set_param(name, value)?,
        Step::GetParam { name } => {
            session.get_param(name)?;
        }
        Step::SetTable { name, values } => session.set_table(name, values)?,
        Step::GetTable { name } => {
            session.get_table(name)?;
        }
        Step::Zg { manual_check } => {
            session.zg(*manual_check).await?;
        }
        Step::Sleep { duration } => session.sleep(*duration).await?,
        Step::Log { message } => session.log(message)?,
        Step::LogValues { values } => session.log_values(values)?,
        Step::Reset => session.reset()?,
        // `Plan::expand` flattens sweeps away.
        Step::Sweep { .. } => bail!("unexpanded sweep step"),
    }
    Ok(())
}
