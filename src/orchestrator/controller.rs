//! Run lifecycle control.
//!
//! Turns operator interrupts into a cancel flag that the session checks
//! between steps and while waiting on acquisitions.

use crate::model::{InfoEvent, SessionEvent};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc::{self, UnboundedSender};

/// Commands that control a running sweep.
#[derive(Debug, Clone)]
pub(crate) enum SessionControl {
    Cancel,
}

/// Listen for control commands and raise `cancel` when asked.
fn spawn_control_listener(
    cancel: Arc<AtomicBool>,
    event_tx: UnboundedSender<SessionEvent>,
) -> (UnboundedSender<SessionControl>, tokio::task::JoinHandle<()>) {
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<SessionControl>();
    let handle = tokio::spawn(async move {
        while let Some(msg) = ctrl_rx.recv().await {
            match msg {
                SessionControl::Cancel => {
                    if !cancel.swap(true, Ordering::Relaxed) {
                        let _ = event_tx.send(SessionEvent::Info(InfoEvent::Cancelling));
                    }
                }
            }
        }
    });
    (ctrl_tx, handle)
}

/// Install the Ctrl-C handler. The first interrupt cancels the sweep at the
/// next safe point (aborting a running acquisition); a second one exits.
///
/// Abort the returned handle once the run is over; dropping it leaves the
/// task running.
pub(crate) fn spawn_cancel_handler(
    cancel: Arc<AtomicBool>,
    event_tx: UnboundedSender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    let (ctrl_tx, listener) = spawn_control_listener(cancel, event_tx);
    tokio::spawn(async move {
        let mut interrupts = 0u32;
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupts += 1;
            if interrupts > 1 {
                tracing::warn!("second interrupt, exiting without cleanup");
                std::process::exit(130);
            }
            let _ = ctrl_tx.send(SessionControl::Cancel);
        }
        listener.abort();
    })
}
