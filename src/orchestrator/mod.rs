//! Application-level orchestration utilities.
//!
//! This module walks a sweep plan against a session, turns Ctrl-C into a
//! cancel request, and handles post-run processing (run summary, text
//! summary). The CLI layer calls into this module to keep responsibilities
//! separated.

mod controller;
mod post_process;
mod runner;

pub(crate) use controller::spawn_cancel_handler;
pub(crate) use post_process::process_run_completion;
pub(crate) use runner::run_plan;
