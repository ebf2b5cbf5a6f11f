mod cli;
mod engine;
mod metrics;
mod model;
mod orchestrator;
mod plan;
mod prompt;
mod runlog;
mod spectrometer;
mod telemetry;
mod text_summary;
mod workspace;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    telemetry::init_tracing(args.verbose);
    cli::run(args).await
}
