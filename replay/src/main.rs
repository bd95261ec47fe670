//! vdec replay
//!
//! Runs a scripted firmware scenario against the simulated decoder, using
//! the real two-stage interrupt path, and prints every completed capture
//! buffer.

mod runner;
mod scenario;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runner::Runner;
use scenario::Scenario;

/// Replay a decoder scenario against the in-memory hardware model
#[derive(Parser, Debug)]
#[command(name = "vdec-replay")]
#[command(version)]
struct Args {
    /// Scenario file (JSON)
    scenario: PathBuf,

    /// Extended firmware blob to load instead of a blank one
    #[arg(long)]
    firmware: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Per-interrupt timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let scenario = Scenario::load(&args.scenario)?;
    let firmware = args
        .firmware
        .as_ref()
        .map(|path| {
            std::fs::read(path).with_context(|| format!("reading firmware {}", path.display()))
        })
        .transpose()?;

    info!(
        scenario = %args.scenario.display(),
        steps = scenario.steps.len(),
        buffers = scenario.buffers,
        "Replaying scenario"
    );

    let runner = Runner::start(&scenario, firmware, Duration::from_millis(args.timeout_ms))?;
    let report = runner.run(&scenario.steps)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for buf in &report.completed {
        println!(
            "buf {:>2}  {:<5}  ts={:<10} seq={:<4} field={:<12} last={} bytesused={:?}",
            buf.index, buf.state, buf.timestamp, buf.sequence, buf.field, buf.last, buf.bytesused
        );
    }
    println!();
    println!(
        "done={} errored={} pending={} ledger={} eos={} aborted={}",
        report.frames_done,
        report.frames_errored,
        report.pending_bufs,
        report.ledger_depth,
        report.eos_events,
        report.aborted
    );

    Ok(())
}
