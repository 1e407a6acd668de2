//! sessionlink-replay: drive the lifecycle manager from a script.
//!
//! Reads a JSON-lines script of user commands, push events and backend
//! behavior changes, runs it against a simulated backend with exact timer
//! semantics, and prints every resulting action as one JSON object per line.

mod script;
mod sim;

use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use sessionlink_core::load_config;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::sim::{Replayer, SimulatedBackend};

#[derive(Parser)]
#[command(name = "sessionlink-replay")]
#[command(about = "Replay push events and commands through the connection lifecycle manager")]
#[command(version)]
struct Cli {
    /// JSON-lines script to replay
    #[arg(value_name = "SCRIPT")]
    script: PathBuf,

    /// Configuration file (defaults to ~/.sessionlink/link.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Keep firing timers for this many seconds after the last step
    #[arg(long, default_value_t = 0)]
    run_for_secs: u64,

    /// Wall-clock time the replay starts at (RFC 3339)
    #[arg(long, default_value = "2026-01-01T00:00:00Z")]
    start: String,

    /// Print the final manager snapshot after the actions
    #[arg(long)]
    snapshot: bool,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "Replay failed");
        eprintln!("sessionlink-replay: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config).map_err(|err| err.to_string())?;
    let start = DateTime::parse_from_rfc3339(&cli.start)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| format!("Invalid --start: {}", err))?;
    let steps = script::read_script(&cli.script).map_err(|err| err.to_string())?;
    tracing::info!(steps = steps.len(), script = %cli.script.display(), "Replaying script");

    let mut replayer = Replayer::new(config, SimulatedBackend::default(), start);
    replayer.run(&steps);

    let last_step = steps.last().map(|line| line.at_ms).unwrap_or(0);
    let tail = i64::try_from(cli.run_for_secs).unwrap_or(i64::MAX / 1_000_000);
    let end = start
        + Duration::milliseconds(i64::try_from(last_step).unwrap_or(0))
        + Duration::seconds(tail);
    replayer.advance_to(end);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in replayer.emitted() {
        let encoded = serde_json::to_string(line).map_err(|err| err.to_string())?;
        writeln!(out, "{}", encoded).map_err(|err| err.to_string())?;
    }
    if cli.snapshot {
        let encoded =
            serde_json::to_string_pretty(&replayer.snapshot()).map_err(|err| err.to_string())?;
        writeln!(out, "{}", encoded).map_err(|err| err.to_string())?;
    }
    Ok(())
}

fn init_logging() {
    let debug_enabled = env::var("SESSIONLINK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
