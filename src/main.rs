use anyhow::{Context, Result};
use callgraph_prof::{cli::Cli, config::ProfilerConfig, measure::MeasureMode, replay};
use clap::Parser;
use std::fs::{self, File};
use std::io::{self, BufReader};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    if !args.ticks_per_unit.is_finite() || args.ticks_per_unit <= 0.0 {
        anyhow::bail!(
            "Invalid value for --ticks-per-unit: {} (must be > 0)",
            args.ticks_per_unit
        );
    }

    init_tracing(args.debug);

    let config = match &args.config {
        Some(path) => Some(ProfilerConfig::from_toml(path)?),
        None => None,
    };

    // --clock wins over the config file; replayed logs default to wall time
    let mode = args
        .clock
        .map(MeasureMode::from)
        .or(config.map(|c| c.measure_mode))
        .unwrap_or(MeasureMode::Wall);

    let events = if args.reads_stdin() {
        replay::read_events(io::stdin().lock())?
    } else {
        let file = File::open(&args.events)
            .with_context(|| format!("Failed to open event log: {}", args.events.display()))?;
        replay::read_events(BufReader::new(file))?
    };
    tracing::debug!(events = events.len(), %mode, "replaying event log");

    let result = replay::replay_events(&events, mode, args.ticks_per_unit)?;

    let json = if args.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };

    match &args.output {
        Some(path) => fs::write(path, format!("{}\n", json))
            .with_context(|| format!("Failed to write result: {}", path.display()))?,
        None => println!("{}", json),
    }

    Ok(())
}
