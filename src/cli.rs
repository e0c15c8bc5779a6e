//! CLI argument parsing for the event log replay tool

use crate::measure::MeasureMode;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Clock the replayed timestamps were taken with
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockArg {
    /// Process CPU time
    Process,
    /// Wall-clock time
    Wall,
    /// CPU cycle counter
    Cpu,
    /// Allocation counts
    Allocations,
}

impl From<ClockArg> for MeasureMode {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Process => MeasureMode::Process,
            ClockArg::Wall => MeasureMode::Wall,
            ClockArg::Cpu => MeasureMode::Cpu,
            ClockArg::Allocations => MeasureMode::Allocations,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "callgraph-prof")]
#[command(version)]
#[command(about = "Replay a call event log and write its call graph as JSON", long_about = None)]
pub struct Cli {
    /// JSON-lines event log to replay ("-" reads stdin)
    #[arg(value_name = "EVENTS")]
    pub events: PathBuf,

    /// Clock the timestamps were taken with (overrides --config)
    #[arg(long = "clock", value_enum)]
    pub clock: Option<ClockArg>,

    /// Timestamp ticks per reported unit (default: nanoseconds to seconds)
    #[arg(long = "ticks-per-unit", default_value = "1000000000")]
    pub ticks_per_unit: f64,

    /// Profiler configuration file (TOML)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Pretty-print the JSON result
    #[arg(long)]
    pub pretty: bool,

    /// Write the result to a file instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Whether the event log comes from stdin
    pub fn reads_stdin(&self) -> bool {
        self.events.as_os_str() == "-"
    }
}
