// Clock sources for the profiler
//
// A session samples exactly one clock. The mode is session configuration:
// wall time, process CPU time, CPU cycles (converted with a frequency) or
// allocation counts.

mod alloc_counter;
mod clock;
pub mod cpu_frequency;

pub use alloc_counter::{allocations, CountingAllocator};
pub use clock::{
    read_cycle_counter, AllocationClock, Clock, CpuClock, ManualClock, ProcessClock, WallClock,
};

use crate::error::{ProfileError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// What the profiler measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureMode {
    /// User + system CPU time of the process
    #[default]
    Process,
    /// Elapsed wall-clock time
    Wall,
    /// CPU cycle counter converted with a calibration frequency
    Cpu,
    /// Number of allocations made by the program
    Allocations,
}

impl MeasureMode {
    pub const ALL: [MeasureMode; 4] = [
        MeasureMode::Process,
        MeasureMode::Wall,
        MeasureMode::Cpu,
        MeasureMode::Allocations,
    ];

    /// Numeric mode code (process 0, wall 1, cpu 2, allocations 3)
    pub fn code(self) -> i64 {
        match self {
            MeasureMode::Process => 0,
            MeasureMode::Wall => 1,
            MeasureMode::Cpu => 2,
            MeasureMode::Allocations => 3,
        }
    }

    /// # Errors
    /// `InvalidArgument` for any code outside 0..=3
    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.code() == code)
            .ok_or_else(|| ProfileError::InvalidArgument(format!("invalid measure mode: {}", code)))
    }

    pub fn name(self) -> &'static str {
        match self {
            MeasureMode::Process => "process",
            MeasureMode::Wall => "wall",
            MeasureMode::Cpu => "cpu",
            MeasureMode::Allocations => "allocations",
        }
    }

    /// Unit of converted measurements
    pub fn unit(self) -> &'static str {
        match self {
            MeasureMode::Allocations => "allocations",
            _ => "seconds",
        }
    }

    pub fn is_time(self) -> bool {
        self != MeasureMode::Allocations
    }
}

impl fmt::Display for MeasureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MeasureMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "process_time" => Ok(MeasureMode::Process),
            "wall" | "wall_time" => Ok(MeasureMode::Wall),
            "cpu" | "cpu_time" => Ok(MeasureMode::Cpu),
            "allocations" | "alloc" => Ok(MeasureMode::Allocations),
            other => Err(ProfileError::InvalidArgument(format!(
                "unknown measure mode: {}",
                other
            ))),
        }
    }
}

/// Build the clock for `mode`
///
/// `cpu_frequency` is only consulted for [`MeasureMode::Cpu`].
pub fn build_clock(mode: MeasureMode, cpu_frequency: Option<f64>) -> Result<Arc<dyn Clock>> {
    let clock: Arc<dyn Clock> = match mode {
        MeasureMode::Process => Arc::new(ProcessClock::new()),
        MeasureMode::Wall => Arc::new(WallClock::new()),
        MeasureMode::Cpu => Arc::new(CpuClock::new(cpu_frequency::resolve(cpu_frequency)?)?),
        MeasureMode::Allocations => Arc::new(AllocationClock::new()?),
    };
    Ok(clock)
}

/// Sample `mode` once, converted to its unit
pub fn measure_now(mode: MeasureMode, cpu_frequency: Option<f64>) -> Result<f64> {
    let clock = build_clock(mode, cpu_frequency)?;
    Ok(clock.convert(clock.sample()))
}
