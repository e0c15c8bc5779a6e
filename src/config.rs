// Session configuration
//
// Chosen while the profiler is idle and fixed for the life of a session.

use crate::call_stack::INITIAL_STACK_SIZE;
use crate::error::{ProfileError, Result};
use crate::measure::{self, Clock, MeasureMode};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Configuration consumed at session setup
///
/// # Example
/// ```
/// use callgraph_prof::config::ProfilerConfig;
/// use callgraph_prof::measure::MeasureMode;
///
/// let config = ProfilerConfig::default();
/// assert_eq!(config.measure_mode, MeasureMode::Process);
/// assert!(!config.benchmarking);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Clock the session samples
    pub measure_mode: MeasureMode,

    /// Cycle counter frequency in Hz for [`MeasureMode::Cpu`]
    ///
    /// When absent the frequency is read from `/proc/cpuinfo`.
    pub cpu_frequency: Option<f64>,

    /// Only accumulate elapsed session time, build no call graph
    pub benchmarking: bool,

    /// Frames reserved per thread stack before it grows
    pub initial_stack_capacity: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            measure_mode: MeasureMode::Process,
            cpu_frequency: None,
            benchmarking: false,
            initial_stack_capacity: INITIAL_STACK_SIZE,
        }
    }
}

impl ProfilerConfig {
    pub fn wall() -> Self {
        Self {
            measure_mode: MeasureMode::Wall,
            ..Self::default()
        }
    }

    pub fn benchmarking(measure_mode: MeasureMode) -> Self {
        Self {
            measure_mode,
            benchmarking: true,
            ..Self::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    /// `InvalidArgument` for a non-positive or non-finite frequency and for a
    /// zero stack capacity.
    pub fn validate(&self) -> Result<()> {
        if let Some(frequency) = self.cpu_frequency {
            if !frequency.is_finite() || frequency <= 0.0 {
                return Err(ProfileError::InvalidArgument(format!(
                    "cpu_frequency must be a positive number of Hz, got {}",
                    frequency
                )));
            }
        }

        if self.initial_stack_capacity == 0 {
            return Err(ProfileError::InvalidArgument(
                "initial_stack_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate and build the clock for this configuration
    pub fn build_clock(&self) -> Result<Arc<dyn Clock>> {
        self.validate()?;
        measure::build_clock(self.measure_mode, self.cpu_frequency)
    }

    /// Load configuration from a TOML file
    ///
    /// ```toml
    /// measure_mode = "wall"
    /// benchmarking = false
    /// initial_stack_capacity = 64
    /// ```
    pub fn from_toml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read profiler config: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ProfilerConfig =
            toml::from_str(content).context("Failed to parse TOML profiler config")?;
        config.validate()?;
        Ok(config)
    }
}
