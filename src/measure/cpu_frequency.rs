// CPU frequency discovery for the cycle-counter clock.
//
// Resolution order: configured value, then /proc/cpuinfo. Calibration by
// sleeping is available but never implicit, it blocks for the whole window.

use super::clock::read_cycle_counter;
use crate::error::{ProfileError, Result};
use std::fs;
use std::thread;
use std::time::Duration;

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Parse the first `cpu MHz` entry of a cpuinfo listing, in Hz
pub fn parse_cpuinfo(text: &str) -> Option<f64> {
    text.lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .find_map(|line| {
            let (_, value) = line.split_once(':')?;
            let mhz: f64 = value.trim().parse().ok()?;
            (mhz.is_finite() && mhz > 0.0).then_some(mhz * 1_000_000.0)
        })
}

/// Read the CPU frequency from `/proc/cpuinfo`
pub fn from_cpuinfo() -> Option<f64> {
    let text = fs::read_to_string(CPUINFO_PATH).ok()?;
    parse_cpuinfo(&text)
}

/// Measure the cycle counter rate across a sleep of `window`
pub fn calibrate(window: Duration) -> Result<f64> {
    if window.is_zero() {
        return Err(ProfileError::InvalidArgument(
            "calibration window must be non-zero".to_string(),
        ));
    }
    let before = read_cycle_counter().ok_or_else(|| {
        ProfileError::UnsupportedMeasurement(
            "no readable CPU cycle counter on this architecture".to_string(),
        )
    })?;
    thread::sleep(window);
    let after = read_cycle_counter().unwrap_or(before);

    let frequency = after.saturating_sub(before) as f64 / window.as_secs_f64();
    if frequency <= 0.0 {
        return Err(ProfileError::UnsupportedMeasurement(
            "cycle counter did not advance during calibration".to_string(),
        ));
    }
    Ok(frequency)
}

/// Pick the frequency for the cycle clock
///
/// # Errors
/// `UnsupportedMeasurement` when no frequency is configured and none can be
/// discovered, so cycle counts are never reported in the wrong unit.
pub fn resolve(configured: Option<f64>) -> Result<f64> {
    if let Some(frequency) = configured {
        return Ok(frequency);
    }
    from_cpuinfo().ok_or_else(|| {
        ProfileError::UnsupportedMeasurement(
            "cpu frequency not configured and not found in /proc/cpuinfo".to_string(),
        )
    })
}
