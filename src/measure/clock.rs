// Clock sources: the single sampling primitive the engine timestamps with.
//
// Every clock samples raw ticks (u64) on the hot path and converts tick
// sums to the mode's unit only when a result is frozen.

use super::{alloc_counter, MeasureMode};
use crate::error::{ProfileError, Result};
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeValLike;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A measurement source
///
/// `sample()` must be monotonic non-decreasing and cheap: it runs twice per
/// profiled call.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Mode this clock measures
    fn mode(&self) -> MeasureMode;

    /// Current raw tick count
    fn sample(&self) -> u64;

    /// Convert a tick count (or a difference of tick counts) to the mode's unit
    fn convert(&self, ticks: u64) -> f64;
}

fn process_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Wall-clock time, nanosecond ticks from a process-wide monotonic origin
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl WallClock {
    pub fn new() -> Self {
        // Pin the origin so samples from separate clocks are comparable
        process_origin();
        Self
    }
}

impl Clock for WallClock {
    fn mode(&self) -> MeasureMode {
        MeasureMode::Wall
    }

    fn sample(&self) -> u64 {
        process_origin().elapsed().as_nanos() as u64
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64 / 1_000_000_000.0
    }
}

/// User + system CPU time of this process, microsecond ticks
#[derive(Debug, Default)]
pub struct ProcessClock {
    last: AtomicU64,
}

impl ProcessClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for ProcessClock {
    fn mode(&self) -> MeasureMode {
        MeasureMode::Process
    }

    fn sample(&self) -> u64 {
        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => {
                let micros = usage.user_time().num_microseconds()
                    + usage.system_time().num_microseconds();
                let micros = micros.max(0) as u64;
                // fetch_max keeps the sequence monotonic across threads
                let prev = self.last.fetch_max(micros, Ordering::Relaxed);
                prev.max(micros)
            }
            Err(_) => self.last.load(Ordering::Relaxed),
        }
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64 / 1_000_000.0
    }
}

/// Read the CPU cycle counter, if this architecture exposes one
#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
pub fn read_cycle_counter() -> Option<u64> {
    // SAFETY: rdtsc has no preconditions on x86_64
    Some(unsafe { core::arch::x86_64::_rdtsc() })
}

#[cfg(target_arch = "x86")]
#[allow(unused_unsafe)]
pub fn read_cycle_counter() -> Option<u64> {
    // SAFETY: rdtsc has no preconditions on the x86 targets Rust supports
    Some(unsafe { core::arch::x86::_rdtsc() })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
pub fn read_cycle_counter() -> Option<u64> {
    None
}

/// CPU cycle counter converted with a calibration frequency (Hz)
#[derive(Debug, Clone, Copy)]
pub struct CpuClock {
    frequency: f64,
}

impl CpuClock {
    /// Create a cycle clock
    ///
    /// # Errors
    /// `UnsupportedMeasurement` when the platform has no readable cycle
    /// counter, `InvalidArgument` when `frequency` is not a positive number.
    pub fn new(frequency: f64) -> Result<Self> {
        if read_cycle_counter().is_none() {
            return Err(ProfileError::UnsupportedMeasurement(
                "no readable CPU cycle counter on this architecture".to_string(),
            ));
        }
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(ProfileError::InvalidArgument(format!(
                "cpu frequency must be a positive number of Hz, got {}",
                frequency
            )));
        }
        Ok(Self { frequency })
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }
}

impl Clock for CpuClock {
    fn mode(&self) -> MeasureMode {
        MeasureMode::Cpu
    }

    fn sample(&self) -> u64 {
        read_cycle_counter().unwrap_or(0)
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64 / self.frequency
    }
}

/// Allocation count observed through [`alloc_counter::CountingAllocator`]
#[derive(Debug, Clone, Copy)]
pub struct AllocationClock {
    _private: (),
}

impl AllocationClock {
    /// # Errors
    /// `UnsupportedMeasurement` if the counting allocator is not installed as
    /// the global allocator.
    pub fn new() -> Result<Self> {
        if !alloc_counter::is_installed() {
            return Err(ProfileError::UnsupportedMeasurement(
                "allocation counting requires CountingAllocator as the #[global_allocator]"
                    .to_string(),
            ));
        }
        Ok(Self { _private: () })
    }
}

impl Clock for AllocationClock {
    fn mode(&self) -> MeasureMode {
        MeasureMode::Allocations
    }

    fn sample(&self) -> u64 {
        alloc_counter::allocations()
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64
    }
}

/// Externally advanced clock
///
/// Used to replay recorded event logs and to drive the engine
/// deterministically. `ticks_per_unit` converts ticks to the reported unit
/// (e.g. 1_000_000 for microsecond ticks reported in seconds).
#[derive(Debug)]
pub struct ManualClock {
    mode: MeasureMode,
    ticks: AtomicU64,
    ticks_per_unit: f64,
}

impl ManualClock {
    pub fn new(mode: MeasureMode, ticks_per_unit: f64) -> Self {
        Self {
            mode,
            ticks: AtomicU64::new(0),
            ticks_per_unit,
        }
    }

    /// Wall-mode clock with millisecond ticks, reported in seconds
    pub fn millis() -> Self {
        Self::new(MeasureMode::Wall, 1_000.0)
    }

    /// Move the clock to an absolute tick value; earlier values are ignored
    pub fn set(&self, ticks: u64) {
        self.ticks.fetch_max(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn mode(&self) -> MeasureMode {
        self.mode
    }

    fn sample(&self) -> u64 {
        self.now()
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64 / self.ticks_per_unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wall_clock_advances() {
        let clock = WallClock::new();
        let t1 = clock.sample();
        thread::sleep(Duration::from_millis(5));
        let t2 = clock.sample();
        assert!(t2 > t1);
        assert!(clock.convert(t2 - t1) >= 0.005);
    }

    #[test]
    fn test_process_clock_monotonic() {
        let clock = ProcessClock::new();
        let t1 = clock.sample();
        let mut x = 0u64;
        for i in 0..200_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        let t2 = clock.sample();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_manual_clock_set_never_goes_back() {
        let clock = ManualClock::millis();
        clock.set(500);
        clock.set(100);
        assert_eq!(clock.sample(), 500);
        clock.advance(250);
        assert_eq!(clock.sample(), 750);
        assert!((clock.convert(750) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_clock_rejects_bad_frequency() {
        let err = CpuClock::new(0.0).unwrap_err();
        assert!(matches!(
            err,
            ProfileError::InvalidArgument(_) | ProfileError::UnsupportedMeasurement(_)
        ));
        assert!(CpuClock::new(f64::NAN).is_err());
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    #[test]
    fn test_cpu_clock_converts_with_frequency() {
        let clock = CpuClock::new(2.0e9).unwrap();
        assert!((clock.convert(4_000_000_000) - 2.0).abs() < 1e-9);
        let t1 = clock.sample();
        let t2 = clock.sample();
        assert!(t2 >= t1);
    }
}
