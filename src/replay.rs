// Event log replay
//
// A recorded event log is a JSON-lines file, one event per line, each
// carrying the clock reading at which the instrumentation source observed
// it. Replaying drives a profiler session with a manual clock set to each
// event's timestamp, so the resulting call graph is fully deterministic.
//
//   {"event":"enter","thread":1,"at":0,"qualifier":{"kind":"class","name":"Foo"},"name":"bar"}
//   {"event":"exit","thread":1,"at":1500}

use crate::config::ProfilerConfig;
use crate::error::{ProfileError, Result};
use crate::measure::{ManualClock, MeasureMode};
use crate::registry::{Qualifier, SourceLocation};
use crate::result::ProfileResult;
use crate::session::{Profiler, Snapshot, ThreadKey};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::Arc;

/// One recorded instrumentation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Enter {
        thread: ThreadKey,
        at: u64,
        qualifier: Qualifier,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
    },
    Exit {
        thread: ThreadKey,
        at: u64,
    },
    Switch {
        thread: ThreadKey,
        at: u64,
    },
    Redefine {
        qualifier: Qualifier,
        name: String,
    },
}

impl Event {
    /// Clock reading carried by the event, if any
    pub fn at(&self) -> Option<u64> {
        match self {
            Event::Enter { at, .. } | Event::Exit { at, .. } | Event::Switch { at, .. } => {
                Some(*at)
            }
            Event::Redefine { .. } => None,
        }
    }
}

/// Parse a JSON-lines event log, skipping blank lines
pub fn read_events<R: BufRead>(reader: R) -> anyhow::Result<Vec<Event>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read event log line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .with_context(|| format!("Invalid event on line {}", index + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// Replay `events` through a fresh session
///
/// Timestamps are clock ticks; `ticks_per_unit` converts them to the
/// reported unit (1_000_000_000 for nanosecond ticks reported in seconds).
/// Timestamps that go backwards are clamped to the latest one seen. A stack
/// integrity violation taints its thread in the result instead of aborting
/// the replay.
///
/// # Errors
/// `InvalidArgument` for a non-positive `ticks_per_unit`.
pub fn replay_events(
    events: &[Event],
    mode: MeasureMode,
    ticks_per_unit: f64,
) -> Result<ProfileResult> {
    if !ticks_per_unit.is_finite() || ticks_per_unit <= 0.0 {
        return Err(ProfileError::InvalidArgument(format!(
            "ticks per unit must be positive, got {}",
            ticks_per_unit
        )));
    }

    let clock = Arc::new(ManualClock::new(mode, ticks_per_unit));
    let profiler = Profiler::with_clock(ProfilerConfig::default(), clock.clone());
    profiler.start()?;

    for event in events {
        if let Some(at) = event.at() {
            clock.set(at);
        }
        match event {
            Event::Enter {
                thread,
                qualifier,
                name,
                file,
                line,
                ..
            } => {
                let location = file
                    .as_ref()
                    .map(|file| SourceLocation::new(file.clone(), line.unwrap_or(0)));
                profiler.on_call_enter(*thread, qualifier, name, location)?;
            }
            Event::Exit { thread, .. } => match profiler.on_call_exit(*thread) {
                Ok(()) | Err(ProfileError::StackIntegrityViolation { .. }) => {}
                Err(err) => return Err(err),
            },
            Event::Switch { thread, .. } => profiler.on_thread_switch(*thread)?,
            Event::Redefine { qualifier, name } => {
                profiler.on_method_redefined(qualifier, name);
            }
        }
    }

    match profiler.stop()? {
        Snapshot::Graph(result) => Ok(result),
        Snapshot::Elapsed(_) => Err(ProfileError::InvalidArgument(
            "replay produced no call graph".to_string(),
        )),
    }
}
