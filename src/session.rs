//! Session controller
//!
//! [`Profiler`] owns the lifecycle (`Idle`, `Running`, `Paused`), the clock,
//! the method registry and one [`ThreadGraph`] per observed thread. Events
//! from the instrumentation source are routed by [`ThreadKey`] to that
//! thread's graph.
//!
//! # Thread attention
//!
//! The profiler tracks which thread currently has the clock's attention.
//! When an event arrives from another thread, the previously attended thread
//! is stamped as switched out; once it sends an event again the interval is
//! booked as wait time on its top frame.
//!
//! # Pause
//!
//! The session clock is frozen while paused: events are still accepted, so
//! stacks stay balanced, but no elapsed measurement is attributed.

use crate::call_graph::ThreadGraph;
use crate::config::ProfilerConfig;
use crate::error::{ProfileError, Result};
use crate::measure::{Clock, MeasureMode};
use crate::registry::{MethodId, MethodRegistry, Qualifier, SourceLocation};
use crate::result::{ProfileResult, ThreadProfile};
use crossbeam::sync::ShardedLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Marker for "not switched out" / "not paused"
const NONE: u64 = u64::MAX;

/// Identifies a thread of the profiled program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey(pub u64);

impl ThreadKey {
    /// Stable key of the calling OS thread
    pub fn current() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        thread_local! {
            static KEY: ThreadKey = ThreadKey(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        KEY.with(|key| *key)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a [`Profiler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Running = 1,
    Paused = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Running,
            2 => SessionState::Paused,
            _ => SessionState::Idle,
        }
    }
}

/// What a stopped session hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Snapshot {
    /// Full per-thread call graph
    Graph(ProfileResult),
    /// Benchmarking mode: accumulated session time in the clock's unit
    Elapsed(f64),
}

impl Snapshot {
    pub fn result(&self) -> Option<&ProfileResult> {
        match self {
            Snapshot::Graph(result) => Some(result),
            Snapshot::Elapsed(_) => None,
        }
    }

    pub fn into_result(self) -> Option<ProfileResult> {
        match self {
            Snapshot::Graph(result) => Some(result),
            Snapshot::Elapsed(_) => None,
        }
    }

    pub fn elapsed(&self) -> Option<f64> {
        match self {
            Snapshot::Elapsed(elapsed) => Some(*elapsed),
            Snapshot::Graph(_) => None,
        }
    }
}

#[derive(Debug)]
struct ThreadSlot {
    graph: Mutex<ThreadGraph>,
    switched_out_at: AtomicU64,
}

#[derive(Debug)]
struct Control {
    config: ProfilerConfig,
    /// Benchmark ticks carried over from earlier resume/pause cycles
    carried: u64,
    /// Session time at which the current run began
    origin: u64,
    last_snapshot: Option<Snapshot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call-graph profiler session
///
/// # Example
/// ```
/// use callgraph_prof::config::ProfilerConfig;
/// use callgraph_prof::registry::Qualifier;
/// use callgraph_prof::session::{Profiler, ThreadKey};
///
/// let profiler = Profiler::new(ProfilerConfig::wall()).unwrap();
/// let thread = ThreadKey::current();
/// profiler.start().unwrap();
/// profiler.on_call_enter(thread, &Qualifier::Class("Foo".into()), "bar", None).unwrap();
/// profiler.on_call_exit(thread).unwrap();
/// let snapshot = profiler.stop().unwrap();
///
/// let result = snapshot.result().unwrap();
/// let profile = result.thread(thread).unwrap();
/// assert_eq!(profile.method("Foo#bar").unwrap().called, 1);
/// ```
#[derive(Debug)]
pub struct Profiler {
    control: Mutex<Control>,
    state: AtomicU8,
    benchmarking: AtomicBool,
    clock: ShardedLock<Arc<dyn Clock>>,
    paused_at: AtomicU64,
    paused_total: AtomicU64,
    registry: MethodRegistry,
    threads: ShardedLock<HashMap<ThreadKey, Arc<ThreadSlot>>>,
    attended: Mutex<Option<ThreadKey>>,
}

impl Profiler {
    /// Create an idle profiler
    ///
    /// # Errors
    /// `InvalidArgument` or `UnsupportedMeasurement` when the configured
    /// clock cannot be built.
    pub fn new(config: ProfilerConfig) -> Result<Self> {
        let clock = config.build_clock()?;
        Ok(Self::with_clock(config, clock))
    }

    /// Create an idle profiler sampling an explicit clock
    ///
    /// The clock's mode takes precedence over `config.measure_mode`.
    pub fn with_clock(mut config: ProfilerConfig, clock: Arc<dyn Clock>) -> Self {
        config.measure_mode = clock.mode();
        Self {
            benchmarking: AtomicBool::new(config.benchmarking),
            control: Mutex::new(Control {
                config,
                carried: 0,
                origin: 0,
                last_snapshot: None,
            }),
            state: AtomicU8::new(SessionState::Idle as u8),
            clock: ShardedLock::new(clock),
            paused_at: AtomicU64::new(NONE),
            paused_total: AtomicU64::new(0),
            registry: MethodRegistry::new(),
            threads: ShardedLock::new(HashMap::new()),
            attended: Mutex::new(None),
        }
    }

    pub fn config(&self) -> ProfilerConfig {
        lock(&self.control).config.clone()
    }

    /// Replace the configuration
    ///
    /// # Errors
    /// `AlreadyRunning` unless idle; `InvalidArgument` or
    /// `UnsupportedMeasurement` for an unusable configuration. Nothing
    /// changes on error.
    pub fn set_config(&self, config: ProfilerConfig) -> Result<()> {
        let mut control = lock(&self.control);
        if self.state() != SessionState::Idle {
            return Err(ProfileError::AlreadyRunning);
        }
        config.validate()?;
        // Keep the current clock (possibly an explicit one) unless the
        // measurement itself changes
        if config.measure_mode != control.config.measure_mode
            || config.cpu_frequency != control.config.cpu_frequency
        {
            let clock = config.build_clock()?;
            *self.clock.write().unwrap_or_else(PoisonError::into_inner) = clock;
        }
        debug!(
            mode = %config.measure_mode,
            benchmarking = config.benchmarking,
            "profiler configured"
        );
        self.benchmarking.store(config.benchmarking, Ordering::SeqCst);
        control.config = config;
        Ok(())
    }

    pub fn set_measure_mode(&self, mode: MeasureMode) -> Result<()> {
        let config = ProfilerConfig {
            measure_mode: mode,
            ..self.config()
        };
        self.set_config(config)
    }

    pub fn set_benchmarking(&self, benchmarking: bool) -> Result<()> {
        let config = ProfilerConfig {
            benchmarking,
            ..self.config()
        };
        self.set_config(config)
    }

    pub fn measure_mode(&self) -> MeasureMode {
        self.clock().mode()
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn running(&self) -> bool {
        self.state() != SessionState::Idle
    }

    pub fn paused(&self) -> bool {
        self.state() == SessionState::Paused
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Session time: the clock minus time spent paused, frozen while paused
    fn now(&self) -> u64 {
        let paused_at = self.paused_at.load(Ordering::Acquire);
        let raw = if paused_at != NONE {
            paused_at
        } else {
            self.clock
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .sample()
        };
        raw.saturating_sub(self.paused_total.load(Ordering::Acquire))
    }

    fn begin(&self, control: &mut Control, reset_benchmark: bool) {
        self.threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *lock(&self.attended) = None;
        self.paused_total.store(0, Ordering::SeqCst);
        self.paused_at.store(NONE, Ordering::SeqCst);
        if reset_benchmark {
            control.carried = 0;
        }
        control.origin = self.now();
        self.set_state(SessionState::Running);
        debug!(
            mode = %control.config.measure_mode,
            benchmarking = control.config.benchmarking,
            "profiling session started"
        );
    }

    /// Start a session
    ///
    /// # Errors
    /// `AlreadyRunning` when a session is active; nothing changes.
    pub fn start(&self) -> Result<()> {
        let mut control = lock(&self.control);
        if self.state() != SessionState::Idle {
            return Err(ProfileError::AlreadyRunning);
        }
        self.begin(&mut control, true);
        Ok(())
    }

    /// Stop the session and freeze its data
    ///
    /// Frames still live are closed at the stop time.
    ///
    /// # Errors
    /// `NotRunning` when idle.
    pub fn stop(&self) -> Result<Snapshot> {
        let mut control = lock(&self.control);
        if self.state() == SessionState::Idle {
            return Err(ProfileError::NotRunning);
        }

        let now = self.now();
        control.carried += now.saturating_sub(control.origin);
        self.set_state(SessionState::Idle);

        let clock = self.clock();
        let snapshot = if control.config.benchmarking {
            Snapshot::Elapsed(clock.convert(control.carried))
        } else {
            Snapshot::Graph(self.freeze(now, clock.as_ref()))
        };

        self.paused_at.store(NONE, Ordering::SeqCst);
        debug!("profiling session stopped");
        control.last_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn freeze(&self, now: u64, clock: &dyn Clock) -> ProfileResult {
        let slots: Vec<Arc<ThreadSlot>> = self
            .threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let registry = self.registry.snapshot();

        let mut threads: Vec<ThreadProfile> = slots
            .iter()
            .map(|slot| {
                let mut graph = lock(&slot.graph);
                let closed = graph.unwind(now);
                if closed > 0 {
                    warn!(
                        thread = %graph.thread(),
                        frames = closed,
                        "closed frames still live at stop"
                    );
                }
                ThreadProfile::freeze(&graph, &registry, clock)
            })
            .collect();
        threads.sort_by_key(|profile| profile.thread);

        ProfileResult {
            measure_mode: clock.mode(),
            threads,
        }
    }

    /// Stop attributing elapsed measurement until [`Profiler::resume`]
    ///
    /// # Errors
    /// `NotRunning` when idle.
    pub fn pause(&self) -> Result<()> {
        let _control = lock(&self.control);
        match self.state() {
            SessionState::Idle => Err(ProfileError::NotRunning),
            SessionState::Paused => Ok(()),
            SessionState::Running => {
                let raw = self
                    .clock
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sample();
                self.paused_at.store(raw, Ordering::SeqCst);
                self.set_state(SessionState::Paused);
                debug!("profiling session paused");
                Ok(())
            }
        }
    }

    /// Resume a paused session, or start one without resetting the
    /// benchmark accumulator when idle
    pub fn resume(&self) -> Result<()> {
        let mut control = lock(&self.control);
        match self.state() {
            SessionState::Idle => {
                self.begin(&mut control, false);
                Ok(())
            }
            SessionState::Running => Ok(()),
            SessionState::Paused => {
                let raw = self
                    .clock
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sample();
                let paused_at = self.paused_at.swap(NONE, Ordering::SeqCst);
                if paused_at != NONE {
                    self.paused_total
                        .fetch_add(raw.saturating_sub(paused_at), Ordering::SeqCst);
                }
                self.set_state(SessionState::Running);
                debug!("profiling session resumed");
                Ok(())
            }
        }
    }

    /// Resume, run `body`, then pause again
    pub fn resume_with<R>(&self, body: impl FnOnce() -> R) -> Result<R> {
        self.resume()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        self.pause()?;
        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Start, run `body`, stop
    ///
    /// If `body` panics the session is stopped first and the partial
    /// snapshot stays available from [`Profiler::last_snapshot`].
    pub fn profile<R>(&self, body: impl FnOnce() -> R) -> Result<(R, Snapshot)> {
        self.start()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        let snapshot = self.stop();
        match outcome {
            Ok(value) => Ok((value, snapshot?)),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Accumulated benchmark time, in the clock's unit
    pub fn total_time(&self) -> f64 {
        let control = lock(&self.control);
        let mut ticks = control.carried;
        if self.running() {
            ticks += self.now().saturating_sub(control.origin);
        }
        self.clock().convert(ticks)
    }

    /// Snapshot returned by the most recent stop
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        lock(&self.control).last_snapshot.clone()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.running() {
            Ok(())
        } else {
            Err(ProfileError::NotRunning)
        }
    }

    fn recording(&self) -> Result<bool> {
        self.ensure_active()?;
        Ok(!self.benchmarking.load(Ordering::Relaxed))
    }

    fn slot(&self, thread: ThreadKey, now: u64) -> Arc<ThreadSlot> {
        if let Some(slot) = self
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread)
        {
            return Arc::clone(slot);
        }

        let capacity = lock(&self.control).config.initial_stack_capacity;
        let mut threads = self.threads.write().unwrap_or_else(PoisonError::into_inner);
        let slot = threads.entry(thread).or_insert_with(|| {
            Arc::new(ThreadSlot {
                graph: Mutex::new(ThreadGraph::new(thread, now, capacity)),
                switched_out_at: AtomicU64::new(NONE),
            })
        });
        Arc::clone(slot)
    }

    /// Give `thread` the clock's attention, booking its wait if it was
    /// switched out
    fn attend(&self, thread: ThreadKey, now: u64) -> Arc<ThreadSlot> {
        let slot = self.slot(thread, now);

        let switched_out_at = {
            let mut attended = lock(&self.attended);
            if *attended == Some(thread) {
                return slot;
            }
            if let Some(previous) = *attended {
                if let Some(previous) = self
                    .threads
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&previous)
                {
                    previous.switched_out_at.store(now, Ordering::SeqCst);
                }
            }
            *attended = Some(thread);
            slot.switched_out_at.swap(NONE, Ordering::SeqCst)
        };

        if switched_out_at != NONE {
            lock(&slot.graph).add_wait(switched_out_at, now);
        }
        slot
    }

    /// Record a call to a pre-resolved method
    ///
    /// # Errors
    /// `NotRunning` when no session is active; `InvalidArgument` when
    /// `method` was not resolved by this profiler's registry.
    pub fn enter(&self, thread: ThreadKey, method: MethodId) -> Result<()> {
        if !self.recording()? {
            return Ok(());
        }
        if method.index() >= self.registry.len() {
            return Err(ProfileError::InvalidArgument(format!(
                "unknown method id {}",
                method.0
            )));
        }
        let now = self.now();
        let slot = self.attend(thread, now);
        lock(&slot.graph).enter(method, now);
        Ok(())
    }

    /// Record a call observed by the instrumentation source
    pub fn on_call_enter(
        &self,
        thread: ThreadKey,
        qualifier: &Qualifier,
        name: &str,
        location: Option<SourceLocation>,
    ) -> Result<()> {
        if !self.recording()? {
            return Ok(());
        }
        let method = self.registry.resolve(qualifier, name);
        if let Some(location) = location {
            self.registry.note_location(method, location);
        }
        self.enter(thread, method)
    }

    /// Record the return of the innermost live call on `thread`
    ///
    /// # Errors
    /// `NotRunning` when no session is active; `StackIntegrityViolation`
    /// when the thread has no live call. The thread's later events are then
    /// ignored.
    pub fn on_call_exit(&self, thread: ThreadKey) -> Result<()> {
        if !self.recording()? {
            return Ok(());
        }
        let now = self.now();
        let slot = self.attend(thread, now);
        let result = lock(&slot.graph).exit(now);
        if let Err(err) = &result {
            warn!(thread = %thread, error = %err, "thread data tainted");
        }
        result
    }

    /// The scheduler switched to `thread`
    pub fn on_thread_switch(&self, thread: ThreadKey) -> Result<()> {
        if !self.recording()? {
            return Ok(());
        }
        let now = self.now();
        self.attend(thread, now);
        Ok(())
    }

    /// The host redefined `qualifier#name`; later calls get a new record
    pub fn on_method_redefined(&self, qualifier: &Qualifier, name: &str) -> MethodId {
        self.registry.redefine(qualifier, name)
    }

    /// Profile a Rust scope on the calling thread until the guard drops
    pub fn scope(&self, qualifier: &Qualifier, name: &str) -> Result<ScopeGuard<'_>> {
        let thread = ThreadKey::current();
        self.on_call_enter(thread, qualifier, name, None)?;
        Ok(ScopeGuard {
            profiler: self,
            thread,
        })
    }
}

/// Emits the call exit of a [`Profiler::scope`] when dropped
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    profiler: &'a Profiler,
    thread: ThreadKey,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        // A stopped session is fine here; a StackIntegrityViolation has
        // already been reported by the warning in on_call_exit
        let _ = self.profiler.on_call_exit(self.thread);
    }
}
