// Shared helpers for integration tests

#![allow(dead_code)]

use callgraph_prof::config::ProfilerConfig;
use callgraph_prof::measure::ManualClock;
use callgraph_prof::{ProfileResult, Profiler, Snapshot, ThreadProfile};
use std::sync::Arc;

/// Profiler driven by a millisecond manual clock
pub fn manual_profiler() -> (Arc<ManualClock>, Profiler) {
    let clock = Arc::new(ManualClock::millis());
    let profiler = Profiler::with_clock(ProfilerConfig::default(), clock.clone());
    (clock, profiler)
}

pub fn graph(snapshot: Snapshot) -> ProfileResult {
    match snapshot {
        Snapshot::Graph(result) => result,
        Snapshot::Elapsed(elapsed) => panic!("expected a call graph, got elapsed {}", elapsed),
    }
}

/// Check the aggregation invariants of every record in `profile`
///
/// - total == self + wait + children
/// - sum of child edge totals == children time
/// - sum of parent edge calls == calls
pub fn assert_invariants(profile: &ThreadProfile, tolerance: f64) {
    for method in profile.methods() {
        let parts = method.self_time + method.wait_time + method.children_time;
        assert!(
            (method.total_time - parts).abs() <= tolerance,
            "{}: total {} != self {} + wait {} + children {}",
            method.name,
            method.total_time,
            method.self_time,
            method.wait_time,
            method.children_time
        );
        assert!(method.self_time >= -tolerance, "{} has negative self", method.name);

        if !method.children.is_empty() {
            let children: f64 = profile.children(method).map(|c| c.total_time).sum();
            assert!(
                (children - method.children_time).abs() <= tolerance,
                "{}: child totals {} != children time {}",
                method.name,
                children,
                method.children_time
            );
        }

        if !method.parents.is_empty() {
            let calls: u64 = profile.parents(method).map(|c| c.called).sum();
            assert_eq!(calls, method.called, "{}: parent calls", method.name);
        }
    }
}

pub fn approx(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}
