//! Frozen profile data
//!
//! A [`ProfileResult`] is built once when a session stops and never changes
//! afterwards. Tick sums are converted to the clock's unit at that point:
//! seconds for time clocks, a count for allocations.
//!
//! Records and call edges keep the arena layout of the engine: a
//! [`MethodInfo`] lists the indices of its parent and child [`CallInfo`]s in
//! its thread's `calls` table.

use crate::call_graph::{EdgeStats, MethodStats, ThreadGraph};
use crate::measure::{Clock, MeasureMode};
use crate::registry::{MethodIdentity, RegistryEntry, SourceLocation};
use crate::session::ThreadKey;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Floor of a thread's total time, so percentage consumers never divide by 0
pub const MIN_TOTAL_TIME: f64 = 0.01;

/// Aggregated statistics of one method on one thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    /// Rendered name, e.g. `Foo#bar` or `Foo#bar-1`
    pub name: String,
    pub identity: MethodIdentity,
    pub location: Option<SourceLocation>,
    pub called: u64,
    pub total_time: f64,
    pub self_time: f64,
    pub wait_time: f64,
    pub children_time: f64,
    /// Indices into [`ThreadProfile::calls`] of edges from callers
    pub parents: Vec<usize>,
    /// Indices into [`ThreadProfile::calls`] of edges to callees
    pub children: Vec<usize>,
}

impl MethodInfo {
    pub fn is_toplevel(&self) -> bool {
        self.identity.qualifier == crate::registry::Qualifier::None
            && self.identity.name == "toplevel"
            && self.parents.is_empty()
    }
}

/// Aggregated statistics of one caller→callee relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    /// Index into [`ThreadProfile::methods`] of the caller
    pub parent: usize,
    /// Index into [`ThreadProfile::methods`] of the callee
    pub child: usize,
    pub called: u64,
    pub total_time: f64,
    pub self_time: f64,
    pub wait_time: f64,
    /// `total - self - wait`; negative on recursive self edges, whose
    /// total is folded into the outermost occurrence
    pub children_time: f64,
}

/// Frozen table of one thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadProfile {
    pub thread: ThreadKey,
    pub tainted: bool,
    /// `#toplevel` first, then methods in first-call order
    pub methods: Vec<MethodInfo>,
    pub calls: Vec<CallInfo>,
}

fn signed_difference(clock: &dyn Clock, total: u64, parts: u64) -> f64 {
    if total >= parts {
        clock.convert(total - parts)
    } else {
        -clock.convert(parts - total)
    }
}

impl ThreadProfile {
    pub(crate) fn freeze(
        graph: &ThreadGraph,
        registry: &[RegistryEntry],
        clock: &dyn Clock,
    ) -> Self {
        let methods = graph
            .records()
            .iter()
            .map(|stats| freeze_method(stats, registry, clock))
            .collect();
        let calls = graph
            .edges()
            .iter()
            .map(|edge| freeze_call(edge, clock))
            .collect();

        Self {
            thread: graph.thread(),
            tainted: graph.is_tainted(),
            methods,
            calls,
        }
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    /// Look up a method by rendered name
    pub fn method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn toplevel(&self) -> &MethodInfo {
        &self.methods[0]
    }

    /// Normalization denominator: the `#toplevel` total, at least 0.01
    pub fn total_time(&self) -> f64 {
        self.toplevel().total_time.max(MIN_TOTAL_TIME)
    }

    pub fn calls(&self) -> &[CallInfo] {
        &self.calls
    }

    pub fn parents<'a>(
        &'a self,
        method: &'a MethodInfo,
    ) -> impl Iterator<Item = &'a CallInfo> + 'a {
        method.parents.iter().map(move |&idx| &self.calls[idx])
    }

    pub fn children<'a>(
        &'a self,
        method: &'a MethodInfo,
    ) -> impl Iterator<Item = &'a CallInfo> + 'a {
        method.children.iter().map(move |&idx| &self.calls[idx])
    }

    pub fn caller(&self, call: &CallInfo) -> &MethodInfo {
        &self.methods[call.parent]
    }

    pub fn callee(&self, call: &CallInfo) -> &MethodInfo {
        &self.methods[call.child]
    }

    /// Methods by descending total time, `#toplevel` always first
    pub fn sorted_by_total(&self) -> Vec<&MethodInfo> {
        let mut sorted: Vec<&MethodInfo> = self.methods.iter().skip(1).collect();
        sorted.sort_by(|a, b| {
            b.total_time
                .partial_cmp(&a.total_time)
                .unwrap_or(Ordering::Equal)
        });
        sorted.insert(0, self.toplevel());
        sorted
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }
}

fn freeze_method(stats: &MethodStats, registry: &[RegistryEntry], clock: &dyn Clock) -> MethodInfo {
    // Ids from another registry render as the unresolved method
    let fallback;
    let entry = match registry.get(stats.method.index()) {
        Some(entry) => entry,
        None => {
            fallback = RegistryEntry::reserved("[No method]");
            &fallback
        }
    };
    MethodInfo {
        name: entry.identity.full_name(),
        identity: entry.identity.clone(),
        location: entry.location.clone(),
        called: stats.called,
        total_time: clock.convert(stats.total),
        self_time: clock.convert(stats.self_ticks),
        wait_time: clock.convert(stats.wait),
        children_time: signed_difference(clock, stats.total, stats.self_ticks + stats.wait),
        parents: stats.parents.iter().map(|e| e.0 as usize).collect(),
        children: stats.children.iter().map(|e| e.0 as usize).collect(),
    }
}

fn freeze_call(edge: &EdgeStats, clock: &dyn Clock) -> CallInfo {
    CallInfo {
        parent: edge.parent.0 as usize,
        child: edge.child.0 as usize,
        called: edge.called,
        total_time: clock.convert(edge.total),
        self_time: clock.convert(edge.self_ticks),
        wait_time: clock.convert(edge.wait),
        children_time: signed_difference(clock, edge.total, edge.self_ticks + edge.wait),
    }
}

/// Frozen result of a profiling session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResult {
    pub measure_mode: MeasureMode,
    /// One table per observed thread, ordered by thread key
    pub threads: Vec<ThreadProfile>,
}

impl ProfileResult {
    pub fn threads(&self) -> &[ThreadProfile] {
        &self.threads
    }

    pub fn thread(&self, key: ThreadKey) -> Option<&ThreadProfile> {
        self.threads.iter().find(|t| t.thread == key)
    }

    /// Whether any thread saw a stack integrity violation
    pub fn is_tainted(&self) -> bool {
        self.threads.iter().any(ThreadProfile::is_tainted)
    }
}
