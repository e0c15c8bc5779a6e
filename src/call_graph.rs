//! Call graph aggregation for a single thread
//!
//! A [`ThreadGraph`] owns one thread's call stack together with its arena of
//! method records and caller→callee edges. Records and edges refer to each
//! other by index, so the graph needs no shared ownership and no locking of
//! its own: the session hands each thread exclusive access to its graph.
//!
//! # Attribution
//!
//! On exit of a frame with elapsed ticks `e`, callee ticks `c` and wait `w`:
//!
//! ```text
//! self    = e - c - w            (added to the record and to the caller edge)
//! wait    = w                    (added to the record and to the caller edge)
//! total  += e                    (record, outermost live occurrence only)
//! charged = e - nested           (added to the caller edge)
//! ```
//!
//! `nested` is the elapsed time of re-entrant occurrences of the *caller's*
//! method below this frame (for direct recursion the frame itself, so a
//! recursive self-edge is charged 0). This keeps, for every record,
//! `total == self + wait + sum(child edge totals)` for direct recursion and
//! for indirect cycles of any length, while folding the time of a cycle into
//! its outermost occurrence.

use crate::call_stack::{CallStack, Frame};
use crate::error::{ProfileError, Result};
use crate::registry::MethodId;
use crate::session::ThreadKey;
use fnv::FnvHashMap;

/// Index of a method record in its thread's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordIdx(pub u32);

/// Index of a call edge in its thread's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeIdx(pub u32);

/// The synthetic `#toplevel` record, always first in a thread's arena
pub const TOPLEVEL_RECORD: RecordIdx = RecordIdx(0);

/// Aggregated statistics of one method on one thread, in clock ticks
#[derive(Debug, Clone)]
pub struct MethodStats {
    pub method: MethodId,
    pub called: u64,
    pub total: u64,
    pub self_ticks: u64,
    pub wait: u64,
    /// Edges from callers, in first-call order
    pub parents: Vec<EdgeIdx>,
    /// Edges to callees, in first-call order
    pub children: Vec<EdgeIdx>,
    live_top: Option<u32>,
}

impl MethodStats {
    fn new(method: MethodId) -> Self {
        Self {
            method,
            called: 0,
            total: 0,
            self_ticks: 0,
            wait: 0,
            parents: Vec::new(),
            children: Vec::new(),
            live_top: None,
        }
    }

    /// Whether an invocation of this method is currently on the stack
    pub fn is_live(&self) -> bool {
        self.live_top.is_some()
    }
}

/// Aggregated statistics of one caller→callee relation, in clock ticks
#[derive(Debug, Clone)]
pub struct EdgeStats {
    pub parent: RecordIdx,
    pub child: RecordIdx,
    pub called: u64,
    pub total: u64,
    pub self_ticks: u64,
    pub wait: u64,
}

/// Thread table: call stack plus the method/edge arena of one thread
#[derive(Debug)]
pub struct ThreadGraph {
    thread: ThreadKey,
    stack: CallStack,
    records: Vec<MethodStats>,
    record_index: FnvHashMap<MethodId, RecordIdx>,
    edges: Vec<EdgeStats>,
    edge_index: FnvHashMap<(RecordIdx, RecordIdx), EdgeIdx>,
    /// Clock sample of the latest event applied to this thread
    last_event: u64,
    tainted: bool,
}

impl ThreadGraph {
    /// Create the table for a newly observed thread, rooted at `#toplevel`
    pub fn new(thread: ThreadKey, now: u64, stack_capacity: usize) -> Self {
        let mut toplevel = MethodStats::new(MethodId::TOPLEVEL);
        toplevel.called = 1;

        let mut record_index = FnvHashMap::default();
        record_index.insert(MethodId::TOPLEVEL, TOPLEVEL_RECORD);

        let mut stack = CallStack::with_capacity(stack_capacity);
        stack.push(Frame::new(TOPLEVEL_RECORD, None, now));

        Self {
            thread,
            stack,
            records: vec![toplevel],
            record_index,
            edges: Vec::new(),
            edge_index: FnvHashMap::default(),
            last_event: now,
            tainted: false,
        }
    }

    fn record_for(&mut self, method: MethodId) -> RecordIdx {
        if let Some(idx) = self.record_index.get(&method) {
            return *idx;
        }
        let idx = RecordIdx(self.records.len() as u32);
        self.records.push(MethodStats::new(method));
        self.record_index.insert(method, idx);
        idx
    }

    fn edge_for(&mut self, parent: RecordIdx, child: RecordIdx) -> EdgeIdx {
        if let Some(idx) = self.edge_index.get(&(parent, child)) {
            return *idx;
        }
        let idx = EdgeIdx(self.edges.len() as u32);
        self.edges.push(EdgeStats {
            parent,
            child,
            called: 0,
            total: 0,
            self_ticks: 0,
            wait: 0,
        });
        self.edge_index.insert((parent, child), idx);
        self.records[parent.0 as usize].children.push(idx);
        self.records[child.0 as usize].parents.push(idx);
        idx
    }

    /// Record a call to `method` from the method on top of the stack
    pub fn enter(&mut self, method: MethodId, now: u64) {
        if self.tainted {
            return;
        }
        self.last_event = now;

        let parent = self
            .stack
            .top()
            .map(|frame| frame.record)
            .unwrap_or(TOPLEVEL_RECORD);
        let record = self.record_for(method);
        let edge = self.edge_for(parent, record);

        self.edges[edge.0 as usize].called += 1;
        let stats = &mut self.records[record.0 as usize];
        stats.called += 1;

        let mut frame = Frame::new(record, Some(edge), now);
        frame.enclosing = stats.live_top;
        let position = self.stack.push(frame);
        self.records[record.0 as usize].live_top = Some(position);
    }

    /// Record the return of the method on top of the stack
    ///
    /// # Errors
    /// `StackIntegrityViolation` when only the root frame is left. The thread
    /// is tainted and its later events are ignored.
    pub fn exit(&mut self, now: u64) -> Result<()> {
        if self.tainted {
            return Ok(());
        }

        let position = self.stack.len().saturating_sub(1) as u32;
        let Some(frame) = self.stack.pop_call() else {
            self.tainted = true;
            return Err(ProfileError::StackIntegrityViolation {
                thread: self.thread,
                detail: "call exit without a matching call enter".to_string(),
            });
        };
        self.last_event = now;

        let elapsed = now.saturating_sub(frame.start);
        let self_ticks = elapsed
            .saturating_sub(frame.child_cost)
            .saturating_sub(frame.wait);

        let charged = match frame.enclosing {
            // Direct re-entry: the enclosing occurrence is the caller itself
            Some(enclosing) if enclosing + 1 == position => 0,
            Some(enclosing) => {
                if let Some(outer_child) = self.stack.get_mut(enclosing + 1) {
                    outer_child.nested_cost += elapsed;
                }
                elapsed.saturating_sub(frame.nested_cost)
            }
            None => elapsed.saturating_sub(frame.nested_cost),
        };

        let parent_record = match self.stack.top_mut() {
            Some(parent) => {
                parent.child_cost += elapsed;
                parent.record
            }
            None => TOPLEVEL_RECORD,
        };

        let stats = &mut self.records[frame.record.0 as usize];
        stats.live_top = frame.enclosing;
        if frame.enclosing.is_none() {
            stats.total += elapsed;
        }
        stats.self_ticks += self_ticks;
        stats.wait += frame.wait;

        if let Some(edge) = frame.edge {
            let edge = &mut self.edges[edge.0 as usize];
            edge.total += charged;
            edge.self_ticks += self_ticks;
            edge.wait += frame.wait;
        }

        if parent_record == TOPLEVEL_RECORD {
            self.records[TOPLEVEL_RECORD.0 as usize].total += charged;
        }
        Ok(())
    }

    /// Charge the interval a switched-out thread spent waiting to its top frame
    ///
    /// The interval is clipped to start no earlier than this thread's latest
    /// event, so it never overlaps the frame's callees. Wait on the bare root
    /// is booked straight into `#toplevel`.
    pub fn add_wait(&mut self, switched_out_at: u64, now: u64) {
        if self.tainted {
            return;
        }
        let from = switched_out_at.max(self.last_event);
        self.last_event = self.last_event.max(now);
        let Some(top) = self.stack.top_mut() else {
            return;
        };
        let wait = now.saturating_sub(from);
        if wait == 0 {
            return;
        }

        if top.edge.is_none() {
            let toplevel = &mut self.records[TOPLEVEL_RECORD.0 as usize];
            toplevel.wait += wait;
            toplevel.total += wait;
        } else {
            top.wait += wait;
        }
    }

    /// Close every live frame at `now`, returning how many were closed
    pub fn unwind(&mut self, now: u64) -> usize {
        let mut closed = 0;
        while self.stack.depth() > 0 && !self.tainted {
            if self.exit(now).is_err() {
                break;
            }
            closed += 1;
        }
        closed
    }

    pub fn taint(&mut self) {
        self.tainted = true;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn thread(&self) -> ThreadKey {
        self.thread
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    pub fn records(&self) -> &[MethodStats] {
        &self.records
    }

    pub fn edges(&self) -> &[EdgeStats] {
        &self.edges
    }

    pub fn record(&self, method: MethodId) -> Option<&MethodStats> {
        self.record_index
            .get(&method)
            .map(|idx| &self.records[idx.0 as usize])
    }

    pub fn edge(&self, idx: EdgeIdx) -> &EdgeStats {
        &self.edges[idx.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MethodId = MethodId(10);
    const B: MethodId = MethodId(11);
    const SLEEP: MethodId = MethodId(12);
    const CYCLE: MethodId = MethodId(13);
    const SUB_CYCLE: MethodId = MethodId(14);

    fn graph() -> ThreadGraph {
        ThreadGraph::new(ThreadKey(1), 0, 4)
    }

    /// Every record: self + wait + sum(child totals) == total, and
    /// sum(parent calls) == calls
    fn assert_invariants(graph: &ThreadGraph) {
        for stats in graph.records() {
            if !stats.children.is_empty() {
                let children: u64 = stats.children.iter().map(|e| graph.edge(*e).total).sum();
                assert_eq!(
                    stats.self_ticks + stats.wait + children,
                    stats.total,
                    "children time of {:?}",
                    stats.method
                );
            }
            if !stats.parents.is_empty() {
                let calls: u64 = stats.parents.iter().map(|e| graph.edge(*e).called).sum();
                assert_eq!(calls, stats.called, "calls of {:?}", stats.method);
            }
        }
    }

    #[test]
    fn test_sleep_under_toplevel() {
        let mut g = graph();
        g.enter(SLEEP, 0);
        g.exit(1000).unwrap();

        assert_eq!(g.records().len(), 2);
        let sleep = g.record(SLEEP).unwrap();
        assert_eq!(sleep.total, 1000);
        assert_eq!(sleep.self_ticks, 1000);
        assert_eq!(sleep.called, 1);

        let top = g.record(MethodId::TOPLEVEL).unwrap();
        assert_eq!(top.total, 1000);
        assert_eq!(top.self_ticks, 0);
        assert_invariants(&g);
    }

    #[test]
    fn test_nested_attribution() {
        // a() { sleep(1); b() }  b() { sleep(1) }
        let mut g = graph();
        g.enter(A, 0);
        g.enter(SLEEP, 0);
        g.exit(1000).unwrap();
        g.enter(B, 1000);
        g.enter(SLEEP, 1000);
        g.exit(2000).unwrap();
        g.exit(2000).unwrap();
        g.exit(2000).unwrap();

        let a = g.record(A).unwrap();
        assert_eq!((a.total, a.self_ticks), (2000, 0));
        let b = g.record(B).unwrap();
        assert_eq!((b.total, b.self_ticks), (1000, 0));
        let sleep = g.record(SLEEP).unwrap();
        assert_eq!((sleep.total, sleep.called, sleep.parents.len()), (2000, 2, 2));
        assert_invariants(&g);
    }

    #[test]
    fn test_direct_recursion_single_record() {
        // simple(3): sleep(1) then recurse
        let mut g = graph();
        let mut t = 0;
        for _ in 0..3 {
            g.enter(A, t);
            g.enter(SLEEP, t);
            t += 1000;
            g.exit(t).unwrap();
        }
        for _ in 0..3 {
            g.exit(t).unwrap();
        }

        let a = g.record(A).unwrap();
        assert_eq!(a.called, 3);
        assert_eq!(a.total, 3000);
        assert_eq!(a.self_ticks, 0);
        assert_eq!(a.parents.len(), 2);
        assert!(!a.is_live());

        // Self edge carries calls but no total
        let self_edge = a
            .children
            .iter()
            .map(|e| g.edge(*e))
            .find(|e| e.child == e.parent)
            .unwrap();
        assert_eq!((self_edge.called, self_edge.total), (2, 0));
        assert_invariants(&g);
    }

    #[test]
    fn test_indirect_cycle_is_exact() {
        // cycle(n) { sub_cycle(n) }  sub_cycle(n) { work; sleep; cycle(n-1) }
        let mut g = graph();
        g.enter(CYCLE, 0);
        g.enter(SUB_CYCLE, 5);
        g.enter(SLEEP, 10);
        g.exit(1010).unwrap();
        g.enter(CYCLE, 1020);
        g.enter(SUB_CYCLE, 1030);
        g.enter(SLEEP, 1040);
        g.exit(2040).unwrap();
        g.exit(2050).unwrap();
        g.exit(2060).unwrap();
        g.exit(2070).unwrap();
        g.exit(2080).unwrap();

        let cycle = g.record(CYCLE).unwrap();
        assert_eq!(cycle.called, 2);
        assert_eq!(cycle.total, 2080);
        let sub = g.record(SUB_CYCLE).unwrap();
        assert_eq!(sub.total, 2065);
        assert_eq!(sub.called, 2);
        assert_eq!(g.record(MethodId::TOPLEVEL).unwrap().total, 2080);
        assert_invariants(&g);
    }

    #[test]
    fn test_three_hop_cycle_folds_into_outermost() {
        let mut g = graph();
        let c = MethodId(15);
        g.enter(A, 0);
        g.enter(B, 1);
        g.enter(c, 2);
        g.enter(A, 3);
        g.enter(B, 4);
        g.exit(10).unwrap();
        g.exit(20).unwrap();
        g.exit(30).unwrap();
        g.exit(40).unwrap();
        g.exit(50).unwrap();

        assert_eq!(g.record(A).unwrap().total, 50);
        assert_eq!(g.record(B).unwrap().total, 39);
        assert_eq!(g.record(c).unwrap().total, 28);
        assert_invariants(&g);
    }

    #[test]
    fn test_exit_on_root_taints_thread() {
        let mut g = graph();
        let err = g.exit(10).unwrap_err();
        assert!(matches!(
            err,
            ProfileError::StackIntegrityViolation { thread: ThreadKey(1), .. }
        ));
        assert!(g.is_tainted());

        // Later events are ignored
        g.enter(A, 20);
        assert!(g.exit(30).is_ok());
        assert!(g.record(A).is_none());
    }

    #[test]
    fn test_wait_is_not_self_time() {
        let mut g = graph();
        g.enter(A, 0);
        g.add_wait(100, 2100);
        g.exit(2500).unwrap();

        let a = g.record(A).unwrap();
        assert_eq!(a.total, 2500);
        assert_eq!(a.wait, 2000);
        assert_eq!(a.self_ticks, 500);
        let edge = g.edge(a.parents[0]);
        assert_eq!(edge.wait, 2000);
        assert_invariants(&g);
    }

    #[test]
    fn test_wait_never_overlaps_callees() {
        let mut g = graph();
        g.enter(A, 0);
        g.enter(B, 10);
        g.exit(60).unwrap();
        // Stamped out before the callee returned
        g.add_wait(40, 100);
        g.exit(120).unwrap();

        let a = g.record(A).unwrap();
        assert_eq!(a.wait, 40);
        assert_eq!(a.self_ticks, 30);
        assert_invariants(&g);
    }

    #[test]
    fn test_wait_clipped_to_frame_start() {
        let mut g = graph();
        g.enter(A, 50);
        g.add_wait(10, 80);
        g.exit(100).unwrap();
        assert_eq!(g.record(A).unwrap().wait, 30);
    }

    #[test]
    fn test_wait_on_root_books_toplevel() {
        let mut g = graph();
        g.add_wait(0, 300);
        let top = g.record(MethodId::TOPLEVEL).unwrap();
        assert_eq!((top.wait, top.total), (300, 300));
    }

    #[test]
    fn test_unwind_closes_live_frames() {
        let mut g = graph();
        g.enter(A, 0);
        g.enter(B, 10);
        assert_eq!(g.unwind(100), 2);
        assert_eq!(g.stack().depth(), 0);
        assert_eq!(g.record(A).unwrap().total, 100);
        assert_eq!(g.record(B).unwrap().total, 90);
        assert_invariants(&g);
    }
}
