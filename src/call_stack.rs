//! Per-thread stack of live invocations
//!
//! Frames are plain `Copy` values in a growable vector: push and pop are O(1)
//! and allocation-free once the vector has reached the program's maximum
//! call depth. The bottom frame is the synthetic `#toplevel` root and is never
//! popped while the thread is being profiled.

use crate::call_graph::{EdgeIdx, RecordIdx};

/// Default number of frames reserved per thread
pub const INITIAL_STACK_SIZE: usize = 8;

/// One live invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Method record this frame aggregates into
    pub record: RecordIdx,
    /// Edge from the caller's record; `None` only for the root frame
    pub edge: Option<EdgeIdx>,
    /// Clock sample at entry
    pub start: u64,
    /// Elapsed ticks of callees that already returned
    pub child_cost: u64,
    /// Ticks spent on top of the stack while the thread was switched out
    pub wait: u64,
    /// Elapsed ticks of re-entrant occurrences of the caller's method below
    /// this frame; excluded from the ticks charged to this frame's edge
    pub nested_cost: u64,
    /// Stack position of the nearest live frame of the same record below
    pub enclosing: Option<u32>,
}

impl Frame {
    pub fn new(record: RecordIdx, edge: Option<EdgeIdx>, start: u64) -> Self {
        Self {
            record,
            edge,
            start,
            child_cost: 0,
            wait: 0,
            nested_cost: 0,
            enclosing: None,
        }
    }
}

/// Explicit call stack of one thread
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Push a frame, returning its stack position
    pub fn push(&mut self, frame: Frame) -> u32 {
        let position = self.frames.len() as u32;
        self.frames.push(frame);
        position
    }

    /// Pop the top frame unless only the root is left
    pub fn pop_call(&mut self) -> Option<Frame> {
        if self.frames.len() <= 1 {
            return None;
        }
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn get_mut(&mut self, position: u32) -> Option<&mut Frame> {
        self.frames.get_mut(position as usize)
    }

    /// Number of frames, root included
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of live calls above the root
    pub fn depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}
