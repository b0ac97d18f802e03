//! Epoch timer scheduling.
//!
//! A minimal delayed-task facility: a min-heap of deadlines, each naming
//! the filter whose table should be flushed. The engine is cooperative —
//! timers do not run on their own thread; the host drives the engine's
//! clock forward and due deadlines are drained in firing order. There is
//! no cancellation: once scheduled, a deadline always fires.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::aggregate::Timestamp;

/// A scheduled epoch flush for one filter, addressed by metric id and
/// position in the metric's filter list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Deadline {
    /// When the flush fires.
    pub at: Timestamp,
    /// The metric id owning the filter.
    pub metric: String,
    /// Index of the filter within the metric's filter list. Stable
    /// because filters are never unregistered.
    pub index: usize,
}

/// Min-heap of pending epoch deadlines.
#[derive(Debug, Default)]
pub(crate) struct EpochScheduler {
    heap: BinaryHeap<Reverse<Deadline>>,
}

impl EpochScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a flush for the given filter at `at`.
    pub fn schedule(&mut self, at: Timestamp, metric: String, index: usize) {
        self.heap.push(Reverse(Deadline { at, metric, index }));
    }

    /// Removes and returns the earliest deadline with `at <= now`, if
    /// any. Deadlines with equal timestamps drain in insertion-stable
    /// heap order.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<Deadline> {
        match self.heap.peek() {
            Some(Reverse(deadline)) if deadline.at <= now => {
                self.heap.pop().map(|Reverse(d)| d)
            }
            _ => None,
        }
    }

    /// The timestamp of the next pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(d)| d.at)
    }

    /// Number of pending deadlines.
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
