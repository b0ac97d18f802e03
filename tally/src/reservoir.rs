//! Bounded sample reservoir.
//!
//! A [`Reservoir`] holds up to a fixed number of example string values for
//! an aggregate, so a threshold callback can report *which* usernames or
//! URIs were seen, not just how many. It is a plain FIFO: when full, the
//! oldest sample is evicted to make room for the newest. Merging two
//! reservoirs (the distributed case) replays one side's samples into the
//! other under the same eviction policy, so the capacity bound holds for
//! any merge order.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Fixed-capacity FIFO of example sample values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservoir {
    /// Maximum number of samples retained.
    capacity: usize,
    /// Retained samples, oldest first.
    samples: VecDeque<String>,
}

impl Reservoir {
    /// Creates an empty reservoir with the given capacity.
    ///
    /// A capacity of zero produces a reservoir that retains nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Pushes a sample, evicting the oldest one if the reservoir is full.
    pub fn push(&mut self, sample: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample.into());
    }

    /// Copies the retained samples into a `Vec`, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.samples.iter().cloned().collect()
    }

    /// Merges another reservoir's samples into this one.
    ///
    /// Samples are replayed oldest-first through the normal eviction
    /// policy, so the result never exceeds this reservoir's capacity.
    pub fn merge(&mut self, other: &Reservoir) {
        for sample in &other.samples {
            self.push(sample.clone());
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of samples currently retained.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the reservoir holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let mut r = Reservoir::new(3);
        r.push("a");
        r.push("b");
        assert_eq!(r.len(), 2);
        assert_eq!(r.snapshot(), vec!["a", "b"]);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut r = Reservoir::new(3);
        for s in ["a", "b", "c", "d", "e"] {
            r.push(s);
        }
        assert_eq!(r.len(), 3);
        assert_eq!(r.snapshot(), vec!["c", "d", "e"]);
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let mut r = Reservoir::new(0);
        r.push("a");
        assert!(r.is_empty());
        assert_eq!(r.snapshot(), Vec::<String>::new());
    }

    #[test]
    fn test_merge_respects_capacity() {
        let mut a = Reservoir::new(4);
        let mut b = Reservoir::new(4);
        for s in ["a1", "a2", "a3"] {
            a.push(s);
        }
        for s in ["b1", "b2", "b3"] {
            b.push(s);
        }

        a.merge(&b);
        assert_eq!(a.len(), 4);
        // b's samples displace a's oldest, FIFO order preserved
        assert_eq!(a.snapshot(), vec!["a3", "b1", "b2", "b3"]);
    }

    #[test]
    fn test_merge_never_exceeds_capacity_for_any_sequence() {
        let mut a = Reservoir::new(5);
        for i in 0..100 {
            a.push(format!("s{i}"));
            assert!(a.len() <= 5);
        }

        let mut b = Reservoir::new(5);
        for i in 0..17 {
            b.push(format!("t{i}"));
        }
        a.merge(&b);
        assert!(a.len() <= 5);
    }
}
