//! Min-heap of expiry deadlines holding weak references.
//!
//! The queue never owns what it points at. Each node is `(deadline, seq, ref)`
//! where `ref` is a weak reference (for the cache directory: shard index plus a
//! generation-checked [`SlotId`](crate::ds::SlotId)). Nodes are never updated
//! or removed in place; the consumer resolves each popped reference and drops
//! the ones whose target is gone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  heap: BinaryHeap<Reverse<Node>>   (ordered by deadline, then seq)  │
//! │                                                                     │
//! │    (t=100, seq=3, ref=s0:#4/g1)  ← next to expire                   │
//! │    (t=100, seq=7, ref=s2:#9/g0)                                     │
//! │    (t=250, seq=1, ref=s1:#0/g5)  ← may be stale (slot reused)       │
//! │                                                                     │
//! │  seq: monotonic tie-breaker, FIFO among equal deadlines             │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//! pop_expired(now = 100) ──► [s0:#4/g1, s2:#9/g0]
//! ```
//!
//! ## Operations
//!
//! | Operation     | Description                                 | Complexity |
//! |---------------|---------------------------------------------|------------|
//! | `schedule`    | Push a deadline for a reference             | O(log n)   |
//! | `pop_expired` | Pop every node with `deadline <= now`       | O(k log n) |
//! | `peek_next`   | Earliest pending deadline                   | O(1)       |
//! | `retain`      | Drop nodes rejected by a predicate          | O(n)       |
//!
//! ## Example Usage
//!
//! ```
//! use cachedir::ds::ExpiryQueue;
//!
//! let mut queue: ExpiryQueue<u64, &str> = ExpiryQueue::new();
//! queue.schedule("late", 30);
//! queue.schedule("early", 10);
//! queue.schedule("middle", 20);
//!
//! assert_eq!(queue.pop_expired(&20), vec!["early", "middle"]);
//! assert_eq!(queue.peek_next(), Some(&30));
//! ```
//!
//! ## Thread Safety
//!
//! `ExpiryQueue` is not thread-safe. The cache keeps a single instance behind
//! its own mutex.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
struct Node<T, R> {
    deadline: T,
    seq: u64,
    target: R,
}

impl<T: Ord, R> PartialEq for Node<T, R> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T: Ord, R> Eq for Node<T, R> {}

impl<T: Ord, R> PartialOrd for Node<T, R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord, R> Ord for Node<T, R> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.deadline.cmp(&other.deadline) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            ordering => ordering,
        }
    }
}

/// Deadline-ordered queue of weak references.
///
/// # Type Parameters
///
/// - `T`: deadline type (must be `Ord`)
/// - `R`: weak reference type; its validity is checked by the consumer
#[derive(Debug)]
pub struct ExpiryQueue<T, R> {
    heap: BinaryHeap<Reverse<Node<T, R>>>,
    seq: u64,
}

impl<T: Ord, R> ExpiryQueue<T, R> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            seq: 0,
        }
    }

    /// Number of queued nodes, stale ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queues `target` to expire at `deadline`.
    pub fn schedule(&mut self, target: R, deadline: T) {
        let node = Node {
            deadline,
            seq: self.seq,
            target,
        };
        self.seq = self.seq.wrapping_add(1);
        self.heap.push(Reverse(node));
    }

    /// Returns the earliest pending deadline.
    pub fn peek_next(&self) -> Option<&T> {
        self.heap.peek().map(|Reverse(node)| &node.deadline)
    }

    /// Pops every node whose deadline is `<= now`, earliest first.
    pub fn pop_expired(&mut self, now: &T) -> Vec<R> {
        let mut expired = Vec::new();
        while let Some(Reverse(node)) = self.heap.peek() {
            if node.deadline > *now {
                break;
            }
            if let Some(Reverse(node)) = self.heap.pop() {
                expired.push(node.target);
            }
        }
        expired
    }

    /// Removes every node and returns them as `(target, deadline)` pairs.
    ///
    /// Used to compact the queue: the caller checks each target and
    /// re-schedules the live ones.
    pub fn drain(&mut self) -> Vec<(R, T)> {
        let nodes = std::mem::take(&mut self.heap).into_vec();
        nodes
            .into_iter()
            .map(|Reverse(node)| (node.target, node.deadline))
            .collect()
    }

    /// Keeps only the nodes for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&R, &T) -> bool) {
        self.heap
            .retain(|Reverse(node)| keep(&node.target, &node.deadline));
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl<T: Ord, R> Default for ExpiryQueue<T, R> {
    fn default() -> Self {
        Self::new()
    }
}
