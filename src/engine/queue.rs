// src/engine/queue.rs

//! The ready queue.
//!
//! Tasks whose predecessors have all finalized wait here until a worker
//! slot frees up. The queue re-sorts on every push, so it behaves like a
//! priority queue keyed by the active ordering policy; with no policy it is
//! FIFO in parser declaration order.

use serde::{Deserialize, Serialize};

use crate::model::task::TaskId;

/// How ready tasks are ordered relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Descending estimated runtime; unknown estimates sort after known.
    LongestFirst,
    /// Ascending estimated runtime; unknown estimates sort after known.
    ShortestFirst,
}

impl std::fmt::Display for OrderingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            OrderingPolicy::LongestFirst => f.write_str("longest_first"),
            OrderingPolicy::ShortestFirst => f.write_str("shortest_first"),
        }
    }
}

impl std::str::FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "longest_first" => Ok(OrderingPolicy::LongestFirst),
            "shortest_first" => Ok(OrderingPolicy::ShortestFirst),
            other => Err(format!(
                "invalid ordering policy '{other}' (expected longest_first or shortest_first)"
            )),
        }
    }
}

/// One queued ready task.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: TaskId,
    pub stage: Option<String>,
    /// Estimated runtime in seconds; `None` when the estimator has no data.
    pub cost: Option<f64>,
    /// Parser declaration index, the FIFO tiebreaker.
    pub seq: usize,
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    policy: Option<OrderingPolicy>,
    entries: Vec<QueueEntry>,
}

impl ReadyQueue {
    pub fn new(policy: Option<OrderingPolicy>) -> Self {
        Self {
            policy,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push(entry);
        let policy = self.policy;
        self.entries.sort_by(|a, b| Self::compare(policy, a, b));
    }

    /// Remove and return the first entry satisfying `eligible` (head first),
    /// skipping over entries blocked by e.g. a stage worker cap.
    pub fn pop_eligible<F: Fn(&QueueEntry) -> bool>(&mut self, eligible: F) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(eligible)?;
        Some(self.entries.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    fn compare(
        policy: Option<OrderingPolicy>,
        a: &QueueEntry,
        b: &QueueEntry,
    ) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        let by_seq = a.seq.cmp(&b.seq);
        let Some(policy) = policy else {
            return by_seq;
        };

        match (a.cost, b.cost) {
            (None, None) => by_seq,
            // Unknown estimates sort after known ones under either policy.
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(ca), Some(cb)) => {
                let ordered = match policy {
                    OrderingPolicy::LongestFirst => cb.partial_cmp(&ca),
                    OrderingPolicy::ShortestFirst => ca.partial_cmp(&cb),
                };
                ordered.unwrap_or(Ordering::Equal).then(by_seq)
            }
        }
    }
}
