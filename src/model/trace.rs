//! Context trace: the recent history a node has seen, most recent first.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Variable-length history held by a node.
///
/// The capacity is owned by the node's micro-predictor estimate of how much
/// history it needs; there is no fixed upper bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTrace {
    bytes: SmallVec<[u8; 8]>,
    capacity: usize,
}

impl ContextTrace {
    pub fn new() -> Self {
        Self { bytes: SmallVec::new(), capacity: 1 }
    }

    pub(crate) fn from_parts(bytes: &[u8], capacity: usize) -> Self {
        let mut trace = Self { bytes: SmallVec::from_slice(bytes), capacity: capacity.max(1) };
        trace.bytes.truncate(trace.capacity);
        trace
    }

    /// Replace the trace with the tail of `history` (chronological order).
    pub fn capture(&mut self, history: &[u8]) {
        self.bytes.clear();
        self.bytes.extend(history.iter().rev().take(self.capacity).copied());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A node always sees at least its immediate predecessor.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.bytes.truncate(self.capacity);
    }
}

impl Default for ContextTrace {
    fn default() -> Self {
        Self::new()
    }
}
