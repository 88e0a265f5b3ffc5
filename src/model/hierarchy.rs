//! Hierarchy component attached to abstraction nodes.

use serde::{Deserialize, Serialize};

use super::{NodeId, SparseVector};

/// What an abstraction node owns beyond the common [`Node`](super::Node) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyComponent {
    /// Instance nodes folded into this abstraction, in sequence order.
    pub constituents: Vec<NodeId>,
    /// Times the run was seen (creation counts as one).
    pub occurrences: u32,
    /// Running mean of the context summaries the run occurred in.
    pub prototype: SparseVector,
}

impl HierarchyComponent {
    pub fn new(constituents: Vec<NodeId>, prototype: SparseVector) -> Self {
        Self { constituents, occurrences: 1, prototype }
    }

    /// Fold one more occurrence into the aggregate.
    pub fn observe(&mut self, summary: &SparseVector) {
        self.occurrences = self.occurrences.saturating_add(1);
        let rate = 1.0 / self.occurrences as f32;
        self.prototype.blend_toward(summary, rate);
    }
}
