//! ActivationPattern: the ephemeral working set of one input or generation.

use hashbrown::HashMap;

use super::{NodeId, PortId};

/// Currently active nodes with activation strengths in `(0, 1]`.
///
/// Built per feed or per generation, never persisted. Entries keep insertion
/// order so every reduction over the pattern is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ActivationPattern {
    entries: Vec<(NodeId, f32)>,
    index: HashMap<NodeId, usize>,
    /// Nodes in the order they were driven (inputs, then emitted outputs).
    sequence: Vec<NodeId>,
    port: PortId,
}

impl ActivationPattern {
    pub fn new(port: PortId) -> Self {
        Self { port, ..Self::default() }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    /// Add activation to `node`; repeated hits saturate toward 1.
    pub fn add(&mut self, node: NodeId, activation: f32) {
        let activation = activation.clamp(0.0, 1.0);
        if activation <= 0.0 {
            return;
        }
        match self.index.get(&node) {
            Some(&i) => {
                let current = self.entries[i].1;
                self.entries[i].1 = 1.0 - (1.0 - current) * (1.0 - activation);
            }
            None => {
                self.index.insert(node, self.entries.len());
                self.entries.push((node, activation));
            }
        }
    }

    /// Record `node` as driven in sequence and activate it.
    pub fn drive(&mut self, node: NodeId, activation: f32) {
        self.sequence.push(node);
        self.add(node, activation);
    }

    pub fn activation(&self, node: NodeId) -> f32 {
        self.index.get(&node).map_or(0.0, |&i| self.entries[i].1)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.index.contains_key(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, f32)> + '_ {
        self.entries.iter().copied()
    }

    pub fn sequence(&self) -> &[NodeId] {
        &self.sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> f32 {
        self.entries.iter().map(|(_, a)| a).sum()
    }
}
