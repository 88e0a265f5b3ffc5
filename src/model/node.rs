//! Node in the associative graph.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{ContextTrace, EdgeId, HierarchyComponent, SparseVector};
use crate::predictor::MicroPredictor;

/// Stable arena index of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Numbered logical input port. `0` means unknown / any.
pub type PortId = u8;

/// Raw byte for level-0 nodes, concatenated bytes for abstractions.
pub type Payload = SmallVec<[u8; 8]>;

/// A vertex: one byte-level unit or one abstraction over a run of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub payload: Payload,
    /// 0 = raw, 1+ = abstraction.
    pub level: u32,
    /// Port this node was first fed on.
    pub port: PortId,
    pub outgoing: Vec<EdgeId>,
    pub incoming: Vec<EdgeId>,
    pub predictor: MicroPredictor,
    pub trace: ContextTrace,
    /// Present on abstraction nodes only.
    pub hierarchy: Option<HierarchyComponent>,
    /// Derived from payload and neighborhood; dropped on every traversal.
    #[serde(skip)]
    pub representation: Option<SparseVector>,
}

impl Node {
    pub fn new(id: NodeId, payload: &[u8], level: u32, port: PortId) -> Self {
        Self {
            id,
            payload: Payload::from_slice(payload),
            level,
            port,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            predictor: MicroPredictor::new(),
            trace: ContextTrace::new(),
            hierarchy: None,
            representation: None,
        }
    }

    pub fn with_hierarchy(mut self, hierarchy: HierarchyComponent) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    pub fn is_abstraction(&self) -> bool {
        self.hierarchy.is_some()
    }

    /// Only level-0 nodes with a payload may appear in generated output.
    pub fn is_emittable(&self) -> bool {
        self.hierarchy.is_none() && self.level == 0 && !self.payload.is_empty()
    }

    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn last_byte(&self) -> Option<u8> {
        self.payload.last().copied()
    }

    pub fn out_degree(&self) -> usize {
        self.outgoing.len()
    }

    pub fn in_degree(&self) -> usize {
        self.incoming.len()
    }

    pub fn invalidate(&mut self) {
        self.representation = None;
    }

    /// Whether a frame from `port` may surface this node.
    pub fn port_compatible(&self, port: Option<PortId>) -> bool {
        match port {
            None | Some(0) => true,
            Some(p) => self.port == 0 || self.port == p,
        }
    }
}
