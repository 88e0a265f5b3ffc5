//! Edge: the only legal transition between nodes.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::NodeId;

/// Stable arena index of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

impl EdgeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Lower end of the representable weight range.
pub const WEIGHT_MIN: f32 = 0.0;
/// Upper end of the representable weight range.
pub const WEIGHT_MAX: f32 = 1.0;

/// Bytes that preceded the source node when this edge last fired,
/// most recent first.
pub type EdgeContext = SmallVec<[u8; 4]>;

/// Longest context an edge keeps; its persisted length is one byte.
pub const MAX_EDGE_CONTEXT: usize = u8::MAX as usize;

/// A directed, weighted connection `source -> target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    /// Always within `[WEIGHT_MIN, WEIGHT_MAX]`.
    pub weight: f32,
    /// Running share of the source's departures taken through this edge.
    pub gate: f32,
    /// Rises toward 1 while siblings are taken instead; reset on traversal.
    pub inactivity: f32,
    /// Traversal generation this edge last fired in.
    pub generation: u32,
    pub context: EdgeContext,
}

impl Edge {
    pub fn new(id: EdgeId, source: NodeId, target: NodeId) -> Self {
        Self {
            id,
            source,
            target,
            weight: WEIGHT_MIN,
            gate: 0.0,
            inactivity: 0.0,
            generation: 0,
            context: EdgeContext::new(),
        }
    }

    /// Keep the most recent [`MAX_EDGE_CONTEXT`] bytes of `trace`.
    pub fn record_context(&mut self, trace: &[u8]) {
        self.context.clear();
        self.context.extend_from_slice(&trace[..trace.len().min(MAX_EDGE_CONTEXT)]);
    }

    /// Length of the recorded context; the persisted auxiliary byte.
    pub fn aux_byte(&self) -> u8 {
        u8::try_from(self.context.len()).unwrap_or(u8::MAX)
    }

    /// Live while the inactivity timer stays below the source's own cutoff
    /// `d / (d + 1)` for out-degree `d`.
    pub fn is_live(&self, source_out_degree: usize) -> bool {
        let d = source_out_degree as f32;
        self.inactivity < d / (d + 1.0)
    }
}
