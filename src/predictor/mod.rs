//! # Node Micro-Predictor
//!
//! A handful of scalars per node. Depth weights score how much each position
//! of the node's context trace matters when telling its outgoing edges apart;
//! the stop weight estimates how often a sequence ends here.
//!
//! Everything starts neutral (depth weights 1.0, stop weight 0.0) and moves
//! only from local evidence: which edge was actually taken versus which
//! siblings would have matched the trace.

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::stats::RunningStatistic;

/// Relevance reported when there is no overlapping evidence.
pub const NEUTRAL_RELEVANCE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroPredictor {
    depth_weights: SmallVec<[f32; 4]>,
    stop_weight: f32,
    visits: u32,
    departures: u32,
    /// History bytes that were needed to separate the taken edge from its siblings.
    need: RunningStatistic,
}

impl MicroPredictor {
    pub fn new() -> Self {
        Self {
            depth_weights: smallvec![1.0],
            stop_weight: 0.0,
            visits: 0,
            departures: 0,
            need: RunningStatistic::new(),
        }
    }

    pub(crate) fn from_parts(
        depth_weights: &[f32],
        stop_weight: f32,
        visits: u32,
        departures: u32,
        need: RunningStatistic,
    ) -> Self {
        let mut p = Self {
            depth_weights: SmallVec::from_slice(depth_weights),
            stop_weight: stop_weight.clamp(0.0, 1.0),
            visits,
            departures,
            need,
        };
        if p.depth_weights.is_empty() {
            p.depth_weights.push(1.0);
        }
        p
    }

    pub fn depth_weights(&self) -> &[f32] {
        &self.depth_weights
    }

    pub fn visits(&self) -> u32 {
        self.visits
    }

    pub fn departures(&self) -> u32 {
        self.departures
    }

    pub fn need(&self) -> &RunningStatistic {
        &self.need
    }

    /// Continuous score in `[0, 1]`: depth-weighted agreement between the
    /// node's current trace and the context recorded on an edge.
    pub fn relevance(&self, trace: &[u8], edge_context: &[u8]) -> f32 {
        let n = trace.len().min(edge_context.len()).min(self.depth_weights.len());
        if n == 0 {
            return NEUTRAL_RELEVANCE;
        }
        let mut agree = 0.0f32;
        let mut total = 0.0f32;
        for k in 0..n {
            let w = self.depth_weights[k];
            total += w;
            if trace[k] == edge_context[k] {
                agree += w;
            }
        }
        if total <= f32::EPSILON {
            return NEUTRAL_RELEVANCE;
        }
        (agree / total).clamp(0.0, 1.0)
    }

    pub fn stop_confidence(&self) -> f32 {
        self.stop_weight
    }

    /// One visit during training: `is_end` when the sequence ended here.
    pub fn observe_stop(&mut self, is_end: bool) {
        self.visits = self.visits.saturating_add(1);
        let target = if is_end { 1.0 } else { 0.0 };
        self.stop_weight += (target - self.stop_weight) / self.visits as f32;
        self.stop_weight = self.stop_weight.clamp(0.0, 1.0);
    }

    /// Learn from one departure through `taken_context`.
    ///
    /// `history` is chronological (oldest first); `trace` is the node's trace
    /// captured from it (most recent first). Sibling contexts are the
    /// recorded contexts of the other outgoing edges.
    pub fn observe_transition(
        &mut self,
        history: &[u8],
        trace: &[u8],
        taken_context: &[u8],
        sibling_contexts: &[&[u8]],
    ) {
        let lr = 1.0 / (self.departures as f32 + 1.0);
        let depth = trace.len().min(self.depth_weights.len());
        for k in 0..depth {
            let taken_agrees = taken_context.get(k) == Some(&trace[k]);
            let sibling_agrees = sibling_contexts.iter().any(|c| c.get(k) == Some(&trace[k]));
            let w = &mut self.depth_weights[k];
            if taken_agrees && !sibling_agrees {
                *w += lr * (1.0 - *w);
            } else if sibling_agrees && !taken_agrees {
                *w -= lr * *w;
            }
            *w = w.clamp(0.0, 1.0);
        }

        let need = sibling_contexts
            .iter()
            .map(|c| disambiguation_depth(history, c))
            .max()
            .unwrap_or(0);
        self.need.record(need as f32);
    }

    pub(crate) fn record_departure(&mut self) -> u32 {
        self.departures = self.departures.saturating_add(1);
        self.departures
    }

    /// Trace length the predictor currently asks for: `ceil(mean + stddev)`, at least 1.
    pub fn history_need(&self) -> usize {
        if self.need.count() == 0 {
            return 1;
        }
        let estimate = (self.need.mean() + self.need.stddev()).ceil();
        if estimate.is_finite() && estimate > 1.0 { estimate as usize } else { 1 }
    }

    /// Grow depth weights (neutral) to cover a trace of `capacity` bytes.
    pub fn ensure_depth(&mut self, capacity: usize) {
        while self.depth_weights.len() < capacity {
            self.depth_weights.push(1.0);
        }
    }
}

impl Default for MicroPredictor {
    fn default() -> Self {
        Self::new()
    }
}

/// History bytes needed before `sibling_context` stops matching the history
/// read backwards.
fn disambiguation_depth(history: &[u8], sibling_context: &[u8]) -> usize {
    let shared = history.len().min(sibling_context.len());
    history
        .iter()
        .rev()
        .zip(sibling_context.iter())
        .position(|(h, s)| h != s)
        .map_or(shared + 1, |i| i + 1)
}
