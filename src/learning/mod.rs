//! # Learning / Update Engine
//!
//! Bounded reinforcement of traversed edges:
//!
//! ```text
//! weight = clamp(weight + rate * activation, floor, ceiling)
//! rate   = span * (relevance + prior) / (1 + out_degree)
//! prior  = 1 / (out_degree + 1)
//! ```
//!
//! `floor`/`ceiling` come from the Weight channel, `relevance` from the
//! source node's micro-predictor. Every traversal also updates the routing
//! gate, the inactivity timers, the generation tag and recorded context of
//! the edge, the source node's trace, and drops cached representations of
//! both endpoints.
//!
//! Two corrections ride on each traversal:
//!
//! - **Prediction error.** Before learning, the source names the edge it
//!   would have taken. A correct guess scales the reinforcement by
//!   `1 + relevance`; a wrong one moves `rate * w_predicted` (never below the
//!   floor) from the predicted edge onto the taken one.
//! - **Local decay.** Outgoing edges that have not fired this generation and
//!   sit below the source's mean weight `m` shrink by
//!   `w *= 1 - r * (1 - w / m)` with `r = var / (m + var) * m / (m + 1)`.
//!
//! [`enforce_bounds`] pulls edges the current round never touched back
//! inside bounds that have since narrowed.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::GraphConfig;
use crate::model::*;
use crate::stats::{Channel, StatisticsTracker};
use crate::storage::GraphStore;
use crate::Result;

// ============================================================================
// Bounds
// ============================================================================

/// Weight floor and ceiling for one round of updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    pub floor: f32,
    pub ceiling: f32,
    /// The Weight channel is still bootstrapping; bounds are the absolute range.
    pub bootstrap: bool,
}

impl WeightBounds {
    pub const ABSOLUTE: WeightBounds =
        WeightBounds { floor: WEIGHT_MIN, ceiling: WEIGHT_MAX, bootstrap: true };

    pub fn from_stats(stats: &StatisticsTracker, config: &GraphConfig) -> Self {
        let low = stats.threshold(Channel::Weight, -config.bounds_fraction);
        let high = stats.threshold(Channel::Weight, config.bounds_fraction);
        let (Some(low), Some(high)) = (low.derived(), high.derived()) else {
            return Self::ABSOLUTE;
        };
        let floor = low.clamp(WEIGHT_MIN, WEIGHT_MAX);
        let ceiling = (high + (WEIGHT_MAX - high) * config.ceiling_headroom).clamp(floor, WEIGHT_MAX);
        Self { floor, ceiling, bootstrap: false }
    }

    pub fn span(&self) -> f32 {
        self.ceiling - self.floor
    }

    pub fn clamp(&self, weight: f32) -> f32 {
        weight.clamp(self.floor, self.ceiling)
    }

    pub fn contains(&self, weight: f32) -> bool {
        weight >= self.floor && weight <= self.ceiling
    }

    /// Whether every weight inside `other` is also inside `self`.
    pub fn covers(&self, other: &WeightBounds) -> bool {
        self.floor <= other.floor && self.ceiling >= other.ceiling
    }

    /// Smallest bounds containing both.
    pub fn hull(&self, other: &WeightBounds) -> WeightBounds {
        WeightBounds {
            floor: self.floor.min(other.floor),
            ceiling: self.ceiling.max(other.ceiling),
            bootstrap: self.bootstrap || other.bootstrap,
        }
    }
}

/// Clamp every edge into `bounds`. Returns how many edges moved.
pub fn enforce_bounds(store: &mut GraphStore, bounds: &WeightBounds) -> usize {
    let moved = store.adjust_weights(|w| bounds.clamp(w));
    if moved > 0 {
        debug!(moved, floor = bounds.floor, ceiling = bounds.ceiling, "clamped stale weights");
    }
    moved
}

/// `span * (relevance + prior) / (1 + out_degree)`.
pub fn learning_rate(bounds: &WeightBounds, relevance: f32, out_degree: usize) -> f32 {
    let d = out_degree as f32;
    let prior = 1.0 / (d + 1.0);
    bounds.span() * (relevance + prior) / (1.0 + d)
}

fn reinforce(edge: &mut Edge, bounds: &WeightBounds, delta: f32, stats: &mut StatisticsTracker) {
    edge.weight = bounds.clamp(edge.weight + delta);
    stats.record(Channel::Weight, edge.weight);
}

// ============================================================================
// Training
// ============================================================================

/// What one training pass touched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainingOutcome {
    pub traversals: usize,
    pub edges_created: usize,
}

/// Traverse `sequence` once, reinforcing every consecutive edge.
///
/// `history` holds the bytes the sequence was built from, chronological;
/// `offsets[i]` is where node `i`'s payload starts in it.
pub fn train_sequence(
    store: &mut GraphStore,
    stats: &mut StatisticsTracker,
    sequence: &[NodeId],
    offsets: &[usize],
    history: &[u8],
    pattern: &ActivationPattern,
    bounds: &WeightBounds,
    generation: u32,
) -> Result<TrainingOutcome> {
    let mut outcome = TrainingOutcome::default();
    for (i, pair) in sequence.windows(2).enumerate() {
        let (u, v) = (pair[0], pair[1]);
        let before = &history[..offsets[i].min(history.len())];
        let edges_before = store.edge_count();
        let edge = store.add_edge(u, v)?;
        if store.edge_count() > edges_before {
            outcome.edges_created += 1;
        }
        traverse(store, stats, u, v, edge, before, pattern.activation(v).max(f32::EPSILON), bounds, generation);
        outcome.traversals += 1;
    }

    let n = sequence.len();
    for (i, &id) in sequence.iter().enumerate() {
        if let Some(node) = store.node_mut(id) {
            node.predictor.observe_stop(i + 1 == n);
        }
    }
    if let Some(end) = sequence.last().and_then(|id| store.node(*id)) {
        stats.record(Channel::Confidence, end.predictor.stop_confidence());
    }
    stats.record(Channel::PathLength, history.len() as f32);
    debug!(traversals = outcome.traversals, created = outcome.edges_created, floor = bounds.floor, ceiling = bounds.ceiling, "trained sequence");
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn traverse(
    store: &mut GraphStore,
    stats: &mut StatisticsTracker,
    u: NodeId,
    v: NodeId,
    taken: EdgeId,
    history: &[u8],
    activation: f32,
    bounds: &WeightBounds,
    generation: u32,
) {
    let Some(source) = store.node_mut(u) else { return };
    source.trace.capture(history);
    let trace: EdgeContext = EdgeContext::from_slice(source.trace.as_slice());
    let outgoing = source.outgoing.clone();
    let out_degree = outgoing.len();

    let taken_context: EdgeContext = store.edge(taken).map(|e| e.context.clone()).unwrap_or_default();
    let sibling_contexts: Vec<EdgeContext> = outgoing
        .iter()
        .filter(|e| **e != taken)
        .filter_map(|e| store.edge(*e).map(|e| e.context.clone()))
        .collect();
    let sibling_refs: Vec<&[u8]> = sibling_contexts.iter().map(|c| c.as_slice()).collect();
    let predicted = predict(store, u, &trace);

    let Some(source) = store.node_mut(u) else { return };
    let relevance = source.predictor.relevance(&trace, &taken_context);
    stats.record(Channel::Error, 1.0 - relevance);
    source.predictor.observe_transition(history, &trace, &taken_context, &sibling_refs);
    let departures = source.predictor.record_departure() as f32;
    let need = source.predictor.history_need();
    source.trace.set_capacity(need);
    source.predictor.ensure_depth(need);
    source.invalidate();

    let rate = learning_rate(bounds, relevance, out_degree);
    let mut touched: SmallVec<[NodeId; 8]> = SmallVec::new();
    touched.push(v);
    let mut boost = 1.0;
    let mut shifted = 0.0;
    match predicted {
        Some(id) if id == taken => boost += relevance,
        Some(id) => {
            if let Some(edge) = store.edge_mut(id) {
                shifted = (rate * edge.weight).min((edge.weight - bounds.floor).max(0.0));
                edge.weight = bounds.clamp(edge.weight - shifted);
                touched.push(edge.target);
                trace!(edge = %id, weight = edge.weight, shifted, "mispredicted");
            }
        }
        None => {}
    }

    for &id in &outgoing {
        let Some(edge) = store.edge_mut(id) else { continue };
        if id == taken {
            reinforce(edge, bounds, rate * activation * boost + shifted, stats);
            edge.gate += (1.0 - edge.gate) / departures;
            edge.inactivity = 0.0;
            edge.generation = generation;
            edge.record_context(&trace);
            trace!(edge = %id, weight = edge.weight, relevance, rate, boost, "reinforce");
        } else {
            edge.gate -= edge.gate / departures;
            edge.inactivity += (1.0 - edge.inactivity) / (out_degree as f32 + 1.0);
        }
        edge.gate = edge.gate.clamp(0.0, 1.0);
    }
    decay_unused(store, &outgoing, generation, bounds, &mut touched);

    for id in touched {
        if let Some(node) = store.node_mut(id) {
            node.invalidate();
        }
    }
}

/// The edge `u` would take under `trace`: highest
/// `weight * (relevance + prior)`, lowest id on ties. `None` while every
/// outgoing weight is zero.
fn predict(store: &GraphStore, u: NodeId, trace: &[u8]) -> Option<EdgeId> {
    let source = store.node(u)?;
    let prior = 1.0 / (source.out_degree() as f32 + 1.0);
    let mut best: Option<(EdgeId, f32)> = None;
    for edge in store.outgoing(u) {
        let score = edge.weight * (source.predictor.relevance(trace, &edge.context) + prior);
        if score > 0.0 && best.is_none_or(|(_, top)| score > top) {
            best = Some((edge.id, score));
        }
    }
    best.map(|(id, _)| id)
}

/// Shrink the weaker-than-average edges among `outgoing` that have not
/// fired in `generation`.
fn decay_unused(
    store: &mut GraphStore,
    outgoing: &[EdgeId],
    generation: u32,
    bounds: &WeightBounds,
    touched: &mut SmallVec<[NodeId; 8]>,
) {
    let weights: SmallVec<[f32; 8]> = outgoing.iter().filter_map(|id| store.edge(*id)).map(|e| e.weight).collect();
    if weights.is_empty() {
        return;
    }
    let n = weights.len() as f32;
    let mean = weights.iter().sum::<f32>() / n;
    if mean <= f32::EPSILON {
        return;
    }
    let variance = weights.iter().map(|w| (w - mean).powi(2)).sum::<f32>() / n;
    let rate = variance / (mean + variance + f32::EPSILON) * (mean / (mean + 1.0));

    for &id in outgoing {
        let Some(edge) = store.edge_mut(id) else { continue };
        let relative = edge.weight / mean;
        if edge.generation == generation || relative >= 1.0 {
            continue;
        }
        edge.weight = bounds.clamp(edge.weight * (1.0 - rate * (1.0 - relative)));
        touched.push(edge.target);
    }
}

/// Extra reinforcement for edges that already exist along `sequence`.
/// Missing edges are skipped, never created.
pub fn strengthen_path(
    store: &mut GraphStore,
    stats: &mut StatisticsTracker,
    sequence: &[NodeId],
    bounds: &WeightBounds,
) -> usize {
    let mut touched = 0;
    for pair in sequence.windows(2) {
        let Some(id) = store.find_edge(pair[0], pair[1]) else { continue };
        let Some(source) = store.node(pair[0]) else { continue };
        let out_degree = source.out_degree();
        let relevance = store
            .edge(id)
            .map(|e| source.predictor.relevance(source.trace.as_slice(), &e.context))
            .unwrap_or(crate::predictor::NEUTRAL_RELEVANCE);
        let rate = learning_rate(bounds, relevance, out_degree);
        if let Some(edge) = store.edge_mut(id) {
            reinforce(edge, bounds, rate, stats);
            touched += 1;
        }
        for end in [pair[0], pair[1]] {
            if let Some(node) = store.node_mut(end) {
                node.invalidate();
            }
        }
    }
    touched
}

// ============================================================================
// Error feedback
// ============================================================================

/// Positional match ratio over the longer length.
///
/// Exact equality scores 1.0. An empty expectation is neutral (0.5). An empty
/// output scores 1.0 only when nothing was expected.
pub fn compare_output(output: &[u8], expected: &[u8]) -> f32 {
    if output == expected {
        return 1.0;
    }
    if output.is_empty() {
        return 0.0;
    }
    if expected.is_empty() {
        return 0.5;
    }
    let longest = output.len().max(expected.len());
    let matches = output.iter().zip(expected).filter(|(a, b)| a == b).count();
    matches as f32 / longest as f32
}

/// Apply an external score in `[0, 1]` to the edges of the last output path.
///
/// Above 0.5 strengthens, below weakens, in proportion to the distance from
/// 0.5. Edges that are already strong relative to their source's mean
/// outgoing weight move less.
pub fn apply_feedback(
    store: &mut GraphStore,
    stats: &mut StatisticsTracker,
    path: &[EdgeId],
    signal: f32,
    bounds: &WeightBounds,
) -> usize {
    let signal = if signal.is_finite() { signal.clamp(0.0, 1.0) } else { 0.5 };
    stats.record(Channel::Error, 1.0 - signal);
    let strength = (signal - 0.5).abs() * 2.0;
    let direction = if signal >= 0.5 { 1.0 } else { -1.0 };
    if strength <= 0.0 {
        return 0;
    }

    let mut touched = 0;
    for &id in path {
        let Some(source) = store.edge(id).map(|e| e.source) else { continue };
        let mean = store.mean_out_weight(source);
        let out_degree = store.node(source).map_or(0, Node::out_degree);
        let Some(edge) = store.edge_mut(id) else { continue };
        let relative = if mean > 0.0 { edge.weight / mean } else { 1.0 };
        let rate = bounds.span() / (1.0 + relative) * strength;
        edge.weight = bounds.clamp(edge.weight + direction * rate);
        let gate_target = if direction > 0.0 { 1.0 } else { 0.0 };
        edge.gate += (gate_target - edge.gate) * strength / (1.0 + out_degree as f32);
        edge.gate = edge.gate.clamp(0.0, 1.0);
        stats.record(Channel::Weight, edge.weight);
        let target = edge.target;
        for end in [source, target] {
            if let Some(node) = store.node_mut(end) {
                node.invalidate();
            }
        }
        touched += 1;
    }
    debug!(signal, touched, "applied feedback");
    touched
}
