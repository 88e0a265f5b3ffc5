//! # Generation / Decode Engine
//!
//! An autoregressive walk over existing edges, exposed as an iterator of
//! output bytes so callers can stream or stop early.
//!
//! ```text
//! Seeded ──step──▶ Stepping ──step──▶ … ──▶ Stopped(reason)
//! ```
//!
//! Each step scores every outgoing edge of the frontier:
//!
//! ```text
//! (w / max_w) × ((1 + gate) / 2) × (relevance + prior) × habituation
//!     × (1 + α·similarity + β·hierarchy)
//! ```
//!
//! and commits to the best one (lowest edge index on ties). Nothing is ever
//! created while stepping; a frontier without an eligible edge stops the walk.

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::context;
use crate::model::*;
use crate::stats::Channel;
use crate::Graph;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing in the prefix resolved to a node (includes the empty graph).
    NoFrontier,
    /// The frontier has no eligible outgoing edge.
    DeadEnd,
    /// The frontier's stop-confidence reached the Confidence threshold.
    StopConfidence,
    /// The last window of output repeats the window before it.
    CycleDetected,
    /// The output-length budget is spent.
    BudgetExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::NoFrontier => "no frontier",
            StopReason::DeadEnd => "dead end",
            StopReason::StopConfidence => "stop confidence",
            StopReason::CycleDetected => "cycle detected",
            StopReason::BudgetExhausted => "budget exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Seeded,
    Stepping,
    Stopped(StopReason),
}

/// Adaptive limits fixed at seeding time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeLimits {
    /// Maximum output bytes.
    pub budget: usize,
    /// Cycle-detection window in bytes.
    pub window: usize,
    /// Stop-confidence threshold; `None` while bootstrapping (never stop on confidence).
    pub stop_threshold: Option<f32>,
}

impl DecodeLimits {
    pub fn derive(graph: &Graph, prefix_len: usize) -> Self {
        let nodes = graph.store.node_count();
        let edges = graph.store.edge_count();
        let maturity = if nodes == 0 { 1.0 } else { 1.0 + edges as f32 / nodes as f32 };

        let length = graph
            .stats
            .threshold(Channel::PathLength, graph.config.budget_fraction)
            .derived()
            .unwrap_or(nodes as f32)
            .max(0.0);
        let budget = ((prefix_len as f32 + length) * maturity).ceil();
        let budget = if budget.is_finite() { budget as usize } else { usize::MAX };

        let cycle = graph
            .stats
            .threshold(Channel::PathLength, graph.config.cycle_fraction)
            .derived()
            .unwrap_or(nodes as f32);
        let window = (cycle / 2.0).ceil();
        let window = if window.is_finite() && window > 1.0 { window as usize } else { 1 };

        let stop_threshold = graph
            .stats
            .threshold(Channel::Confidence, graph.config.stop_fraction)
            .derived();

        Self { budget, window, stop_threshold }
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Streaming decode session. Holds the graph exclusively; dropping it
/// between steps leaves the graph consistent.
pub struct Decoder<'g> {
    graph: &'g mut Graph,
    state: DecodeState,
    limits: DecodeLimits,
    frontier: Option<NodeId>,
    pattern: ActivationPattern,
    /// Prefix followed by everything emitted, chronological.
    history: Vec<u8>,
    output: Vec<u8>,
    pending: SmallVec<[u8; 8]>,
    /// Origin port targets must be compatible with.
    port_filter: Option<PortId>,
}

impl<'g> Decoder<'g> {
    pub(crate) fn new(graph: &'g mut Graph, prefix: &[u8], port: PortId, port_filter: Option<PortId>) -> Self {
        graph.generations += 1;
        graph.last_path.clear();
        let limits = DecodeLimits::derive(graph, prefix.len());

        let mut seeds = Vec::with_capacity(prefix.len());
        let mut resolving = ActivationPattern::new(port);
        let mut last = None;
        for (i, b) in prefix.iter().enumerate() {
            match graph.store.lookup(&[*b], Some(&resolving)) {
                Ok(id) => {
                    resolving.drive(id, 1.0);
                    seeds.push(id);
                    if i + 1 == prefix.len() {
                        last = Some(id);
                    }
                }
                Err(_) => trace!(byte = b, "prefix byte unseen"),
            }
        }
        let pattern =
            context::spread_activation(&graph.store, &mut graph.stats, &graph.config, &seeds, port, true);

        let state = match last {
            Some(_) => DecodeState::Seeded,
            None => DecodeState::Stopped(StopReason::NoFrontier),
        };
        debug!(
            prefix = prefix.len(),
            seeds = seeds.len(),
            budget = limits.budget,
            window = limits.window,
            ?state,
            "decode seeded"
        );
        Self {
            graph,
            state,
            limits,
            frontier: last,
            pattern,
            history: prefix.to_vec(),
            output: Vec::new(),
            pending: SmallVec::new(),
            port_filter,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            DecodeState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn limits(&self) -> DecodeLimits {
        self.limits
    }

    /// Bytes committed so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Run to completion, returning the output and why it stopped.
    pub fn finish(mut self) -> (Vec<u8>, StopReason) {
        while self.next().is_some() {}
        let reason = self.stop_reason().unwrap_or(StopReason::DeadEnd);
        (self.output, reason)
    }

    fn stop(&mut self, reason: StopReason) {
        debug!(%reason, emitted = self.output.len(), "decode stopped");
        self.state = DecodeState::Stopped(reason);
    }

    /// Longest `k` such that the last `k` history bytes followed by `byte`
    /// is a trie path of at least two bytes.
    fn hierarchy_support(&self, byte: u8) -> usize {
        let trie = self.graph.store.trie();
        let max_k = self.history.len().min(trie.longest_pattern().saturating_sub(1));
        let mut candidate: SmallVec<[u8; 16]> = SmallVec::new();
        let mut best = 0;
        for k in 1..=max_k {
            candidate.clear();
            candidate.extend_from_slice(&self.history[self.history.len() - k..]);
            candidate.push(byte);
            if trie.has_path(&candidate) {
                best = k;
            }
        }
        best
    }

    fn habituation(&self, byte: u8) -> f32 {
        let recent = &self.output[self.output.len().saturating_sub(self.limits.window)..];
        let seen = recent.iter().filter(|b| **b == byte).count();
        1.0 / (1.0 + seen as f32)
    }

    /// One STEPPING transition. Returns the emitted payload, if any.
    fn step(&mut self) -> Option<SmallVec<[u8; 8]>> {
        let frontier = self.frontier?;
        if self.output.len() >= self.limits.budget {
            self.stop(StopReason::BudgetExhausted);
            return None;
        }
        let Some(confidence) = self.graph.store.node(frontier).map(|n| n.predictor.stop_confidence()) else {
            self.stop(StopReason::DeadEnd);
            return None;
        };
        if let Some(threshold) = self.limits.stop_threshold
            && confidence >= threshold
        {
            self.stop(StopReason::StopConfidence);
            return None;
        }

        let node = self.graph.store.node_mut(frontier)?;
        let own = node.payload.len().min(self.history.len());
        node.trace.capture(&self.history[..self.history.len() - own]);
        let trace: EdgeContext = EdgeContext::from_slice(node.trace.as_slice());
        let out_degree = node.out_degree();
        let predictor = node.predictor.clone();

        let port_filter = self.port_filter;
        let store = &self.graph.store;
        let candidates: Vec<(EdgeId, NodeId, f32, f32, EdgeContext)> = store
            .outgoing(frontier)
            .filter(|e| {
                store
                    .node(e.target)
                    .is_some_and(|t| t.is_emittable() && t.port_compatible(port_filter))
            })
            .map(|e| (e.id, e.target, e.weight, e.gate, e.context.clone()))
            .collect();
        if candidates.is_empty() {
            self.stop(StopReason::DeadEnd);
            return None;
        }

        let cap = context::neighbor_cap(&self.graph.stats, &self.graph.config);
        let summary = context::semantic_summary(&mut self.graph.store, &self.pattern);
        let max_w = candidates.iter().map(|c| c.2).fold(0.0f32, f32::max);
        let prior = 1.0 / (out_degree as f32 + 1.0);
        let alpha = self.graph.config.similarity_blend;
        let beta = self.graph.config.hierarchy_blend;

        let mut best: Option<(EdgeId, NodeId, f32)> = None;
        for (edge, target, weight, gate, edge_context) in candidates {
            let weight_term = if max_w > 0.0 { weight / max_w } else { 1.0 };
            let gate_term = (1.0 + gate) / 2.0;
            let relevance = predictor.relevance(&trace, &edge_context);
            let Some(byte) = self.graph.store.node(target).and_then(Node::first_byte) else {
                continue;
            };
            let habituation = self.habituation(byte);
            let view = context::context_view(&mut self.graph.store, &self.pattern, target, cap);
            let similarity = view.cosine(&summary).max(0.0);
            let k = self.hierarchy_support(byte) as f32;
            let hierarchy = k / (k + 1.0);
            let score = weight_term
                * gate_term
                * (relevance + prior)
                * habituation
                * (1.0 + alpha * similarity + beta * hierarchy);
            trace!(%edge, %target, score, weight_term, relevance, similarity, hierarchy, "candidate");
            if best.is_none_or(|(_, _, s)| score > s) {
                best = Some((edge, target, score));
            }
        }
        let Some((edge, target, _)) = best else {
            self.stop(StopReason::DeadEnd);
            return None;
        };

        let payload = self.graph.store.node(target).map(|n| n.payload.clone()).unwrap_or_default();
        self.graph.last_path.push(edge);
        self.pattern.drive(target, 1.0);
        self.history.extend_from_slice(&payload);
        self.output.extend_from_slice(&payload);
        self.frontier = Some(target);
        self.state = DecodeState::Stepping;

        let w = self.limits.window;
        let n = self.output.len();
        if n >= 2 * w && self.output[n - w..] == self.output[n - 2 * w..n - w] {
            self.stop(StopReason::CycleDetected);
        }
        Some(SmallVec::from_slice(&payload))
    }
}

impl Iterator for Decoder<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            if matches!(self.state, DecodeState::Stopped(_)) {
                return None;
            }
            let payload = self.step()?;
            self.pending = payload;
        }
    }
}
