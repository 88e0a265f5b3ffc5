//! # Context / Attention
//!
//! Ephemeral views over an [`ActivationPattern`]:
//!
//! - [`byte_frequency`]: activation mass per byte value.
//! - [`semantic_summary`]: activation-weighted sum of node representations.
//! - [`context_view`]: one node's representation blended with its active,
//!   connected neighbors.
//!
//! None of these is cached across activations. The only cache is a node's
//! base representation, dropped whenever a traversal touches the node. Cost
//! follows the active set and its degrees, never the size of the graph; how
//! many neighbors a view examines is capped by [`neighbor_cap`].

use crate::config::GraphConfig;
use crate::model::*;
use crate::stats::{Channel, StatisticsTracker};
use crate::storage::GraphStore;

// ============================================================================
// Limits
// ============================================================================

/// How many neighbors a node may examine. `None` while the Variability
/// channel is still bootstrapping: examine all.
pub fn neighbor_cap(stats: &StatisticsTracker, config: &GraphConfig) -> Option<usize> {
    stats
        .threshold(Channel::Variability, config.neighbor_fraction)
        .derived()
        .map(|t| if t.is_finite() && t > 1.0 { t.ceil() as usize } else { 1 })
}

/// Edges touching `id`, strongest first (lowest edge index breaks ties),
/// limited to `cap`.
fn strongest_edges(store: &GraphStore, id: NodeId, cap: Option<usize>) -> Vec<&Edge> {
    let mut edges: Vec<&Edge> = store
        .outgoing(id)
        .chain(store.incoming(id))
        .filter(|e| e.source != e.target)
        .collect();
    edges.sort_by(|a, b| b.weight.total_cmp(&a.weight).then(a.id.cmp(&b.id)));
    if let Some(cap) = cap {
        edges.truncate(cap);
    }
    edges
}

fn other_end(edge: &Edge, id: NodeId) -> NodeId {
    if edge.source == id { edge.target } else { edge.source }
}

// ============================================================================
// Representations
// ============================================================================

/// Own payload bytes plus neighbor payloads, each at `w / (1 + sum w)` so
/// the node itself always dominates. Depends only on the node's own edges,
/// so it stays valid until a traversal touches the node.
pub fn base_representation(store: &GraphStore, id: NodeId) -> SparseVector {
    let Some(node) = store.node(id) else {
        return SparseVector::new();
    };
    let mut rep = SparseVector::from_payload(&node.payload);
    let edges = strongest_edges(store, id, None);
    let total: f32 = edges.iter().map(|e| e.weight).sum();
    if total > 0.0 {
        for edge in edges {
            if let Some(neighbor) = store.node(other_end(edge, id)) {
                let share = edge.weight / (1.0 + total);
                rep.add_scaled(&SparseVector::from_payload(&neighbor.payload), share);
            }
        }
    }
    rep.normalized()
}

/// Cached base representation, computed on first use after invalidation.
pub fn representation(store: &mut GraphStore, id: NodeId) -> SparseVector {
    if let Some(rep) = store.node(id).and_then(|n| n.representation.clone()) {
        return rep;
    }
    let rep = base_representation(store, id);
    if let Some(node) = store.node_mut(id) {
        node.representation = Some(rep.clone());
    }
    rep
}

// ============================================================================
// Views over an activation pattern
// ============================================================================

/// 256 bins of activation mass; each node spreads its activation evenly over
/// its payload bytes.
pub fn byte_frequency(store: &GraphStore, pattern: &ActivationPattern) -> [f32; 256] {
    let mut bins = [0.0f32; 256];
    for (id, activation) in pattern.iter() {
        let Some(node) = store.node(id) else { continue };
        if node.payload.is_empty() {
            continue;
        }
        let share = activation / node.payload.len() as f32;
        for b in &node.payload {
            bins[*b as usize] += share;
        }
    }
    bins
}

/// Activation-weighted merge of active representations, L2-normalized.
pub fn semantic_summary(store: &mut GraphStore, pattern: &ActivationPattern) -> SparseVector {
    let mut summary = SparseVector::new();
    for (id, activation) in pattern.iter() {
        let rep = representation(store, id);
        summary.add_scaled(&rep, activation);
    }
    summary.normalized()
}

/// `id`'s representation blended with connected, active neighbors weighted
/// by normalized edge strength, similarity and activation.
pub fn context_view(
    store: &mut GraphStore,
    pattern: &ActivationPattern,
    id: NodeId,
    cap: Option<usize>,
) -> SparseVector {
    let own = representation(store, id);
    let neighbors: Vec<(NodeId, f32)> = {
        let edges = strongest_edges(store, id, cap);
        let max_w = edges.iter().map(|e| e.weight).fold(0.0f32, f32::max);
        if max_w <= 0.0 {
            Vec::new()
        } else {
            edges
                .into_iter()
                .map(|e| (other_end(e, id), e.weight / max_w))
                .filter(|(n, _)| pattern.contains(*n))
                .collect()
        }
    };

    if neighbors.is_empty() {
        return own;
    }
    let mut view = own.clone();
    for (neighbor, strength) in neighbors {
        let rep = representation(store, neighbor);
        let similarity = own.cosine(&rep);
        view.add_scaled(&rep, strength * similarity * pattern.activation(neighbor));
    }
    view.normalized()
}

// ============================================================================
// Activation spreading
// ============================================================================

/// Build the working set for one feed or generation.
///
/// Seeds are driven in order. With `graded`, seed `i` of `n` gets
/// `(i + 1) / n` so later bytes dominate; otherwise every seed gets 1.0.
/// Each seed then spreads one hop along its outgoing edges with
/// `a * (w / max_w) / (1 + out_degree)`; contributions below the Activation
/// threshold are dropped (all kept while bootstrapping). Kept contributions
/// are recorded on the Activation channel.
pub fn spread_activation(
    store: &GraphStore,
    stats: &mut StatisticsTracker,
    config: &GraphConfig,
    seeds: &[NodeId],
    port: PortId,
    graded: bool,
) -> ActivationPattern {
    let mut pattern = ActivationPattern::new(port);
    let n = seeds.len();
    for (i, &seed) in seeds.iter().enumerate() {
        let a = if graded { (i + 1) as f32 / n as f32 } else { 1.0 };
        pattern.drive(seed, a);
    }

    let cutoff = stats.threshold(Channel::Activation, config.spread_fraction).derived();
    let mut accepted = Vec::new();
    for (i, &seed) in seeds.iter().enumerate() {
        let a = if graded { (i + 1) as f32 / n as f32 } else { 1.0 };
        let out: Vec<&Edge> = store.outgoing(seed).collect();
        let max_w = out.iter().map(|e| e.weight).fold(0.0f32, f32::max);
        if max_w <= 0.0 {
            continue;
        }
        let fan = 1.0 + out.len() as f32;
        for edge in out {
            let contribution = a * (edge.weight / max_w) / fan;
            if contribution <= 0.0 || cutoff.is_some_and(|c| contribution < c) {
                continue;
            }
            accepted.push((edge.target, contribution));
        }
    }
    for (target, contribution) in accepted {
        pattern.add(target, contribution);
        stats.record(Channel::Activation, contribution);
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(store: &mut GraphStore, bytes: &[u8]) -> Vec<NodeId> {
        let ids: Vec<NodeId> = bytes.iter().map(|b| store.resolve_or_create(&[*b], 0).unwrap()).collect();
        for pair in ids.windows(2) {
            let e = store.add_edge(pair[0], pair[1]).unwrap();
            store.edge_mut(e).unwrap().weight = 0.5;
        }
        ids
    }

    #[test]
    fn test_byte_frequency() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, b"ab");
        let mut pattern = ActivationPattern::new(0);
        pattern.add(ids[0], 1.0);
        pattern.add(ids[1], 0.5);
        let bins = byte_frequency(&store, &pattern);
        assert_eq!(bins[b'a' as usize], 1.0);
        assert_eq!(bins[b'b' as usize], 0.5);
        assert_eq!(bins.iter().sum::<f32>(), 1.5);
    }

    #[test]
    fn test_representation_cached_until_invalidated() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, b"ab");
        let rep = representation(&mut store, ids[0]);
        assert!(rep.get(b'a') > rep.get(b'b'));
        assert!(rep.get(b'b') > 0.0);
        assert!(store.node(ids[0]).unwrap().representation.is_some());
        store.node_mut(ids[0]).unwrap().invalidate();
        assert!(store.node(ids[0]).unwrap().representation.is_none());
    }

    #[test]
    fn test_summary_is_normalized() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, b"abc");
        let mut pattern = ActivationPattern::new(0);
        for id in &ids {
            pattern.add(*id, 1.0);
        }
        let summary = semantic_summary(&mut store, &pattern);
        assert!((summary.norm() - 1.0).abs() < 1e-5);
        assert!(semantic_summary(&mut store, &ActivationPattern::new(0)).is_empty());
    }

    #[test]
    fn test_context_view_only_uses_active_neighbors() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, b"ab");
        let idle = context_view(&mut store, &ActivationPattern::new(0), ids[0], None);
        let base = representation(&mut store, ids[0]);
        assert_eq!(idle, base);

        let mut pattern = ActivationPattern::new(0);
        pattern.add(ids[1], 1.0);
        let active = context_view(&mut store, &pattern, ids[0], None);
        assert!(active.get(b'b') > base.get(b'b'));
    }

    #[test]
    fn test_spread_one_hop() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, b"abc");
        let mut stats = StatisticsTracker::default();
        let pattern = spread_activation(&store, &mut stats, &GraphConfig::default(), &ids[..1], 0, false);
        assert_eq!(pattern.activation(ids[0]), 1.0);
        assert!((pattern.activation(ids[1]) - 0.5).abs() < 1e-6);
        assert_eq!(pattern.activation(ids[2]), 0.0);
        assert_eq!(stats.get(Channel::Activation).count(), 1);
    }

    #[test]
    fn test_graded_seeds() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, b"xy");
        let mut stats = StatisticsTracker::default();
        let pattern = spread_activation(&store, &mut stats, &GraphConfig::default(), &ids, 0, true);
        assert_eq!(pattern.sequence(), ids.as_slice());
        // y: seed 2/2 = 1.0 saturates the spread from x.
        assert_eq!(pattern.activation(ids[1]), 1.0);
        assert!((pattern.activation(ids[0]) - 0.5).abs() < 1e-6);
    }
}
