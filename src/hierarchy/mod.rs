//! # Hierarchy Builder
//!
//! Folds stable runs of a fed sequence into abstraction nodes.
//!
//! A node's variability is the number of distinct live neighbors it has (in
//! and out, self excluded). A node whose variability exceeds its neighbors'
//! mean by more than the adaptive margin is a boundary: the sequence can go
//! many ways around it. Runs of non-boundary nodes whose internal edges have
//! recurred enough become one abstraction. Repeated runs reuse their
//! abstraction instead of creating another.
//!
//! Abstraction nodes get no transition edges. The decoder consults them only
//! through the trie (their payloads extend known paths).

use hashbrown::HashSet;
use tracing::{debug, info};

use crate::config::GraphConfig;
use crate::context;
use crate::model::*;
use crate::stats::{Channel, StatisticsTracker};
use crate::storage::GraphStore;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Consolidation {
    pub created: Vec<NodeId>,
    pub reused: Vec<NodeId>,
}

/// Distinct live neighbors of `id`, self excluded.
pub fn variability(store: &GraphStore, id: NodeId) -> usize {
    live_neighbors(store, id).len()
}

fn live_neighbors(store: &GraphStore, id: NodeId) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let own_degree = store.node(id).map_or(0, Node::out_degree);
    for edge in store.outgoing(id) {
        if edge.target != id && edge.is_live(own_degree) && seen.insert(edge.target) {
            out.push(edge.target);
        }
    }
    for edge in store.incoming(id) {
        let source_degree = store.node(edge.source).map_or(0, Node::out_degree);
        if edge.source != id && edge.is_live(source_degree) && seen.insert(edge.source) {
            out.push(edge.source);
        }
    }
    out
}

/// Variability of `id` relative to its neighbors' mean; 1.0 without neighbors.
pub fn variability_ratio(store: &GraphStore, id: NodeId) -> f32 {
    let neighbors = live_neighbors(store, id);
    if neighbors.is_empty() {
        return 1.0;
    }
    let own = neighbors.len() as f32;
    let mean = neighbors.iter().map(|n| variability(store, *n) as f32).sum::<f32>() / neighbors.len() as f32;
    if mean <= 0.0 { 1.0 } else { own / mean }
}

/// Split `sequence` into chunk ranges `[start, end)` of length >= 2.
fn chunk_ranges(
    store: &GraphStore,
    sequence: &[NodeId],
    boundary: &[bool],
    recurrence: f32,
) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    let close = |start: usize, end: usize, ranges: &mut Vec<(usize, usize)>| {
        if end >= start + 2 {
            ranges.push((start, end));
        }
    };
    for i in 0..sequence.len() {
        if boundary[i] {
            close(start, i, &mut ranges);
            start = i + 1;
            continue;
        }
        if i + 1 < sequence.len() && !boundary[i + 1] {
            let weight = store
                .find_edge(sequence[i], sequence[i + 1])
                .and_then(|e| store.edge(e))
                .map_or(0.0, |e| e.weight);
            if weight < recurrence {
                close(start, i + 1, &mut ranges);
                start = i + 1;
            }
        }
    }
    close(start, sequence.len(), &mut ranges);
    ranges
}

/// Record variability for the fed sequence and fold its stable runs.
///
/// Nothing forms while the Variability or Weight channel is bootstrapping.
pub fn consolidate(
    store: &mut GraphStore,
    stats: &mut StatisticsTracker,
    config: &GraphConfig,
    sequence: &[NodeId],
    pattern: &ActivationPattern,
    port: PortId,
) -> Result<Consolidation> {
    let mut result = Consolidation::default();
    let mut recorded = HashSet::new();
    for &id in sequence {
        if recorded.insert(id) {
            stats.record(Channel::Variability, variability(store, id) as f32);
        }
    }

    let margin_threshold = stats.threshold(Channel::Variability, config.variability_fraction);
    let recurrence_threshold = stats.threshold(Channel::Weight, config.recurrence_fraction);
    let (Some(cut), Some(recurrence)) = (margin_threshold.derived(), recurrence_threshold.derived()) else {
        debug!("hierarchy bootstrapping; no abstractions");
        return Ok(result);
    };
    let mean = stats.get(Channel::Variability).mean();
    if mean <= 0.0 {
        return Ok(result);
    }
    let margin = cut / mean - 1.0;

    let boundary: Vec<bool> = sequence
        .iter()
        .map(|id| variability_ratio(store, *id) > 1.0 + margin)
        .collect();
    let ranges = chunk_ranges(store, sequence, &boundary, recurrence);
    if ranges.is_empty() {
        return Ok(result);
    }

    let summary = context::semantic_summary(store, pattern);
    for (start, end) in ranges {
        let constituents = &sequence[start..end];
        let mut payload = Vec::new();
        let mut level = 0u32;
        for id in constituents {
            if let Some(node) = store.node(*id) {
                payload.extend_from_slice(&node.payload);
                level = level.max(node.level);
            }
        }
        if let Some(existing) = store.find_abstraction(&payload, constituents, port) {
            if let Some(h) = store.node_mut(existing).and_then(|n| n.hierarchy.as_mut()) {
                h.observe(&summary);
            }
            result.reused.push(existing);
            continue;
        }
        let component = HierarchyComponent::new(constituents.to_vec(), summary.clone());
        let id = store.insert_abstraction(&payload, level + 1, port, component)?;
        info!(node = %id, level = level + 1, len = payload.len(), "abstraction formed");
        result.created.push(id);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(store: &mut GraphStore, from: NodeId, to: NodeId, weight: f32) {
        let e = store.add_edge(from, to).unwrap();
        store.edge_mut(e).unwrap().weight = weight;
    }

    #[test]
    fn test_variability_counts_distinct_live_neighbors() {
        let mut store = GraphStore::new();
        let ids: Vec<NodeId> = b"abc".iter().map(|b| store.resolve_or_create(&[*b], 0).unwrap()).collect();
        link(&mut store, ids[0], ids[1], 0.5);
        link(&mut store, ids[1], ids[0], 0.5);
        link(&mut store, ids[1], ids[2], 0.5);
        link(&mut store, ids[1], ids[1], 0.5);
        assert_eq!(variability(&store, ids[1]), 2);
        assert_eq!(variability(&store, ids[2]), 1);

        // A timed-out edge no longer counts.
        let stale = store.find_edge(ids[1], ids[2]).unwrap();
        store.edge_mut(stale).unwrap().inactivity = 1.0;
        assert_eq!(variability(&store, ids[2]), 0);
        assert_eq!(variability_ratio(&store, ids[2]), 1.0);
    }

    #[test]
    fn test_chunk_ranges_split_on_boundaries_and_weak_edges() {
        let mut store = GraphStore::new();
        let ids: Vec<NodeId> = b"abcde".iter().map(|b| store.resolve_or_create(&[*b], 0).unwrap()).collect();
        for pair in ids.windows(2) {
            link(&mut store, pair[0], pair[1], 0.5);
        }
        let weak = store.find_edge(ids[3], ids[4]).unwrap();
        store.edge_mut(weak).unwrap().weight = 0.1;

        let none = [false; 5];
        assert_eq!(chunk_ranges(&store, &ids, &none, 0.3), vec![(0, 4)]);
        let mid = [false, false, true, false, false];
        assert_eq!(chunk_ranges(&store, &ids, &mid, 0.0), vec![(0, 2), (3, 5)]);
    }

    #[test]
    fn test_bootstrap_forms_nothing() {
        let mut store = GraphStore::new();
        let mut stats = StatisticsTracker::new(100);
        let ids: Vec<NodeId> = b"ab".iter().map(|b| store.resolve_or_create(&[*b], 0).unwrap()).collect();
        link(&mut store, ids[0], ids[1], 0.9);
        let pattern = ActivationPattern::new(0);
        let out = consolidate(&mut store, &mut stats, &GraphConfig::default(), &ids, &pattern, 0).unwrap();
        assert_eq!(out, Consolidation::default());
        assert_eq!(stats.get(Channel::Variability).count(), 2);
    }
}
