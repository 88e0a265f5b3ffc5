//! # Graph Store
//!
//! Owns every node and edge of one graph in two arenas addressed by stable
//! indices, plus the multi-terminal trie (payload -> nodes) and the ordered
//! pair index that keeps edges unique per `(source, target)`.
//!
//! Nodes and edges are never removed individually; a graph is torn down as a
//! whole. Every mutating entry point reserves what it needs first and returns
//! [`Error::AllocationFailure`] before touching anything.

pub mod trie;

use hashbrown::{HashMap, HashSet};
use tracing::trace;

use crate::model::*;
use crate::{Error, Result};

pub use trie::{MultiTerminalTrie, Terminals};

// ============================================================================
// GraphStore
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    trie: MultiTerminalTrie,
    /// (source, target) -> edge
    pair_index: HashMap<(NodeId, NodeId), EdgeId>,
}

fn alloc_err(what: &str, err: impl std::fmt::Debug) -> Error {
    Error::AllocationFailure(format!("{what}: {err:?}"))
}

/// Ids are `u32`; fails when `len + additional` entries would not fit.
fn check_id_space(len: usize, additional: usize, what: &str) -> Result<()> {
    u32::try_from(len.saturating_add(additional))
        .map(|_| ())
        .map_err(|_| Error::AllocationFailure(format!("{what} index space exhausted")))
}

fn node_id(index: usize) -> Result<NodeId> {
    u32::try_from(index)
        .map(NodeId)
        .map_err(|_| Error::AllocationFailure("node index space exhausted".into()))
}

/// A byte sequence resolved against a store, holding the nodes its unseen
/// bytes will create.
#[derive(Debug, Clone)]
pub struct StagedSequence {
    pub sequence: Vec<NodeId>,
    fresh: Vec<Node>,
}

impl StagedSequence {
    /// Nodes committing this staging would add.
    pub fn fresh_count(&self) -> usize {
        self.fresh.len()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index())
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.index())
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut Edge> {
        self.edges.get_mut(id.index())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn trie(&self) -> &MultiTerminalTrie {
        &self.trie
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.node(id)
            .into_iter()
            .flat_map(|n| n.outgoing.iter())
            .filter_map(|e| self.edge(*e))
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.node(id)
            .into_iter()
            .flat_map(|n| n.incoming.iter())
            .filter_map(|e| self.edge(*e))
    }

    pub fn hierarchy_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(|n| n.is_abstraction())
    }

    /// Mean outgoing weight of `id`; zero without outgoing edges.
    pub fn mean_out_weight(&self, id: NodeId) -> f32 {
        let (sum, n) = self.outgoing(id).fold((0.0f32, 0usize), |(s, n), e| (s + e.weight, n + 1));
        if n == 0 { 0.0 } else { sum / n as f32 }
    }

    // ========================================================================
    // Capacity
    // ========================================================================

    /// Reserve room for `nodes` new nodes (needing up to `trie_slots` new
    /// trie slots in total) and `edges` new edges.
    pub fn reserve(&mut self, nodes: usize, edges: usize, trie_slots: usize) -> Result<()> {
        check_id_space(self.nodes.len(), nodes, "node")?;
        check_id_space(self.edges.len(), edges, "edge")?;
        self.nodes.try_reserve(nodes).map_err(|e| alloc_err("node arena", e))?;
        self.edges.try_reserve(edges).map_err(|e| alloc_err("edge arena", e))?;
        self.pair_index.try_reserve(edges).map_err(|e| alloc_err("pair index", e))?;
        self.trie.try_reserve(trie_slots, nodes)?;
        Ok(())
    }

    /// Resolve `bytes` to single-byte nodes without touching the store.
    ///
    /// Known bytes resolve through [`GraphStore::lookup`] with the bytes
    /// resolved so far as context; unseen bytes get nodes that exist only in
    /// the returned staging until [`GraphStore::commit_sequence`].
    pub fn stage_sequence(&self, bytes: &[u8], port: PortId) -> Result<StagedSequence> {
        let mut resolving = ActivationPattern::new(port);
        let mut staged = StagedSequence { sequence: Vec::with_capacity(bytes.len()), fresh: Vec::new() };
        for b in bytes {
            let id = match self.lookup(&[*b], Some(&resolving)) {
                Ok(id) => id,
                Err(Error::LookupMiss(_)) => match staged.fresh.iter().find(|n| n.payload[..] == [*b]) {
                    Some(node) => node.id,
                    None => {
                        let id = node_id(self.nodes.len() + staged.fresh.len())?;
                        staged.fresh.push(Node::new(id, &[*b], 0, port));
                        id
                    }
                },
                Err(e) => return Err(e),
            };
            resolving.drive(id, 1.0);
            staged.sequence.push(id);
        }
        Ok(staged)
    }

    /// Reserve everything training `staged` can add: its fresh nodes, one
    /// edge per new consecutive pair with adjacency on both ends, and
    /// `abstractions` further nodes spanning up to `abstraction_bytes`.
    pub fn reserve_sequence(
        &mut self,
        staged: &mut StagedSequence,
        abstractions: usize,
        abstraction_bytes: usize,
    ) -> Result<()> {
        let mut degrees: HashMap<NodeId, (usize, usize)> = HashMap::new();
        let mut pairs: HashSet<(NodeId, NodeId)> = HashSet::new();
        for pair in staged.sequence.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if self.pair_index.contains_key(&(from, to)) || !pairs.insert((from, to)) {
                continue;
            }
            degrees.entry(from).or_default().0 += 1;
            degrees.entry(to).or_default().1 += 1;
        }

        let fresh = staged.fresh.len();
        self.reserve(fresh + abstractions, pairs.len(), fresh + abstraction_bytes)?;
        let first_fresh = self.nodes.len();
        for (id, (out, inc)) in degrees {
            let node = match id.index().checked_sub(first_fresh) {
                Some(i) => &mut staged.fresh[i],
                None => &mut self.nodes[id.index()],
            };
            node.outgoing.try_reserve(out).map_err(|e| alloc_err("adjacency", e))?;
            node.incoming.try_reserve(inc).map_err(|e| alloc_err("adjacency", e))?;
        }
        Ok(())
    }

    /// Move the staged nodes into the store and hand back the resolved
    /// sequence. Cannot fail once [`GraphStore::reserve_sequence`] succeeded.
    pub fn commit_sequence(&mut self, staged: StagedSequence) -> Result<Vec<NodeId>> {
        for node in staged.fresh {
            trace!(node = %node.id, port = node.port, "create node");
            self.push_node(node)?;
        }
        Ok(staged.sequence)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    fn push_node(&mut self, node: Node) -> Result<NodeId> {
        self.reserve(1, 0, self.trie.missing_slots(&node.payload))?;
        let id = node.id;
        self.trie.insert(&node.payload, id);
        self.nodes.push(node);
        Ok(id)
    }

    fn next_node_id(&self) -> Result<NodeId> {
        node_id(self.nodes.len())
    }

    /// Canonical terminal for `payload`, created on first occurrence.
    pub fn resolve_or_create(&mut self, payload: &[u8], port: PortId) -> Result<NodeId> {
        if let Some(id) = self.trie.canonical(payload) {
            return Ok(id);
        }
        let id = self.next_node_id()?;
        trace!(node = %id, len = payload.len(), port, "create node");
        self.push_node(Node::new(id, payload, 0, port))
    }

    /// Always appends a new terminal, even when the payload is already known.
    pub fn insert_pattern(&mut self, payload: &[u8], level: u32, port: PortId) -> Result<NodeId> {
        let id = self.next_node_id()?;
        self.push_node(Node::new(id, payload, level, port))
    }

    pub fn insert_abstraction(
        &mut self,
        payload: &[u8],
        level: u32,
        port: PortId,
        hierarchy: HierarchyComponent,
    ) -> Result<NodeId> {
        let id = self.next_node_id()?;
        self.push_node(Node::new(id, payload, level, port).with_hierarchy(hierarchy))
    }

    /// Existing abstraction over exactly `constituents` from `port`.
    pub fn find_abstraction(&self, payload: &[u8], constituents: &[NodeId], port: PortId) -> Option<NodeId> {
        self.trie.terminals(payload).find(|id| {
            self.node(*id).is_some_and(|n| {
                n.port == port
                    && n.hierarchy.as_ref().is_some_and(|h| h.constituents == constituents)
            })
        })
    }

    pub fn terminals(&self, payload: &[u8]) -> Vec<NodeId> {
        self.trie.terminals(payload).collect()
    }

    /// Resolve `payload` to one terminal.
    ///
    /// With `context`, each terminal is scored by the weight of its edges to
    /// currently active nodes (times their activation), plus one for a port
    /// match, scaled by `1 + level`; the first inserted wins ties. Without
    /// context the canonical terminal is returned.
    pub fn lookup(&self, payload: &[u8], context: Option<&ActivationPattern>) -> Result<NodeId> {
        let mut terminals = self.trie.terminals(payload);
        let Some(first) = terminals.next() else {
            return Err(Error::LookupMiss(format!("{payload:?}")));
        };
        let Some(context) = context else {
            return Ok(first);
        };

        let mut best = first;
        let mut best_score = self.context_score(first, context);
        for id in terminals {
            let score = self.context_score(id, context);
            if score > best_score {
                best = id;
                best_score = score;
            }
        }
        Ok(best)
    }

    fn context_score(&self, id: NodeId, context: &ActivationPattern) -> f32 {
        let Some(node) = self.node(id) else { return f32::NEG_INFINITY };
        let out: f32 = self.outgoing(id).map(|e| e.weight * context.activation(e.target)).sum();
        let inc: f32 = self.incoming(id).map(|e| e.weight * context.activation(e.source)).sum();
        let port_match = if context.port() != 0 && node.port == context.port() { 1.0 } else { 0.0 };
        (out + inc + port_match) * (1.0 + node.level as f32)
    }

    // ========================================================================
    // Edges
    // ========================================================================

    pub fn find_edge(&self, from: NodeId, to: NodeId) -> Option<EdgeId> {
        self.pair_index.get(&(from, to)).copied()
    }

    /// Existing edge for the ordered pair, or a new one at the minimum weight.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<EdgeId> {
        if let Some(id) = self.find_edge(from, to) {
            return Ok(id);
        }
        if self.node(from).is_none() || self.node(to).is_none() {
            return Err(Error::LookupMiss(format!("edge endpoint {from} -> {to}")));
        }
        self.reserve(0, 1, 0)?;
        let id = EdgeId(self.edges.len() as u32);
        self.nodes[from.index()].outgoing.try_reserve(1).map_err(|e| alloc_err("adjacency", e))?;
        self.nodes[to.index()].incoming.try_reserve(1).map_err(|e| alloc_err("adjacency", e))?;

        self.edges.push(Edge::new(id, from, to));
        self.pair_index.insert((from, to), id);
        self.nodes[from.index()].outgoing.push(id);
        self.nodes[to.index()].incoming.push(id);
        trace!(edge = %id, %from, %to, "create edge");
        Ok(id)
    }

    /// Apply `adjust` to every edge weight. Endpoints of edges that change
    /// drop their cached representations. Returns how many edges changed.
    pub fn adjust_weights(&mut self, mut adjust: impl FnMut(f32) -> f32) -> usize {
        let mut changed = 0;
        for edge in &mut self.edges {
            let weight = adjust(edge.weight);
            if weight == edge.weight {
                continue;
            }
            edge.weight = weight;
            changed += 1;
            for end in [edge.source, edge.target] {
                if let Some(node) = self.nodes.get_mut(end.index()) {
                    node.invalidate();
                }
            }
        }
        changed
    }

    // ========================================================================
    // Rebuild
    // ========================================================================

    /// Rebuild a store from persisted arenas. Adjacency, trie and pair index
    /// are derived in index order; any inconsistency is rejected.
    pub(crate) fn from_parts(mut nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        let malformed = |msg: String| Error::MalformedPersistedFile(msg);
        let n = nodes.len();
        for (i, node) in nodes.iter_mut().enumerate() {
            if node.id.index() != i {
                return Err(malformed(format!("node {i} carries id {}", node.id)));
            }
            if let Some(h) = &node.hierarchy {
                if let Some(bad) = h.constituents.iter().find(|c| c.index() >= n) {
                    return Err(malformed(format!("node {i} references missing constituent {bad}")));
                }
            }
            node.outgoing.clear();
            node.incoming.clear();
            node.representation = None;
        }

        let mut store = Self::new();
        store.reserve(n, edges.len(), 0)?;
        for (i, edge) in edges.iter().enumerate() {
            if edge.id.index() != i {
                return Err(malformed(format!("edge {i} carries id {}", edge.id)));
            }
            if edge.source.index() >= n || edge.target.index() >= n {
                return Err(malformed(format!("edge {i} points outside the node arena")));
            }
            if store.pair_index.insert((edge.source, edge.target), edge.id).is_some() {
                return Err(malformed(format!("duplicate edge {} -> {}", edge.source, edge.target)));
            }
            nodes[edge.source.index()].outgoing.push(edge.id);
            nodes[edge.target.index()].incoming.push(edge.id);
        }
        for node in &nodes {
            let slots = store.trie.missing_slots(&node.payload);
            store.trie.try_reserve(slots, 1)?;
            store.trie.insert(&node.payload, node.id);
        }
        store.nodes = nodes;
        store.edges = edges;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_or_create_is_idempotent() {
        let mut store = GraphStore::new();
        let a = store.resolve_or_create(b"a", 0).unwrap();
        let again = store.resolve_or_create(b"a", 5).unwrap();
        assert_eq!(a, again);
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn test_add_edge_no_parallel_duplicates() {
        let mut store = GraphStore::new();
        let a = store.resolve_or_create(b"a", 0).unwrap();
        let b = store.resolve_or_create(b"b", 0).unwrap();
        let e1 = store.add_edge(a, b).unwrap();
        let e2 = store.add_edge(a, b).unwrap();
        let back = store.add_edge(b, a).unwrap();
        assert_eq!(e1, e2);
        assert_ne!(e1, back);
        assert_eq!(store.edge_count(), 2);
        assert_eq!(store.node(a).unwrap().outgoing, vec![e1]);
        assert_eq!(store.node(a).unwrap().incoming, vec![back]);
        assert_eq!(store.edge(e1).unwrap().weight, WEIGHT_MIN);
    }

    #[test]
    fn test_add_edge_rejects_missing_node() {
        let mut store = GraphStore::new();
        let a = store.resolve_or_create(b"a", 0).unwrap();
        assert!(matches!(store.add_edge(a, NodeId(9)), Err(Error::LookupMiss(_))));
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn test_lookup_miss_for_unseen_payload() {
        let store = GraphStore::new();
        assert!(matches!(store.lookup(b"q", None), Err(Error::LookupMiss(_))));
    }

    #[test]
    fn test_insert_pattern_preserves_terminals() {
        let mut store = GraphStore::new();
        let first = store.insert_pattern(b"xy", 0, 0).unwrap();
        let second = store.insert_pattern(b"xy", 0, 0).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.terminals(b"xy"), &[first, second]);
        assert_eq!(store.lookup(b"xy", None).unwrap(), first);
    }

    #[test]
    fn test_lookup_with_context_prefers_connected_terminal() {
        let mut store = GraphStore::new();
        let first = store.insert_pattern(b"x", 0, 0).unwrap();
        let second = store.insert_pattern(b"x", 0, 0).unwrap();
        let y = store.resolve_or_create(b"y", 0).unwrap();
        let e = store.add_edge(y, second).unwrap();
        store.edge_mut(e).unwrap().weight = 0.5;

        let mut ctx = ActivationPattern::new(0);
        ctx.add(y, 1.0);
        assert_eq!(store.lookup(b"x", Some(&ctx)).unwrap(), second);

        // Nothing active: ties keep the first inserted terminal.
        let empty = ActivationPattern::new(0);
        assert_eq!(store.lookup(b"x", Some(&empty)).unwrap(), first);
    }

    #[test]
    fn test_staging_leaves_store_untouched() {
        let mut store = GraphStore::new();
        let a = store.resolve_or_create(b"a", 0).unwrap();
        let staged = store.stage_sequence(b"abab", 4).unwrap();
        assert_eq!(staged.sequence, vec![a, NodeId(1), a, NodeId(1)]);
        assert_eq!(staged.fresh_count(), 1);
        assert_eq!(store.node_count(), 1);
        assert!(store.lookup(b"b", None).is_err());

        let sequence = store.commit_sequence(staged).unwrap();
        assert_eq!(store.lookup(b"b", None).unwrap(), sequence[1]);
        assert_eq!(store.node(sequence[1]).unwrap().port, 4);
    }

    #[test]
    fn test_reserved_sequence_trains_without_growing() {
        let mut store = GraphStore::new();
        let a = store.resolve_or_create(b"a", 0).unwrap();
        let c = store.resolve_or_create(b"c", 0).unwrap();
        store.add_edge(a, c).unwrap();

        let bytes = b"abcab";
        let mut staged = store.stage_sequence(bytes, 0).unwrap();
        store.reserve_sequence(&mut staged, bytes.len() / 2, bytes.len()).unwrap();
        let capacities = |s: &GraphStore| {
            (
                s.nodes.capacity(),
                s.edges.capacity(),
                s.pair_index.capacity(),
                s.trie.capacities(),
                [a, c].map(|id| (s.nodes[id.index()].outgoing.capacity(), s.nodes[id.index()].incoming.capacity())),
            )
        };
        let reserved = capacities(&store);

        let sequence = store.commit_sequence(staged).unwrap();
        for pair in sequence.windows(2) {
            store.add_edge(pair[0], pair[1]).unwrap();
        }
        for (payload, range) in [(&b"ab"[..], 0..2), (&b"ca"[..], 2..4)] {
            let component = HierarchyComponent::new(sequence[range].to_vec(), SparseVector::default());
            store.insert_abstraction(payload, 1, 0, component).unwrap();
        }
        assert_eq!(store.edge_count(), 4);
        assert_eq!(capacities(&store), reserved);
    }

    #[test]
    fn test_from_parts_rejects_duplicate_pair() {
        let nodes = vec![Node::new(NodeId(0), b"a", 0, 0), Node::new(NodeId(1), b"b", 0, 0)];
        let edges = vec![
            Edge::new(EdgeId(0), NodeId(0), NodeId(1)),
            Edge::new(EdgeId(1), NodeId(0), NodeId(1)),
        ];
        assert!(matches!(
            GraphStore::from_parts(nodes, edges),
            Err(Error::MalformedPersistedFile(_))
        ));
    }

    #[test]
    fn test_from_parts_rebuilds_indexes() {
        let nodes = vec![Node::new(NodeId(0), b"a", 0, 0), Node::new(NodeId(1), b"b", 0, 0)];
        let edges = vec![Edge::new(EdgeId(0), NodeId(0), NodeId(1))];
        let store = GraphStore::from_parts(nodes, edges).unwrap();
        assert_eq!(store.find_edge(NodeId(0), NodeId(1)), Some(EdgeId(0)));
        assert_eq!(store.lookup(b"b", None).unwrap(), NodeId(1));
        assert_eq!(store.node(NodeId(1)).unwrap().incoming, vec![EdgeId(0)]);
    }
}
