//! # hebbgraph: Online Associative Byte Graph
//!
//! An incremental, non-gradient learner over byte streams. Fed bytes become
//! nodes; consecutive bytes become weighted edges; generation walks those
//! edges from a prefix.
//!
//! ## Design Principles
//!
//! 1. **No literal limits**: every threshold is `mean + fraction * stddev` of a
//!    running statistic (see [`stats`]), flagged as a placeholder until data exists
//! 2. **Bounded learning**: weights move inside an adaptive `[floor, ceiling]`
//! 3. **Edges are the only transitions**: generation never invents a path
//! 4. **Arena storage**: nodes and edges are stable `u32` indices
//!
//! ## Quick Start
//!
//! ```rust
//! use hebbgraph::Graph;
//!
//! # fn example() -> hebbgraph::Result<()> {
//! let mut graph = Graph::new();
//! for _ in 0..3 {
//!     graph.feed(0, b"abcd")?;
//! }
//! assert_eq!(graph.generate(b"a")?, b"bcd");
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! ## Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Statistics | `stats` | Running mean/variance per channel; all thresholds |
//! | Store & trie | `storage` | Node/edge arenas, payload index |
//! | Micro-predictor | `predictor` | Per-node relevance and stop confidence |
//! | Context | `context` | Activation spreading, summaries, views |
//! | Learning | `learning` | Bounded reinforcement, feedback |
//! | Hierarchy | `hierarchy` | Abstraction nodes over stable runs |
//! | Decode | `decode` | Streaming autoregressive walk |

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod stats;
pub mod predictor;
pub mod storage;
pub mod context;
pub mod learning;
pub mod hierarchy;
pub mod decode;
pub mod config;
pub mod port;
pub mod metrics;
pub mod persist;
pub mod shared;

// ============================================================================
// Re-exports
// ============================================================================

pub use model::{
    ActivationPattern, ContextTrace, Edge, EdgeId, HierarchyComponent, Node, NodeId,
    PortId, SparseVector,
};
pub use stats::{Channel, RunningStatistic, StatisticsTracker, Threshold};
pub use storage::{GraphStore, MultiTerminalTrie};
pub use predictor::MicroPredictor;
pub use learning::{compare_output, WeightBounds};
pub use decode::{DecodeState, Decoder, StopReason};
pub use config::GraphConfig;
pub use port::{PortFrame, PortRouting};
pub use metrics::MetricsSnapshot;
pub use shared::SharedGraph;

// ============================================================================
// Feed report
// ============================================================================

/// What one `feed` call did to the graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedReport {
    pub bytes: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub traversals: usize,
    pub abstractions_created: usize,
    pub abstractions_reused: usize,
    /// Bounds every edge weight lies within once the feed returns.
    pub bounds: WeightBounds,
}

impl Default for FeedReport {
    fn default() -> Self {
        Self {
            bytes: 0,
            nodes_created: 0,
            edges_created: 0,
            traversals: 0,
            abstractions_created: 0,
            abstractions_reused: 0,
            bounds: WeightBounds::ABSOLUTE,
        }
    }
}

// ============================================================================
// Top-level Graph handle
// ============================================================================

/// One associative graph: store, statistics and counters.
///
/// All mutating operations take `&mut self`; a graph has a single logical
/// writer. Use [`SharedGraph`] to reach one graph from several threads.
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) store: GraphStore,
    pub(crate) stats: StatisticsTracker,
    pub(crate) config: GraphConfig,
    /// Training generation; stamped on every traversed edge.
    pub(crate) generation: u32,
    pub(crate) adaptations: u64,
    pub(crate) generations: u64,
    pub(crate) last_input_port: Option<PortId>,
    /// Edges committed by the most recent decode, in order.
    pub(crate) last_path: Vec<EdgeId>,
    /// Bounds every edge weight is known to lie within.
    pub(crate) enforced: WeightBounds,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let config = GraphConfig::default();
        Self {
            store: GraphStore::new(),
            stats: StatisticsTracker::new(config.min_samples),
            config,
            generation: 0,
            adaptations: 0,
            generations: 0,
            last_input_port: None,
            last_path: Vec::new(),
            enforced: WeightBounds::ABSOLUTE,
        }
    }

    pub fn with_config(config: GraphConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            stats: StatisticsTracker::new(config.min_samples),
            config,
            ..Self::new()
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn stats(&self) -> &StatisticsTracker {
        &self.stats
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn node_count(&self) -> usize {
        self.store.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.store.edge_count()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Completed training passes.
    pub fn adaptations(&self) -> u64 {
        self.adaptations
    }

    /// Decode sessions started.
    pub fn generations(&self) -> u64 {
        self.generations
    }

    pub fn last_input_port(&self) -> Option<PortId> {
        self.last_input_port
    }

    pub fn last_path(&self) -> &[EdgeId] {
        &self.last_path
    }

    /// Weight bounds the next update would use. Every edge lies within
    /// them between operations.
    pub fn weight_bounds(&self) -> WeightBounds {
        WeightBounds::from_stats(&self.stats, &self.config)
    }

    /// Bring every edge inside the bounds the statistics now imply, after a
    /// round of updates clamped to `applied`. Skips the sweep when the new
    /// bounds cover everything already known to hold.
    pub(crate) fn settle_bounds(&mut self, applied: WeightBounds) -> WeightBounds {
        let bounds = self.weight_bounds();
        let known = self.enforced.hull(&applied);
        if bounds.covers(&known) {
            self.enforced = known;
        } else {
            learning::enforce_bounds(&mut self.store, &bounds);
            self.enforced = bounds;
        }
        bounds
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::capture(self)
    }

    // ========================================================================
    // Trie
    // ========================================================================

    pub fn lookup(&self, payload: &[u8], context: Option<&ActivationPattern>) -> Result<NodeId> {
        self.store.lookup(payload, context)
    }

    /// Terminals for `payload`, in insertion order.
    pub fn terminals(&self, payload: &[u8]) -> Vec<NodeId> {
        self.store.terminals(payload)
    }

    /// Append a distinct terminal for `payload`, even if one exists.
    pub fn insert_pattern(&mut self, payload: &[u8], port: PortId) -> Result<NodeId> {
        self.store.insert_pattern(payload, 0, port)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Train on one byte sequence from `port` (0 = unknown).
    ///
    /// Either the whole sequence is learned or, on
    /// [`Error::AllocationFailure`], the graph is left as it was.
    pub fn feed(&mut self, port: PortId, bytes: &[u8]) -> Result<FeedReport> {
        if bytes.is_empty() {
            return Ok(FeedReport::default());
        }
        let n = bytes.len();

        // Abstractions are disjoint runs of at least two nodes.
        let mut staged = self.store.stage_sequence(bytes, port)?;
        self.store.reserve_sequence(&mut staged, n / 2, n)?;
        let nodes_created = staged.fresh_count();
        let sequence = self.store.commit_sequence(staged)?;
        let offsets: Vec<usize> = (0..n).collect();

        self.generation = self.generation.wrapping_add(1);
        self.last_input_port = Some(port);

        let pattern =
            context::spread_activation(&self.store, &mut self.stats, &self.config, &sequence, port, false);
        let applied = WeightBounds::from_stats(&self.stats, &self.config);
        let outcome = learning::train_sequence(
            &mut self.store,
            &mut self.stats,
            &sequence,
            &offsets,
            bytes,
            &pattern,
            &applied,
            self.generation,
        )?;
        let bounds = self.settle_bounds(applied);
        let folded =
            hierarchy::consolidate(&mut self.store, &mut self.stats, &self.config, &sequence, &pattern, port)?;
        self.adaptations += 1;

        let report = FeedReport {
            bytes: n,
            nodes_created,
            edges_created: outcome.edges_created,
            traversals: outcome.traversals,
            abstractions_created: folded.created.len(),
            abstractions_reused: folded.reused.len(),
            bounds,
        };
        debug!(port, ?report, "feed");
        Ok(report)
    }

    /// Decode a port frame and feed its data.
    pub fn feed_frame(&mut self, frame: &[u8]) -> Result<FeedReport> {
        let frame = PortFrame::decode(frame)?;
        self.feed(frame.port_id, &frame.data)
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Streaming decode session over every emittable node.
    pub fn decode(&mut self, prefix: &[u8]) -> Decoder<'_> {
        Decoder::new(self, prefix, 0, None)
    }

    /// Streaming decode restricted to nodes from the port `port` routes to.
    pub fn decode_on(&mut self, port: PortId, prefix: &[u8]) -> Decoder<'_> {
        let output = self.config.routing.output_for(port);
        Decoder::new(self, prefix, port, Some(output))
    }

    /// Deterministic continuation of `prefix`. An empty graph or an unseen
    /// final byte yields an empty output.
    pub fn generate(&mut self, prefix: &[u8]) -> Result<Vec<u8>> {
        Ok(self.decode(prefix).collect())
    }

    pub fn generate_on(&mut self, port: PortId, prefix: &[u8]) -> Result<Vec<u8>> {
        Ok(self.decode_on(port, prefix).collect())
    }

    // ========================================================================
    // Feedback
    // ========================================================================

    /// Score the last generation with `signal` in `[0, 1]`. Returns the
    /// number of edges adjusted; no-op without a last path.
    pub fn feedback(&mut self, signal: f32) -> usize {
        if self.last_path.is_empty() {
            return 0;
        }
        let bounds = self.weight_bounds();
        let touched = learning::apply_feedback(&mut self.store, &mut self.stats, &self.last_path, signal, &bounds);
        self.settle_bounds(bounds);
        touched
    }

    /// Generate from `prefix`, score against `expected`, feed the score back.
    pub fn train_with_feedback(&mut self, prefix: &[u8], expected: &[u8]) -> Result<f32> {
        let output = self.generate(prefix)?;
        let score = compare_output(&output, expected);
        self.feedback(score);
        Ok(score)
    }

    /// Extra reinforcement for the continuation `sequence[prefix_len..]`,
    /// including the edge joining it to the prefix. Only existing edges move.
    pub fn strengthen_continuation(&mut self, sequence: &[u8], prefix_len: usize) -> usize {
        let start = prefix_len.saturating_sub(1).min(sequence.len());
        let bounds = self.weight_bounds();
        let mut touched = 0;
        let mut run = Vec::new();
        for b in &sequence[start..] {
            match self.store.lookup(&[*b], None) {
                Ok(id) => run.push(id),
                Err(_) => {
                    touched += learning::strengthen_path(&mut self.store, &mut self.stats, &run, &bounds);
                    run.clear();
                }
            }
        }
        touched += learning::strengthen_path(&mut self.store, &mut self.stats, &run, &bounds);
        self.settle_bounds(bounds);
        touched
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn save(&self, writer: &mut impl Write) -> Result<()> {
        persist::save(self, writer)
    }

    pub fn load(reader: &mut impl Read) -> Result<Self> {
        persist::load(reader, GraphConfig::default())
    }

    pub fn load_with_config(reader: &mut impl Read, config: GraphConfig) -> Result<Self> {
        persist::load(reader, config)
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut writer)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = BufReader::new(std::fs::File::open(path)?);
        Self::load(&mut reader)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("Lookup miss: {0}")]
    LookupMiss(String),

    #[error("Malformed persisted file: {0}")]
    MalformedPersistedFile(String),

    #[error("Invalid port frame: {0}")]
    InvalidFrame(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_feed_is_noop() {
        let mut graph = Graph::new();
        let report = graph.feed(3, b"").unwrap();
        assert_eq!(report, FeedReport::default());
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.adaptations(), 0);
        assert_eq!(graph.last_input_port(), None);
    }

    #[test]
    fn test_feed_report_counts() {
        let mut graph = Graph::new();
        let report = graph.feed(2, b"abca").unwrap();
        assert_eq!(report.bytes, 4);
        assert_eq!(report.nodes_created, 3);
        assert_eq!(report.edges_created, 3);
        assert_eq!(report.traversals, 3);
        assert_eq!(graph.last_input_port(), Some(2));
        assert_eq!(graph.generation(), 1);
    }

    #[test]
    fn test_feed_stages_repeated_unseen_bytes_once() {
        let mut graph = Graph::new();
        let report = graph.feed(0, b"abab").unwrap();
        assert_eq!(report.nodes_created, 2);
        assert_eq!(report.edges_created, 2);
        assert_eq!(graph.terminals(b"a"), vec![NodeId(0)]);
        assert_eq!(graph.terminals(b"b"), vec![NodeId(1)]);
    }

    #[test]
    fn test_stale_edges_follow_narrowing_bounds() {
        let mut graph = Graph::new();
        for seq in [&b"xy"[..], &b"xq"[..], &b"xz"[..]] {
            graph.feed(0, seq).unwrap();
        }
        let mut report = FeedReport::default();
        for _ in 0..300 {
            report = graph.feed(0, b"ab").unwrap();
        }
        assert!(!report.bounds.bootstrap);
        assert!(report.bounds.floor > 0.5, "{:?}", report.bounds);
        assert_eq!(report.bounds, graph.weight_bounds());
        for edge in graph.store().edges() {
            assert!(report.bounds.contains(edge.weight), "{} outside {:?}", edge.weight, report.bounds);
        }
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let config = GraphConfig { min_samples: 0, ..GraphConfig::default() };
        assert!(matches!(Graph::with_config(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_feed_frame() {
        let mut graph = Graph::new();
        let frame = PortFrame::with_timestamp(7, 1, b"xy".to_vec()).encode().unwrap();
        let report = graph.feed_frame(&frame).unwrap();
        assert_eq!(report.bytes, 2);
        assert_eq!(graph.last_input_port(), Some(7));
        assert_eq!(graph.store().node(NodeId(0)).unwrap().port, 7);
        assert!(matches!(graph.feed_frame(&frame[..5]), Err(Error::InvalidFrame(_))));
    }
}
