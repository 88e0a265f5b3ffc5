//! End-to-end tests for feedback, port frames and routing.
//!
//! Feedback scores the path of the last generation; ports tag the nodes a
//! sequence creates and restrict what a routed generation may emit.

use hebbgraph::metrics::MetricsSnapshot;
use hebbgraph::port::PortFrame;
use hebbgraph::shared::SharedGraph;
use hebbgraph::{Channel, Error, Graph, GraphConfig, PortRouting};
use pretty_assertions::assert_eq;

// ============================================================================
// Helpers
// ============================================================================

fn trained(sequence: &[u8], rounds: usize) -> Graph {
    let mut graph = Graph::new();
    for _ in 0..rounds {
        graph.feed(0, sequence).unwrap();
    }
    graph
}

/// "abc" arrives on port 1 and "axy" on port 2; both share the node 'a'.
fn two_ports(config: GraphConfig) -> Graph {
    let mut graph = Graph::with_config(config).unwrap();
    for _ in 0..3 {
        graph.feed(1, b"abc").unwrap();
        graph.feed(2, b"axy").unwrap();
    }
    graph
}

fn path_weight(graph: &Graph) -> f32 {
    graph
        .last_path()
        .iter()
        .map(|id| graph.store().edge(*id).unwrap().weight)
        .sum()
}

// ============================================================================
// 1. Feedback
// ============================================================================

#[test]
fn test_feedback_without_generation_is_noop() {
    let mut graph = trained(b"abcd", 3);
    assert_eq!(graph.feedback(1.0), 0);
    assert_eq!(graph.stats().get(Channel::Error).count(), 9);
}

#[test]
fn test_negative_feedback_weakens_path() {
    let mut graph = trained(b"abcd", 3);
    assert_eq!(graph.generate(b"a").unwrap(), b"bcd");
    assert_eq!(graph.last_path().len(), 3);

    let before = path_weight(&graph);
    assert_eq!(graph.feedback(0.0), 3);
    assert!(path_weight(&graph) < before);
    for id in graph.last_path() {
        let weight = graph.store().edge(*id).unwrap().weight;
        assert!((0.0..=1.0).contains(&weight));
    }
}

#[test]
fn test_neutral_feedback_changes_nothing() {
    let mut graph = trained(b"abcd", 3);
    graph.generate(b"a").unwrap();
    let before = path_weight(&graph);
    assert_eq!(graph.feedback(0.5), 0);
    assert_eq!(path_weight(&graph), before);
}

#[test]
fn test_train_with_feedback_scores_output() {
    let mut graph = trained(b"abcd", 3);
    assert_eq!(graph.train_with_feedback(b"a", b"bcd").unwrap(), 1.0);
    let partial = graph.train_with_feedback(b"a", b"bxd").unwrap();
    assert!((partial - 2.0 / 3.0).abs() < 1e-6, "got {partial}");
    assert_eq!(graph.generations(), 2);
}

#[test]
fn test_strengthen_continuation_touches_existing_edges_only() {
    let mut graph = trained(b"abcd", 3);
    let edges = graph.edge_count();
    assert_eq!(graph.strengthen_continuation(b"abcd", 1), 3);
    assert_eq!(graph.strengthen_continuation(b"abcd", 3), 1);
    assert_eq!(graph.strengthen_continuation(b"abzd", 2), 0);
    assert_eq!(graph.edge_count(), edges);
}

// ============================================================================
// 2. Port frames
// ============================================================================

#[test]
fn test_feed_frame_uses_frame_port() {
    let mut graph = Graph::new();
    let frame = PortFrame::new(3, b"pq".to_vec()).encode().unwrap();
    let report = graph.feed_frame(&frame).unwrap();
    assert_eq!(report.bytes, 2);
    assert_eq!(report.edges_created, 1);
    assert_eq!(graph.last_input_port(), Some(3));
    let p = graph.lookup(b"p", None).unwrap();
    assert_eq!(graph.store().node(p).unwrap().port, 3);
}

#[test]
fn test_feed_frame_rejects_short_frame() {
    let mut graph = Graph::new();
    assert!(matches!(graph.feed_frame(&[1, 2]), Err(Error::InvalidFrame(_))));
    assert_eq!(graph.node_count(), 0);
    assert_eq!(graph.last_input_port(), None);
}

// ============================================================================
// 3. Port-filtered generation
// ============================================================================

#[test]
fn test_generate_on_stays_within_port() {
    let mut graph = two_ports(GraphConfig::default());
    assert_eq!(graph.generate_on(1, b"a").unwrap(), b"bc");
    assert_eq!(graph.generate_on(2, b"a").unwrap(), b"xy");
}

#[test]
fn test_generate_on_follows_routing() {
    let config = GraphConfig {
        routing: PortRouting::default().with_route(1, 2),
        ..GraphConfig::default()
    };
    let mut graph = two_ports(config);
    assert_eq!(graph.generate_on(1, b"a").unwrap(), b"xy");
    assert_eq!(graph.generate_on(2, b"a").unwrap(), b"xy");
}

#[test]
fn test_unported_generation_may_use_either_branch() {
    let mut graph = two_ports(GraphConfig::default());
    let out = graph.generate(b"a").unwrap();
    assert!(out == b"bc" || out == b"xy", "got {out:?}");
}

// ============================================================================
// 4. Metrics and shared access
// ============================================================================

#[test]
fn test_metrics_json_round_trip() {
    let mut graph = trained(b"hello", 3);
    graph.generate(b"h").unwrap();
    let snapshot = graph.metrics();
    let json = snapshot.to_json().unwrap();
    assert!(json.contains("\"hierarchy_nodes\""));
    let parsed: MetricsSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, snapshot);
    assert_eq!(parsed.channel(Channel::PathLength).unwrap().count, 3);
}

#[test]
fn test_shared_graph_feeds_from_threads() {
    let shared = SharedGraph::new(Graph::new());
    let handles: Vec<_> = (0..4u8)
        .map(|port| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    shared.feed(port, b"shared").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(shared.metrics().adaptations, 12);
    assert_eq!(shared.with(|g| g.stats().get(Channel::PathLength).count()), 12);
}
