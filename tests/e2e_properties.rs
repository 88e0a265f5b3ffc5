//! Property tests over random training streams.
//!
//! Each case trains a fresh graph on generated sequences over a small
//! alphabet (so paths overlap and cycles form), then checks structural
//! guarantees of learning and generation.

use hebbgraph::{Graph, NodeId};
use proptest::prelude::*;

// ============================================================================
// Fixed streams
// ============================================================================

/// Three edges out of `x` learned once, then a long run of `ab`: the Weight
/// channel narrows far above the old edges.
#[test]
fn stale_edges_are_pulled_into_narrowed_bounds() {
    let mut graph = Graph::new();
    for seq in [&b"xy"[..], &b"xq"[..], &b"xz"[..]] {
        graph.feed(0, seq).unwrap();
    }
    for round in 0..300 {
        let report = graph.feed(0, b"ab").unwrap();
        for edge in graph.store().edges() {
            assert!(
                report.bounds.contains(edge.weight),
                "round {round}: {} outside {:?}",
                edge.weight,
                report.bounds
            );
        }
    }
}

// ============================================================================
// Random streams
// ============================================================================

fn sequences() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(b'a'..=b'f', 1..12), 1..8)
}

fn train(seqs: &[Vec<u8>], rounds: usize) -> Graph {
    let mut graph = Graph::new();
    for _ in 0..rounds {
        for s in seqs {
            graph.feed(0, s).unwrap();
        }
    }
    graph
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn weights_stay_within_bounds(seqs in sequences(), rounds in 1usize..4) {
        let mut graph = Graph::new();
        for _ in 0..rounds {
            for s in &seqs {
                let report = graph.feed(0, s).unwrap();
                prop_assert_eq!(report.bounds, graph.weight_bounds());
                for edge in graph.store().edges() {
                    prop_assert!((0.0..=1.0).contains(&edge.weight));
                    prop_assert!(
                        report.bounds.contains(edge.weight),
                        "{} outside {:?}", edge.weight, report.bounds
                    );
                }
            }
        }
    }

    #[test]
    fn weights_stay_within_bounds_after_feedback(seqs in sequences(), signal in 0.0f32..=1.0) {
        let mut graph = train(&seqs, 2);
        graph.generate(&seqs[0][..1]).unwrap();
        graph.feedback(signal);
        graph.strengthen_continuation(&seqs[0], 1);
        let bounds = graph.weight_bounds();
        for edge in graph.store().edges() {
            prop_assert!(bounds.contains(edge.weight), "{} outside {:?}", edge.weight, bounds);
        }
    }

    #[test]
    fn generation_only_follows_existing_edges(
        seqs in sequences(),
        prefix in prop::collection::vec(b'a'..=b'f', 1..4),
    ) {
        let mut graph = train(&seqs, 2);
        let seed = graph.lookup(&prefix[prefix.len() - 1..], None).ok();
        let out = graph.generate(&prefix).unwrap();
        let path = graph.last_path().to_vec();

        let mut at: Option<NodeId> = seed;
        let mut walked = Vec::new();
        for id in &path {
            let edge = graph.store().edge(*id).unwrap();
            prop_assert_eq!(Some(edge.source), at);
            let target = graph.store().node(edge.target).unwrap();
            prop_assert!(target.is_emittable());
            walked.extend_from_slice(&target.payload);
            at = Some(edge.target);
        }
        prop_assert_eq!(walked, out);
    }

    #[test]
    fn generation_respects_budget(seqs in sequences(), prefix in prop::collection::vec(b'a'..=b'f', 1..4)) {
        let mut graph = train(&seqs, 3);
        let decoder = graph.decode(&prefix);
        let budget = decoder.limits().budget;
        let (out, _) = decoder.finish();
        prop_assert!(out.len() <= budget);
    }

    #[test]
    fn identical_patterns_keep_both_terminals(payload in prop::collection::vec(any::<u8>(), 1..6)) {
        let mut graph = Graph::new();
        let first = graph.insert_pattern(&payload, 0).unwrap();
        let second = graph.insert_pattern(&payload, 0).unwrap();
        prop_assert_ne!(first, second);
        prop_assert_eq!(graph.terminals(&payload), vec![first, second]);
        prop_assert_eq!(graph.lookup(&payload, None).unwrap(), first);
    }

    #[test]
    fn generation_is_repeatable(seqs in sequences(), prefix in prop::collection::vec(b'a'..=b'f', 1..3)) {
        let mut a = train(&seqs, 2);
        let mut b = train(&seqs, 2);
        prop_assert_eq!(a.generate(&prefix).unwrap(), b.generate(&prefix).unwrap());
    }
}
