//! Read-only metrics snapshot for external monitoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::Channel;
use crate::{Graph, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub count: u64,
    pub mean: f32,
    pub stddev: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub nodes: usize,
    pub edges: usize,
    pub hierarchy_nodes: usize,
    pub max_abstraction_level: u32,
    /// Constituent references per abstraction node; 0 without abstractions.
    pub compression_ratio: f32,
    pub adaptations: u64,
    pub generations: u64,
    pub channels: Vec<ChannelSnapshot>,
}

impl MetricsSnapshot {
    pub fn capture(graph: &Graph) -> Self {
        let store = graph.store();
        let mut hierarchy_nodes = 0usize;
        let mut constituents = 0usize;
        let mut max_level = 0u32;
        for node in store.hierarchy_nodes() {
            hierarchy_nodes += 1;
            constituents += node.hierarchy.as_ref().map_or(0, |h| h.constituents.len());
            max_level = max_level.max(node.level);
        }
        let compression_ratio =
            if hierarchy_nodes == 0 { 0.0 } else { constituents as f32 / hierarchy_nodes as f32 };

        let channels = graph
            .stats()
            .iter()
            .map(|(channel, stat)| ChannelSnapshot {
                channel,
                count: stat.count(),
                mean: stat.mean(),
                stddev: stat.stddev(),
            })
            .collect();

        Self {
            captured_at: Utc::now(),
            nodes: store.node_count(),
            edges: store.edge_count(),
            hierarchy_nodes,
            max_abstraction_level: max_level,
            compression_ratio,
            adaptations: graph.adaptations(),
            generations: graph.generations(),
            channels,
        }
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelSnapshot> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
