//! Binary graph container.
//!
//! Little-endian throughout:
//!
//! ```text
//! header   "HGRF" | version u16 | flags u16 | generation u32
//!          | adaptations u64 | generations u64 | last_port u8
//! stats    6 × (count u64 | mean f64 | m2 f64)        in Channel::ALL order
//! counts   nodes u32 | edges u32
//! node     payload_len u32 | payload | level u32 | port u8 | flags u8
//!          | visits u32 | departures u32 | stop f32
//!          | depth_len u32 | depth_len × f32 | need (count u64 | mean f64 | m2 f64)
//!          | trace_capacity u32 | trace_len u32 | trace bytes
//!          [flags & 1: constituents u32 | constituents × u32 | occurrences u32
//!                      | prototype_len u32 | prototype_len × (dim u8 | value f32)]
//! edge     from u32 | to u32 | weight f32 | aux u8 | aux context bytes
//!          | gate f32 | inactivity f32 | generation u32
//! ```
//!
//! The trie, adjacency lists and pair index are rebuilt from the arenas in
//! index order. Loading validates everything and fails closed: a bad image
//! never yields a partially loaded graph.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{info, warn};

use crate::config::GraphConfig;
use crate::learning::WeightBounds;
use crate::model::*;
use crate::predictor::MicroPredictor;
use crate::stats::{Channel, RunningStatistic, StatisticsTracker};
use crate::storage::GraphStore;
use crate::{Error, Graph, Result};

pub const MAGIC: &[u8; 4] = b"HGRF";
pub const VERSION: u16 = 1;

const FLAG_HIERARCHY: u8 = 0b0000_0001;

// ============================================================================
// Encode
// ============================================================================

fn put_len(buf: &mut BytesMut, len: usize, what: &str) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::AllocationFailure(format!("{what} length {len} exceeds u32")))?;
    buf.put_u32_le(len);
    Ok(())
}

fn put_stat(buf: &mut BytesMut, stat: &RunningStatistic) {
    buf.put_u64_le(stat.count());
    buf.put_f64_le(stat.raw_mean());
    buf.put_f64_le(stat.m2());
}

/// Serialize the whole graph into one buffer.
pub fn encode(graph: &Graph) -> Result<BytesMut> {
    let store = graph.store();
    let mut buf = BytesMut::new();

    buf.put_slice(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(0);
    buf.put_u32_le(graph.generation);
    buf.put_u64_le(graph.adaptations);
    buf.put_u64_le(graph.generations);
    buf.put_u8(graph.last_input_port.unwrap_or(0));

    for channel in Channel::ALL {
        put_stat(&mut buf, graph.stats.get(channel));
    }

    put_len(&mut buf, store.node_count(), "node count")?;
    put_len(&mut buf, store.edge_count(), "edge count")?;

    for node in store.nodes() {
        put_len(&mut buf, node.payload.len(), "payload")?;
        buf.put_slice(&node.payload);
        buf.put_u32_le(node.level);
        buf.put_u8(node.port);
        buf.put_u8(if node.hierarchy.is_some() { FLAG_HIERARCHY } else { 0 });

        let p = &node.predictor;
        buf.put_u32_le(p.visits());
        buf.put_u32_le(p.departures());
        buf.put_f32_le(p.stop_confidence());
        put_len(&mut buf, p.depth_weights().len(), "depth weights")?;
        for w in p.depth_weights() {
            buf.put_f32_le(*w);
        }
        put_stat(&mut buf, p.need());

        put_len(&mut buf, node.trace.capacity(), "trace capacity")?;
        put_len(&mut buf, node.trace.len(), "trace")?;
        buf.put_slice(node.trace.as_slice());

        if let Some(h) = &node.hierarchy {
            put_len(&mut buf, h.constituents.len(), "constituents")?;
            for c in &h.constituents {
                buf.put_u32_le(c.0);
            }
            buf.put_u32_le(h.occurrences);
            put_len(&mut buf, h.prototype.len(), "prototype")?;
            for (dim, value) in h.prototype.iter() {
                buf.put_u8(dim);
                buf.put_f32_le(value);
            }
        }
    }

    for edge in store.edges() {
        buf.put_u32_le(edge.source.0);
        buf.put_u32_le(edge.target.0);
        buf.put_f32_le(edge.weight);
        let aux = edge.aux_byte();
        buf.put_u8(aux);
        buf.put_slice(&edge.context[..aux as usize]);
        buf.put_f32_le(edge.gate);
        buf.put_f32_le(edge.inactivity);
        buf.put_u32_le(edge.generation);
    }
    Ok(buf)
}

pub fn save(graph: &Graph, writer: &mut impl Write) -> Result<()> {
    let buf = encode(graph)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    info!(
        nodes = graph.store().node_count(),
        edges = graph.store().edge_count(),
        bytes = buf.len(),
        "graph saved"
    );
    Ok(())
}

// ============================================================================
// Decode
// ============================================================================

/// Bounds-checked cursor; every short read is a malformed image.
struct Cursor<'a> {
    buf: &'a [u8],
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPersistedFile(msg.into())
}

impl<'a> Cursor<'a> {
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(malformed(format!(
                "truncated at {what}: need {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    fn f32(&mut self, what: &str) -> Result<f32> {
        self.need(4, what)?;
        let v = self.buf.get_f32_le();
        if !v.is_finite() {
            return Err(malformed(format!("non-finite {what}")));
        }
        Ok(v)
    }

    fn unit(&mut self, what: &str) -> Result<f32> {
        let v = self.f32(what)?;
        if !(0.0..=1.0).contains(&v) {
            return Err(malformed(format!("{what} {v} outside [0, 1]")));
        }
        Ok(v)
    }

    fn f64(&mut self, what: &str) -> Result<f64> {
        self.need(8, what)?;
        let v = self.buf.get_f64_le();
        if !v.is_finite() {
            return Err(malformed(format!("non-finite {what}")));
        }
        Ok(v)
    }

    /// A length prefix that must fit in what is left, `unit` bytes per element.
    fn len(&mut self, unit: usize, what: &str) -> Result<usize> {
        let n = self.u32(what)? as usize;
        self.need(n.saturating_mul(unit), what)?;
        Ok(n)
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn stat(&mut self, what: &str) -> Result<RunningStatistic> {
        let count = self.u64(what)?;
        let mean = self.f64(what)?;
        let m2 = self.f64(what)?;
        if m2 < 0.0 {
            return Err(malformed(format!("negative spread in {what}")));
        }
        Ok(RunningStatistic::from_parts(mean, m2, count))
    }
}

fn decode_node(cur: &mut Cursor<'_>, index: u32) -> Result<Node> {
    let payload_len = cur.len(1, "payload")?;
    let payload = cur.bytes(payload_len, "payload")?;
    let level = cur.u32("level")?;
    let port = cur.u8("port")?;
    let flags = cur.u8("node flags")?;
    if flags & !FLAG_HIERARCHY != 0 {
        return Err(malformed(format!("node {index}: unknown flags {flags:#04x}")));
    }

    let visits = cur.u32("visits")?;
    let departures = cur.u32("departures")?;
    let stop = cur.unit("stop weight")?;
    let depth_len = cur.len(4, "depth weights")?;
    let mut depth = Vec::with_capacity(depth_len);
    for _ in 0..depth_len {
        depth.push(cur.unit("depth weight")?);
    }
    let need = cur.stat("history need")?;

    let capacity = cur.u32("trace capacity")? as usize;
    let trace_len = cur.len(1, "trace")?;
    if trace_len > capacity.max(1) {
        return Err(malformed(format!("node {index}: trace longer than its capacity")));
    }
    let trace = cur.bytes(trace_len, "trace")?;

    let mut node = Node::new(NodeId(index), payload, level, port);
    node.predictor = MicroPredictor::from_parts(&depth, stop, visits, departures, need);
    node.trace = ContextTrace::from_parts(trace, capacity);

    if flags & FLAG_HIERARCHY != 0 {
        let count = cur.len(4, "constituents")?;
        let mut constituents = Vec::with_capacity(count);
        for _ in 0..count {
            constituents.push(NodeId(cur.u32("constituent")?));
        }
        let occurrences = cur.u32("occurrences")?;
        let proto_len = cur.len(5, "prototype")?;
        let mut prototype = SparseVector::new();
        for _ in 0..proto_len {
            let dim = cur.u8("prototype dim")?;
            prototype.add(dim, cur.f32("prototype value")?);
        }
        node.hierarchy = Some(HierarchyComponent { constituents, occurrences, prototype });
    }
    Ok(node)
}

fn decode_edge(cur: &mut Cursor<'_>, index: u32) -> Result<Edge> {
    let source = NodeId(cur.u32("edge source")?);
    let target = NodeId(cur.u32("edge target")?);
    let mut edge = Edge::new(EdgeId(index), source, target);
    edge.weight = cur.unit("edge weight")?;
    let aux = cur.u8("edge aux")? as usize;
    edge.context = EdgeContext::from_slice(cur.bytes(aux, "edge context")?);
    edge.gate = cur.unit("edge gate")?;
    edge.inactivity = cur.unit("edge inactivity")?;
    edge.generation = cur.u32("edge generation")?;
    Ok(edge)
}

/// Rebuild a graph from a complete image.
pub fn decode(image: &[u8], config: GraphConfig) -> Result<Graph> {
    config.validate()?;
    let mut cur = Cursor { buf: image };

    let magic = cur.bytes(4, "magic")?;
    if magic != MAGIC {
        return Err(malformed("bad magic"));
    }
    let version = cur.u16("version")?;
    if version != VERSION {
        return Err(malformed(format!("unsupported version {version}")));
    }
    let _flags = cur.u16("flags")?;
    let generation = cur.u32("generation")?;
    let adaptations = cur.u64("adaptations")?;
    let generations = cur.u64("generations")?;
    let last_port = cur.u8("last port")?;

    let mut stats = StatisticsTracker::new(config.min_samples);
    for channel in Channel::ALL {
        stats.restore(channel, cur.stat(channel.name())?);
    }

    let node_count = cur.u32("node count")?;
    let edge_count = cur.u32("edge count")?;
    // Smallest node record is 62 bytes, smallest edge record 25.
    cur.need((node_count as usize).saturating_mul(62), "node records")?;

    let mut nodes = Vec::new();
    nodes
        .try_reserve(node_count as usize)
        .map_err(|e| Error::AllocationFailure(format!("node arena: {e}")))?;
    for i in 0..node_count {
        nodes.push(decode_node(&mut cur, i)?);
    }
    cur.need((edge_count as usize).saturating_mul(25), "edge records")?;
    let mut edges = Vec::new();
    edges
        .try_reserve(edge_count as usize)
        .map_err(|e| Error::AllocationFailure(format!("edge arena: {e}")))?;
    for i in 0..edge_count {
        edges.push(decode_edge(&mut cur, i)?);
    }
    if cur.buf.has_remaining() {
        return Err(malformed(format!("{} trailing bytes", cur.buf.remaining())));
    }

    let store = GraphStore::from_parts(nodes, edges)?;
    let mut graph = Graph::with_config(config)?;
    graph.store = store;
    graph.stats = stats;
    graph.generation = generation;
    graph.adaptations = adaptations;
    graph.generations = generations;
    graph.last_input_port = (last_port != 0).then_some(last_port);
    graph.settle_bounds(WeightBounds::ABSOLUTE);
    Ok(graph)
}

pub fn load(reader: &mut impl Read, config: GraphConfig) -> Result<Graph> {
    let mut image = Vec::new();
    reader.read_to_end(&mut image)?;
    match decode(&image, config) {
        Ok(graph) => {
            info!(
                nodes = graph.store().node_count(),
                edges = graph.store().edge_count(),
                bytes = image.len(),
                "graph loaded"
            );
            Ok(graph)
        }
        Err(e) => {
            warn!(error = %e, bytes = image.len(), "rejected persisted graph");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Graph {
        let mut graph = Graph::new();
        for _ in 0..3 {
            graph.feed(1, b"abcab").unwrap();
        }
        graph
    }

    #[test]
    fn test_header_layout() {
        let image = encode(&sample()).unwrap();
        assert_eq!(&image[..4], MAGIC);
        assert_eq!(u16::from_le_bytes([image[4], image[5]]), VERSION);
    }

    #[test]
    fn test_round_trip_restores_state() {
        let graph = sample();
        let image = encode(&graph).unwrap();
        let loaded = decode(&image, GraphConfig::default()).unwrap();
        assert_eq!(loaded.store().node_count(), graph.store().node_count());
        assert_eq!(loaded.store().edges(), graph.store().edges());
        assert_eq!(loaded.stats(), graph.stats());
        assert_eq!(loaded.last_input_port(), Some(1));
        assert_eq!(encode(&loaded).unwrap(), image);
    }

    #[test]
    fn test_longest_edge_context_round_trips() {
        let mut graph = sample();
        let history: Vec<u8> = (0..400u16).map(|i| (i % 7) as u8 + b'a').collect();
        let id = graph.store().edges()[0].id;
        if let Some(edge) = graph.store.edge_mut(id) {
            edge.record_context(&history);
        }
        let loaded = decode(&encode(&graph).unwrap(), GraphConfig::default()).unwrap();
        let context = &loaded.store().edge(id).unwrap().context;
        assert_eq!(context.len(), MAX_EDGE_CONTEXT);
        assert_eq!(context, &graph.store().edge(id).unwrap().context);
        assert_eq!(loaded.store().edges(), graph.store().edges());
    }

    #[test]
    fn test_rejects_truncation_everywhere() {
        let image = encode(&sample()).unwrap();
        for cut in [0, 3, 4, 10, image.len() / 2, image.len() - 1] {
            let result = decode(&image[..cut], GraphConfig::default());
            assert!(matches!(result, Err(Error::MalformedPersistedFile(_))), "cut at {cut}");
        }
    }

    #[test]
    fn test_rejects_bad_version_and_trailing_bytes() {
        let mut image = encode(&sample()).unwrap().to_vec();
        let mut trailing = image.clone();
        trailing.push(0);
        assert!(matches!(decode(&trailing, GraphConfig::default()), Err(Error::MalformedPersistedFile(_))));

        image[4] = 9;
        assert!(matches!(decode(&image, GraphConfig::default()), Err(Error::MalformedPersistedFile(_))));
    }
}
