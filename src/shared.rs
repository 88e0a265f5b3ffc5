//! Thread-shareable graph handle.
//!
//! A graph has a single logical writer. `SharedGraph` serializes every
//! operation behind one `parking_lot::Mutex`, including generation (which
//! mutates traces and statistics too).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::metrics::MetricsSnapshot;
use crate::model::PortId;
use crate::{FeedReport, Graph, Result};

#[derive(Debug, Clone, Default)]
pub struct SharedGraph {
    inner: Arc<Mutex<Graph>>,
}

impl SharedGraph {
    pub fn new(graph: Graph) -> Self {
        Self { inner: Arc::new(Mutex::new(graph)) }
    }

    pub fn feed(&self, port: PortId, bytes: &[u8]) -> Result<FeedReport> {
        self.inner.lock().feed(port, bytes)
    }

    pub fn generate(&self, prefix: &[u8]) -> Result<Vec<u8>> {
        self.inner.lock().generate(prefix)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.lock().metrics()
    }

    /// Run `f` with exclusive access.
    pub fn with<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> R {
        f(&mut *self.inner.lock())
    }
}

impl From<Graph> for SharedGraph {
    fn from(graph: Graph) -> Self {
        Self::new(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writers_are_serialized() {
        let shared = SharedGraph::default();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let g = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        g.feed(1, b"xyz").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let m = shared.metrics();
        assert_eq!(m.adaptations, 20);
        assert!(shared.with(|g| g.store().find_edge(crate::NodeId(0), crate::NodeId(1)).is_some()));
    }
}
