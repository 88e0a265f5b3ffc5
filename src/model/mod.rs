//! # Associative Graph Model
//!
//! Plain data records shared by every component: nodes, edges, traces,
//! sparse representations, activation patterns and hierarchy components.
//!
//! Design rule: no thresholds and no graph-wide state here. Anything adaptive
//! lives in `stats`, `predictor` or the engines that own the graph.

pub mod node;
pub mod edge;
pub mod trace;
pub mod sparse;
pub mod activation;
pub mod hierarchy;

pub use node::{Node, NodeId, Payload, PortId};
pub use edge::{Edge, EdgeId, EdgeContext, MAX_EDGE_CONTEXT, WEIGHT_MAX, WEIGHT_MIN};
pub use trace::ContextTrace;
pub use sparse::SparseVector;
pub use activation::ActivationPattern;
pub use hierarchy::HierarchyComponent;
