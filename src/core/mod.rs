//! The computation engine: nodes, edges, activations, collectors and optimizers.
//!
//! ## Two passes
//!
//! ```text
//! forward:   input ─▶ node ─▶ node ─▶ ... ─▶ output          (declared order)
//! backward:  input ◀─ node ◀─ node ◀─ ... ◀─ target - output (reverse order)
//! ```
//!
//! Forward moves values along edges. Backward moves deltas, i.e. error signals
//! pointing downhill on the squared-error loss, and every weights node lets its
//! optimizer update the matrix while producing the deltas for its producers.

pub mod activation;
pub mod collector;
pub mod edge;
pub mod filter;
pub mod network;
pub mod node;
pub mod optimizer;

pub use activation::Activation;
pub use collector::{AverageKind, Collector};
pub use edge::{Edge, EdgeId};
pub use filter::{Filter2D, Pool2D, PoolKind, Windows};
pub use network::{Network, NetworkBuilder};
pub use node::{FunctionNode, InputNode, Node, NodeId, NodeKind, NodePhase, WeightsNode};
pub use optimizer::{Ada, OptimizerConfig, Sgd, WeightsOptimizer};
