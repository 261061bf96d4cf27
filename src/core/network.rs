//! Node graphs: construction, validation, and forward/backward orchestration.
//!
//! ## Layout
//!
//! A [`Network`] owns two arenas, one of [`Node`]s and one of [`Edge`]s, addressed
//! by [`NodeId`] and [`EdgeId`]. Each producer→consumer connection gets its own
//! edge, and the output node additionally writes a *sink* edge that the network
//! reads the result from and seeds the backward pass into.
//!
//! ## Ordering
//!
//! Nodes are grouped into branches. Forward runs every branch in declaration
//! order, backward runs the same sequence reversed. The builder only accepts
//! producers that already exist, so every node's producers run before it and the
//! graph cannot contain a cycle.
//!
//! ```text
//! input ──▶ weights-1 ──▶ activation-1 ──▶ weights-2 ──▶ activation-2 ──▶ (sink)
//! ```

use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayView1};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use super::activation::Activation;
use super::collector::Collector;
use super::edge::{Edge, EdgeId};
use super::filter::{Filter2D, Pool2D, PoolKind};
use super::node::{FunctionNode, InputNode, Node, NodeId, NodeKind, NodePhase, WeightsNode};
use super::optimizer::{OptimizerConfig, WeightsOptimizer};
use crate::checkpoint;
use crate::error::{NetError, NetResult};
use crate::pool::WorkerPool;

/// Incrementally assembles a [`Network`].
///
/// Every `add` method returns the new node's id, to be passed as a producer to
/// later nodes. Nodes go into the current branch; [`branch`](Self::branch) opens
/// the next one.
///
/// # Example
///
/// ```
/// use nodenet::{Activation, NetworkBuilder, OptimizerConfig};
///
/// let mut builder = NetworkBuilder::new("xor").with_seed(7);
/// let input = builder.input("input", 2).unwrap();
/// let hidden = builder
///     .weights("hidden", &[input], 3, true, OptimizerConfig::sgd(0.5))
///     .unwrap();
/// let output = builder.function("sigmoid", &[hidden], Activation::Sigmoid).unwrap();
/// let network = builder.build(output).unwrap();
///
/// assert_eq!(network.input_size(), 2);
/// assert_eq!(network.output_size(), 3);
/// ```
#[derive(Debug)]
pub struct NetworkBuilder {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    branches: Vec<Vec<NodeId>>,
    inputs: Vec<NodeId>,
    names: HashSet<String>,
    pool: Arc<WorkerPool>,
    rng: StdRng,
}

impl NetworkBuilder {
    /// Start a network on a sequential pool with entropy-seeded initialization.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            branches: vec![Vec::new()],
            inputs: Vec::new(),
            names: HashSet::new(),
            pool: Arc::new(WorkerPool::sequential()),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Seed weight initialization for reproducible networks.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Open a new branch; later nodes run after every node added so far.
    pub fn branch(&mut self) -> &mut Self {
        if self.branches.last().map_or(false, |b| !b.is_empty()) {
            self.branches.push(Vec::new());
        }
        self
    }

    /// Add a source node taking `size` values of the network input.
    ///
    /// Input nodes split the network input in the order they are added.
    pub fn input(&mut self, name: &str, size: usize) -> NetResult<NodeId> {
        if size == 0 {
            return Err(NetError::InvalidConfig(format!(
                "input node `{name}` must have a positive width"
            )));
        }
        let id = self.push(name, NodeKind::Input(InputNode::new(size)), &[])?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Add a fully connected weights node with Xavier-uniform initial weights.
    ///
    /// With `bias`, the matrix gets one extra row driven by a constant 1.
    pub fn weights(
        &mut self,
        name: &str,
        from: &[NodeId],
        outputs: usize,
        bias: bool,
        optimizer: OptimizerConfig,
    ) -> NetResult<NodeId> {
        let width = self.producer_width(name, from)?;
        if outputs == 0 {
            return Err(NetError::InvalidConfig(format!(
                "weights node `{name}` must have a positive output width"
            )));
        }

        let rows = width + usize::from(bias);
        let limit = (6.0 / (width + outputs) as f64).sqrt();
        let weights = Array2::random_using((rows, outputs), Uniform::new(-limit, limit), &mut self.rng);
        let optimizer = optimizer.build(rows, outputs)?;

        let node = WeightsNode::new(weights, bias, optimizer)?;
        self.push(name, NodeKind::Weights(node), from)
    }

    pub fn function(&mut self, name: &str, from: &[NodeId], activation: Activation) -> NetResult<NodeId> {
        let width = self.producer_width(name, from)?;
        self.push(name, NodeKind::Function(FunctionNode::new(activation, width)), from)
    }

    /// Add a fixed-kernel filter over the input reshaped to `rows × cols`.
    pub fn filter2d(
        &mut self,
        name: &str,
        from: &[NodeId],
        rows: usize,
        cols: usize,
        kernel: Array2<f64>,
    ) -> NetResult<NodeId> {
        let width = self.producer_width(name, from)?;
        let filter = Filter2D::new(rows, cols, kernel)?;
        if filter.windows().input_size() != width {
            return Err(NetError::shape(
                format!("filter node `{name}` grid"),
                filter.windows().input_size(),
                width,
            ));
        }
        self.push(name, NodeKind::Filter2D(filter), from)
    }

    pub fn pool2d(
        &mut self,
        name: &str,
        from: &[NodeId],
        rows: usize,
        cols: usize,
        window: (usize, usize),
        kind: PoolKind,
    ) -> NetResult<NodeId> {
        let width = self.producer_width(name, from)?;
        let pool = Pool2D::new(rows, cols, window, kind)?;
        if pool.windows().input_size() != width {
            return Err(NetError::shape(
                format!("pool node `{name}` grid"),
                pool.windows().input_size(),
                width,
            ));
        }
        self.push(name, NodeKind::Pool2D(pool), from)
    }

    /// Replace the collector (default: addition) of an existing node.
    pub fn set_collector(&mut self, id: NodeId, collector: Collector) -> NetResult<()> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| NetError::InvalidConfig(format!("unknown node id {}", id.0)))?;
        node.set_collector(collector);
        Ok(())
    }

    /// Validate the graph and attach the sink edge to `output`.
    ///
    /// # Errors
    /// `InvalidConfig` when there is no input node, `output` is unknown, or a node
    /// other than the output feeds nothing; `Collector` when a node's collector
    /// cannot take its number of input edges.
    pub fn build(mut self, output: NodeId) -> NetResult<Network> {
        if self.inputs.is_empty() {
            return Err(NetError::InvalidConfig(format!(
                "network `{}` has no input node",
                self.name
            )));
        }
        if output.0 >= self.nodes.len() {
            return Err(NetError::InvalidConfig(format!(
                "output node id {} is not part of network `{}`",
                output.0, self.name
            )));
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if index != output.0 && node.outputs().is_empty() {
                return Err(NetError::InvalidConfig(format!(
                    "{} node `{}` feeds nothing",
                    node.kind().name(),
                    node.name()
                )));
            }
            if !node.inputs().is_empty() {
                node.collector().coefficients(node.inputs().len())?;
            }
        }

        let sink = EdgeId(self.edges.len());
        self.edges.push(Edge::new(self.nodes[output.0].output_size()));
        self.nodes[output.0].add_output(sink);

        self.branches.retain(|b| !b.is_empty());
        let order: Vec<NodeId> = self.branches.concat();

        debug!(
            "network `{}`: {} nodes in {} branches, {} edges",
            self.name,
            self.nodes.len(),
            self.branches.len(),
            self.edges.len()
        );

        Ok(Network {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            branches: self.branches,
            order,
            inputs: self.inputs,
            output,
            sink,
            pool: self.pool,
        })
    }

    /// Common width of the producers' outputs.
    fn producer_width(&self, name: &str, from: &[NodeId]) -> NetResult<usize> {
        let mut width = None;
        for id in from {
            let node = self.nodes.get(id.0).ok_or_else(|| {
                NetError::InvalidConfig(format!("node `{name}` reads unknown node id {}", id.0))
            })?;
            let size = node.output_size();
            match width {
                None => width = Some(size),
                Some(w) if w != size => {
                    return Err(NetError::shape(format!("inputs of node `{name}`"), w, size))
                }
                Some(_) => {}
            }
        }
        width.ok_or_else(|| {
            NetError::InvalidConfig(format!("node `{name}` needs at least one producer"))
        })
    }

    fn push(&mut self, name: &str, kind: NodeKind, from: &[NodeId]) -> NetResult<NodeId> {
        if !self.names.insert(name.to_string()) {
            return Err(NetError::InvalidConfig(format!(
                "duplicate node name `{name}`"
            )));
        }

        let id = NodeId(self.nodes.len());
        let mut inputs = Vec::with_capacity(from.len());
        for producer in from {
            let edge = EdgeId(self.edges.len());
            self.edges.push(Edge::new(self.nodes[producer.0].output_size()));
            self.nodes[producer.0].add_output(edge);
            inputs.push(edge);
        }

        self.nodes.push(Node::new(name, kind, inputs));
        if let Some(branch) = self.branches.last_mut() {
            branch.push(id);
        }
        Ok(id)
    }
}

/// A validated node graph ready for training or inference.
#[derive(Debug)]
pub struct Network {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    branches: Vec<Vec<NodeId>>,
    /// Branches flattened into execution order.
    order: Vec<NodeId>,
    inputs: Vec<NodeId>,
    output: NodeId,
    sink: EdgeId,
    pool: Arc<WorkerPool>,
}

impl Network {
    /// Build a layered network: `sizes[0]` inputs, then one weights node and one
    /// activation node per following size.
    ///
    /// # Arguments
    /// * `sizes` - Layer widths, input first; at least two entries
    /// * `activation` - Activation applied after every weights node
    /// * `optimizer` - Optimizer of every weights node
    /// * `bias` - Whether weights nodes carry a bias row
    /// * `pool` - Worker pool shared by all nodes
    /// * `seed` - Seed for weight initialization
    ///
    /// # Errors
    /// `InvalidConfig` for fewer than two sizes or a zero width, plus any
    /// optimizer configuration error.
    pub fn feed_forward(
        name: &str,
        sizes: &[usize],
        activation: Activation,
        optimizer: OptimizerConfig,
        bias: bool,
        pool: Arc<WorkerPool>,
        seed: u64,
    ) -> NetResult<Network> {
        if sizes.len() < 2 {
            return Err(NetError::InvalidConfig(format!(
                "a layered network needs at least two sizes, got {sizes:?}"
            )));
        }

        let mut builder = NetworkBuilder::new(name).with_pool(pool).with_seed(seed);
        let mut last = builder.input("input", sizes[0])?;
        for (layer, &size) in sizes.iter().enumerate().skip(1) {
            let weights = builder.weights(&format!("weights-{layer}"), &[last], size, bias, optimizer)?;
            last = builder.function(&format!("activation-{layer}"), &[weights], activation)?;
        }

        let network = builder.build(last)?;
        info!(
            "built network `{}` with layers {:?} ({}, {})",
            network.name,
            sizes,
            activation.name(),
            optimizer.name()
        );
        Ok(network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sum of the input node widths.
    pub fn input_size(&self) -> usize {
        self.inputs.iter().map(|id| self.nodes[id.0].output_size()).sum()
    }

    pub fn output_size(&self) -> usize {
        self.edges[self.sink.0].size()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn branches(&self) -> &[Vec<NodeId>] {
        &self.branches
    }

    pub fn input_nodes(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn output_node(&self) -> NodeId {
        self.output
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name() == name).map(NodeId)
    }

    /// Ids of the weights nodes in execution order.
    pub fn weights_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.nodes[id.0].as_weights().is_some())
            .collect()
    }

    /// # Errors
    /// `InvalidConfig` if `id` is unknown or not a weights node.
    pub fn weights_node(&self, id: NodeId) -> NetResult<&WeightsNode> {
        let node = self
            .nodes
            .get(id.0)
            .ok_or_else(|| NetError::InvalidConfig(format!("unknown node id {}", id.0)))?;
        node.as_weights().ok_or_else(|| {
            NetError::InvalidConfig(format!(
                "{} node `{}` has no weights",
                node.kind().name(),
                node.name()
            ))
        })
    }

    pub(crate) fn weights_node_mut(&mut self, id: NodeId) -> NetResult<&mut WeightsNode> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| NetError::InvalidConfig(format!("unknown node id {}", id.0)))?;
        let label = format!("{} node `{}`", node.kind().name(), node.name());
        node.as_weights_mut()
            .ok_or_else(|| NetError::InvalidConfig(format!("{label} has no weights")))
    }

    pub fn weights(&self, id: NodeId) -> NetResult<&Array2<f64>> {
        Ok(self.weights_node(id)?.weights())
    }

    pub fn optimizer(&self, id: NodeId) -> NetResult<&WeightsOptimizer> {
        Ok(self.weights_node(id)?.optimizer())
    }

    /// Replace a weights node's matrix.
    ///
    /// # Errors
    /// `ShapeMismatch` if the new matrix has a different shape.
    pub fn set_weights(&mut self, id: NodeId, weights: Array2<f64>) -> NetResult<()> {
        self.weights_node_mut(id)?.set_weights(weights)
    }

    /// Run every node in declared order and return the output vector.
    ///
    /// # Errors
    /// `ShapeMismatch` if `input` is not [`input_size`](Self::input_size) wide.
    pub fn forward(&mut self, input: ArrayView1<f64>) -> NetResult<Array1<f64>> {
        let expected = self.input_size();
        if input.len() != expected {
            return Err(NetError::shape("network input", expected, input.len()));
        }

        let mut offset = 0;
        for id in &self.inputs {
            let node = &mut self.nodes[id.0];
            let width = node.output_size();
            if let Some(source) = node.as_input_mut() {
                source.set_values(input.slice(s![offset..offset + width]));
            }
            offset += width;
        }

        for id in &self.order {
            self.nodes[id.0].forward(&mut self.edges, &self.pool)?;
        }
        Ok(self.edges[self.sink.0].read_forward().to_owned())
    }

    /// Seed the output with `seed` (an error signal, typically `target - output`)
    /// and propagate it through every node in reverse order, updating weights.
    ///
    /// # Errors
    /// `ShapeMismatch` for a wrongly sized seed; `NodeState` if forward has not
    /// run since the last backward.
    pub fn backward(&mut self, seed: ArrayView1<f64>) -> NetResult<()> {
        let expected = self.output_size();
        if seed.len() != expected {
            return Err(NetError::shape("backward seed", expected, seed.len()));
        }
        let output = &self.nodes[self.output.0];
        if output.phase() != NodePhase::BackwardReady {
            return Err(NetError::NodeState {
                node: output.name().to_string(),
                actual: output.phase(),
                expected: NodePhase::BackwardReady,
            });
        }

        self.edges[self.sink.0].write_backward(seed);
        for id in self.order.iter().rev() {
            self.nodes[id.0].backward(&mut self.edges, &self.pool)?;
        }
        Ok(())
    }

    /// Forward pass for inference; no node is left waiting for backward.
    pub fn predict(&mut self, input: ArrayView1<f64>) -> NetResult<Array1<f64>> {
        let result = self.forward(input);
        self.reset();
        result
    }

    /// Return every node to idle.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.reset();
        }
    }

    /// Write weights and optimizer state to `path`, recording no completed epochs.
    /// See [`crate::checkpoint`].
    pub fn save(&self, path: impl AsRef<Path>) -> NetResult<()> {
        checkpoint::save_checkpoint(self, path.as_ref(), 0)
    }

    /// Load weights and optimizer state saved by [`save`](Self::save) or a trainer;
    /// returns the completed epochs stored with them.
    pub fn restore(&mut self, path: impl AsRef<Path>) -> NetResult<usize> {
        checkpoint::restore_checkpoint(self, path.as_ref())
    }
}
